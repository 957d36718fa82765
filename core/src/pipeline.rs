//! Pipeline orchestrator: one call per inbound transaction.
//!
//! Order: velocity → rules → AML → ML → aggregate. Each detector's healthy
//! bundle is memoised by `(transaction_id, detector)` before aggregation,
//! so a retried evaluation reuses it instead of counting again. Degraded
//! bundles are not memoised; a retry re-attempts that detector.
//!
//! RULE: `evaluate` always returns a decision. A failing detector becomes a
//! neutral degraded bundle and a reason on the result.

use crate::{
    aml_detector::{AmlDetector, PatternCheck},
    audit::AuditSink,
    config::RiskConfig,
    decision_aggregator::{DecisionAggregator, DecisionResult},
    error::{RiskError, RiskResult},
    event::RiskEvent,
    interfaces::{AccountStore, CounterStore, DecisionStore, PatternStore, RuleStore, TransactionStore},
    ml::{MlScorer, TimedScorer},
    rule_engine::RuleEngine,
    signal::{Detector, SignalBundle},
    store::RiskStore,
    transaction::{AccountRecord, Transaction},
    velocity_engine::VelocityEngine,
};
use std::sync::Arc;

/// Every storage collaborator the pipeline needs.
#[derive(Clone)]
pub struct Collaborators {
    pub transactions: Arc<dyn TransactionStore>,
    pub counters:     Arc<dyn CounterStore>,
    pub rules:        Arc<dyn RuleStore>,
    pub patterns:     Arc<dyn PatternStore>,
    pub accounts:     Arc<dyn AccountStore>,
    pub decisions:    Arc<dyn DecisionStore>,
}

impl Collaborators {
    /// All collaborators backed by one SQLite store.
    pub fn from_store(store: Arc<RiskStore>) -> Self {
        Self {
            transactions: store.clone(),
            counters:     store.clone(),
            rules:        store.clone(),
            patterns:     store.clone(),
            accounts:     store.clone(),
            decisions:    store,
        }
    }
}

pub struct RiskPipeline {
    velocity:     VelocityEngine,
    rules:        RuleEngine,
    aml:          AmlDetector,
    scorer:       TimedScorer,
    aggregator:   DecisionAggregator,
    transactions: Arc<dyn TransactionStore>,
    accounts:     Arc<dyn AccountStore>,
    decisions:    Arc<dyn DecisionStore>,
    audit:        Arc<dyn AuditSink>,
}

impl RiskPipeline {
    pub fn new(
        config: &RiskConfig,
        store: Arc<RiskStore>,
        scorer: Arc<dyn MlScorer>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self::with_collaborators(config, Collaborators::from_store(store), scorer, audit)
    }

    pub fn with_collaborators(
        config: &RiskConfig,
        parts: Collaborators,
        scorer: Arc<dyn MlScorer>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            velocity: VelocityEngine::new(
                config.velocity.clone(),
                parts.counters.clone(),
                parts.rules.clone(),
                audit.clone(),
            ),
            rules: RuleEngine::new(parts.rules.clone(), audit.clone()),
            aml: AmlDetector::new(
                config.aml.clone(),
                parts.patterns.clone(),
                parts.transactions.clone(),
                parts.accounts.clone(),
                audit.clone(),
            ),
            scorer: TimedScorer::new(scorer, config.ml.timeout_ms, config.ml.max_in_flight),
            aggregator: DecisionAggregator::new(config.decision.clone(), parts.decisions.clone()),
            transactions: parts.transactions,
            accounts: parts.accounts,
            decisions: parts.decisions,
            audit,
        }
    }

    /// Decide one transaction. Never fails: partial signal still yields a
    /// decision, with degraded detectors named in `reasons`.
    pub fn evaluate(&self, tx: &Transaction) -> DecisionResult {
        match self.decisions.get_decision(&tx.id) {
            Ok(Some(existing)) if existing.degraded_detectors().is_empty() => {
                log::debug!("txn={} already decided: {}", tx.id, existing.decision.as_str());
                return existing;
            }
            Ok(_) => {}
            Err(e) => log::warn!("txn={} cannot read prior decision: {e}", tx.id),
        }

        if let Err(e) = self.transactions.save_transaction(tx) {
            log::warn!("txn={} not saved to history: {e}", tx.id);
        }

        let bundles: Vec<SignalBundle> = Detector::ALL
            .iter()
            .map(|&detector| self.bundle_for(tx, detector))
            .collect();

        let result = match self.aggregator.decide(tx, &bundles) {
            Ok(result) => result,
            Err(e) => {
                log::warn!("txn={} decision not persisted: {e}", tx.id);
                self.aggregator.fuse(tx, &bundles)
            }
        };

        self.audit.emit(RiskEvent::DecisionRendered {
            transaction_id: tx.id.clone(),
            decision:       result.decision,
            risk_score:     result.risk_score,
            is_flagged:     result.is_flagged,
            reasons:        result.reasons.clone(),
        });
        result
    }

    /// Load a stored transaction and decide it. The only path that surfaces
    /// an error to the caller.
    pub fn evaluate_by_id(&self, transaction_id: &str) -> RiskResult<DecisionResult> {
        let tx = self
            .transactions
            .get_transaction(transaction_id)?
            .ok_or_else(|| RiskError::TransactionNotFound { id: transaction_id.to_string() })?;
        Ok(self.evaluate(&tx))
    }

    pub fn decision(&self, transaction_id: &str) -> RiskResult<Option<DecisionResult>> {
        self.decisions.get_decision(transaction_id)
    }

    /// Register an account and run the sequential-account check against
    /// its ip+device fingerprint. A positive check is recorded for the new user,
    /// once per registration.
    pub fn register_account(&self, account: &AccountRecord) -> RiskResult<Option<PatternCheck>> {
        self.accounts.register_account(account)?;
        let (Some(ip), Some(device)) = (account.ip_address.as_deref(), account.device_id.as_deref()) else {
            return Ok(None);
        };

        let check = self.aml.check_sequential_accounts(ip, device)?;
        if check.is_suspicious {
            self.aml.record_pattern(
                &format!("account:{}", account.user_id),
                &account.user_id,
                check.pattern_type,
                check.evidence.clone(),
                check.risk_score,
                account.created_at,
            )?;
        }
        Ok(Some(check))
    }

    // ── Detector isolation ─────────────────────────────────────

    fn bundle_for(&self, tx: &Transaction, detector: Detector) -> SignalBundle {
        match self.decisions.load_bundle(&tx.id, detector) {
            Ok(Some(bundle)) => {
                log::debug!("txn={} reusing {} bundle", tx.id, detector);
                return bundle;
            }
            Ok(None) => {}
            Err(e) => {
                // Unknown memo state: running again could count twice.
                return self.degrade(tx, detector, &e);
            }
        }

        match self.run_detector(tx, detector) {
            Ok(bundle) => {
                if let Err(e) = self.decisions.save_bundle(&tx.id, &bundle) {
                    log::warn!("txn={} {} bundle not memoised: {e}", tx.id, detector);
                }
                bundle
            }
            Err(e) => self.degrade(tx, detector, &e),
        }
    }

    fn run_detector(&self, tx: &Transaction, detector: Detector) -> RiskResult<SignalBundle> {
        match detector {
            Detector::Velocity => self.velocity.check_velocity(tx),
            Detector::Rule     => self.rules.evaluate_rules(tx),
            Detector::Aml      => self.aml.detect(tx),
            Detector::Ml       => self.scorer.predict(tx).map(|p| p.into_bundle()),
        }
    }

    fn degrade(&self, tx: &Transaction, detector: Detector, error: &RiskError) -> SignalBundle {
        let reason = detector.unavailable_reason();
        log::warn!("txn={} {} degraded: {error}", tx.id, detector);
        self.audit.emit(RiskEvent::DetectorDegraded {
            transaction_id: tx.id.clone(),
            detector:       detector.as_str().to_string(),
            reason:         error.to_string(),
        });
        SignalBundle::degraded(detector, reason)
    }
}
