//! Rule engine: declarative condition/action rules with merchant scoping.
//!
//! Scoping precedence:
//!   1. An excluded merchant never matches, whatever the inclusion list says.
//!   2. A merchant-specific rule with a non-empty inclusion list matches only those merchants.
//!   3. A merchant-specific rule with an empty inclusion list matches every merchant.
//!   4. A rule that is not merchant-specific matches every merchant.
//!
//! Rules run in descending priority, ties broken by name. A malformed
//! condition skips that one rule; the rest still evaluate.

use crate::{
    audit::AuditSink,
    condition::{transaction_fields, Condition, ConditionValues, FieldMap},
    error::{RiskError, RiskResult},
    event::RiskEvent,
    interfaces::RuleStore,
    signal::{Detector, Evidence, SignalBundle},
    transaction::Transaction,
    types::{Action, RiskScore},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

// ── Scope ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "merchants", rename_all = "snake_case")]
pub enum MerchantScope {
    All,
    /// Exclusions are already subtracted.
    Included(BTreeSet<String>),
    AllExcept(BTreeSet<String>),
}

impl MerchantScope {
    /// Normalise the stored list form into an unambiguous scope.
    pub fn from_lists(
        merchant_specific: bool,
        included: &[String],
        excluded: &[String],
    ) -> Self {
        let excluded: BTreeSet<String> = excluded.iter().cloned().collect();
        if merchant_specific && !included.is_empty() {
            let included = included
                .iter()
                .filter(|m| !excluded.contains(*m))
                .cloned()
                .collect();
            return Self::Included(included);
        }
        if excluded.is_empty() {
            Self::All
        } else {
            Self::AllExcept(excluded)
        }
    }

    /// A transaction without a merchant only matches unrestricted scopes.
    pub fn applies_to(&self, merchant_id: Option<&str>) -> bool {
        match (self, merchant_id) {
            (Self::All, _) => true,
            (Self::Included(set), Some(m)) => set.contains(m),
            (Self::Included(_), None) => false,
            (Self::AllExcept(set), Some(m)) => !set.contains(m),
            (Self::AllExcept(_), None) => true,
        }
    }
}

// ── Rules ────────────────────────────────────────────────────────────────────

/// A rule as stored: the condition is still raw JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleRecord {
    pub id:                 String,
    pub name:               String,
    pub condition_json:     String,
    pub action:             Action,
    pub risk_score:         RiskScore,
    pub is_active:          bool,
    pub priority:           i64,
    pub merchant_specific:  bool,
    pub included_merchants: Vec<String>,
    pub excluded_merchants: Vec<String>,
    pub hit_count:          i64,
}

/// A rule ready to evaluate.
#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    pub id:         String,
    pub name:       String,
    pub condition:  Condition,
    pub action:     Action,
    pub risk_score: RiskScore,
    pub is_active:  bool,
    pub priority:   i64,
    pub scope:      MerchantScope,
}

impl Rule {
    /// Parse and statically validate a stored rule.
    pub fn compile(record: &RuleRecord) -> RiskResult<Self> {
        let invalid = |reason: String| RiskError::InvalidCondition {
            rule: record.id.clone(),
            reason,
        };
        let condition = Condition::from_json(&record.condition_json).map_err(|e| invalid(e.to_string()))?;
        condition.validate().map_err(|e| invalid(e.to_string()))?;

        Ok(Self {
            id:         record.id.clone(),
            name:       record.name.clone(),
            condition,
            action:     record.action,
            risk_score: record.risk_score,
            is_active:  record.is_active,
            priority:   record.priority,
            scope:      MerchantScope::from_lists(
                record.merchant_specific,
                &record.included_merchants,
                &record.excluded_merchants,
            ),
        })
    }

    pub fn applies_to(&self, tx: &Transaction) -> bool {
        self.is_active && self.scope.applies_to(tx.merchant_id())
    }
}

/// Descending priority, then name ascending.
pub fn sort_for_evaluation(rules: &mut [Rule]) {
    rules.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.name.cmp(&b.name)));
}

// ── Engine ───────────────────────────────────────────────────────────────────

pub struct RuleEngine {
    rules: Arc<dyn RuleStore>,
    audit: Arc<dyn AuditSink>,
}

impl RuleEngine {
    pub fn new(rules: Arc<dyn RuleStore>, audit: Arc<dyn AuditSink>) -> Self {
        Self { rules, audit }
    }

    /// Load, scope, order and evaluate every active rule.
    pub fn evaluate_rules(&self, tx: &Transaction) -> RiskResult<SignalBundle> {
        let mut rules: Vec<Rule> = self
            .rules
            .active_rules()?
            .iter()
            .filter_map(|record| match Rule::compile(record) {
                Ok(rule) => Some(rule),
                Err(e) => {
                    log::warn!("Skipping rule {}: {e}", record.id);
                    None
                }
            })
            .filter(|rule| rule.applies_to(tx))
            .collect();
        sort_for_evaluation(&mut rules);

        let fields = transaction_fields(tx);
        let evidence = rules
            .iter()
            .filter_map(|rule| self.evaluate_one(tx, rule, &fields))
            .collect();

        Ok(SignalBundle::from_evidence(Detector::Rule, evidence))
    }

    fn evaluate_one(&self, tx: &Transaction, rule: &Rule, fields: &FieldMap) -> Option<Evidence> {
        let mut values = ConditionValues::new();
        match rule.condition.evaluate(fields, &mut values) {
            Ok(true) => {}
            Ok(false) => return None,
            Err(e) => {
                log::warn!("txn={} skipping rule {}: {e}", tx.id, rule.id);
                return None;
            }
        }

        if let Err(e) = self.rules.increment_rule_hit(&tx.id, &rule.id, tx.timestamp) {
            log::warn!("txn={} hit count for rule {} not recorded: {e}", tx.id, rule.id);
        }

        log::info!(
            "txn={} rule {} ({}) triggered: action={} risk={:.1}",
            tx.id,
            rule.id,
            rule.name,
            rule.action.as_str(),
            rule.risk_score
        );

        self.audit.emit(RiskEvent::RuleTriggered {
            transaction_id: tx.id.clone(),
            rule_id:        rule.id.clone(),
            rule_name:      rule.name.clone(),
            action:         rule.action,
            risk_score:     rule.risk_score,
        });

        Some(Evidence {
            source:     rule.id.clone(),
            action:     rule.action,
            risk_score: rule.risk_score,
            detail:     format!("{} (priority {})", rule.name, rule.priority),
            values,
        })
    }
}
