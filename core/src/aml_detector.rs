//! AML pattern detector: stateful behavioural patterns per user.
//!
//! Detectors:
//!   - Structuring (amount just under the reporting threshold)
//!   - Round amounts on withdrawals and transfers
//!   - Rapid movement (large outbound shortly after other activity)
//!   - High-risk jurisdiction
//!   - Identical-amount fan-in (several sources, one merchant, same amount)
//!   - Multi-transaction pairs (repeated flows between two entities)
//!   - Sequential account generation (templated usernames on one ip+device)
//!
//! RULE: `record_pattern` is the only place AML state changes.

use crate::{
    audit::AuditSink,
    config::AmlConfig,
    error::RiskResult,
    event::RiskEvent,
    interfaces::{AccountStore, PatternStore, TransactionStore},
    signal::{Detector, Evidence, SignalBundle},
    transaction::{AccountRecord, Transaction},
    types::{Action, RiskScore},
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Evidence entries kept per pattern row; older ones are dropped.
const PATTERN_HISTORY_LIMIT: usize = 20;

// ── Data Structures ──────────────────────────────────────────────────────────

/// NEVER rename: the string form is half of the pattern row key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternType {
    Structuring,
    RoundAmount,
    RapidMovement,
    HighRiskJurisdiction,
    IdenticalAmountFanIn,
    MultiTransactionPair,
    SequentialAccounts,
}

impl PatternType {
    pub const ALL: [PatternType; 7] = [
        Self::Structuring,
        Self::RoundAmount,
        Self::RapidMovement,
        Self::HighRiskJurisdiction,
        Self::IdenticalAmountFanIn,
        Self::MultiTransactionPair,
        Self::SequentialAccounts,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Structuring          => "structuring",
            Self::RoundAmount          => "round_amount",
            Self::RapidMovement        => "rapid_movement",
            Self::HighRiskJurisdiction => "high_risk_jurisdiction",
            Self::IdenticalAmountFanIn => "identical_amount_fan_in",
            Self::MultiTransactionPair => "multi_transaction_pair",
            Self::SequentialAccounts   => "sequential_accounts",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|p| p.as_str() == s)
    }
}

/// At most one row per `(user_id, pattern_type)`; updated, never replaced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionPattern {
    pub user_id:          String,
    pub pattern_type:     PatternType,
    pub pattern_data:     Value,
    pub occurrence_count: i64,
    /// High-water mark.
    pub risk_score:       RiskScore,
    /// Sticky: once true, stays true.
    pub is_suspicious:    bool,
    pub last_detected:    Option<DateTime<Utc>>,
}

impl TransactionPattern {
    pub fn new(user_id: impl Into<String>, pattern_type: PatternType) -> Self {
        Self {
            user_id: user_id.into(),
            pattern_type,
            pattern_data: json!({ "history": [] }),
            occurrence_count: 0,
            risk_score: 0.0,
            is_suspicious: false,
            last_detected: None,
        }
    }

    fn push_history(&mut self, evidence: Value) {
        if !self.pattern_data.is_object() {
            self.pattern_data = json!({});
        }
        let history = self.pattern_data
            .as_object_mut()
            .map(|o| o.entry("history").or_insert_with(|| json!([])));
        if let Some(Value::Array(items)) = history {
            items.push(evidence);
            if items.len() > PATTERN_HISTORY_LIMIT {
                let excess = items.len() - PATTERN_HISTORY_LIMIT;
                items.drain(..excess);
            }
        }
    }
}

/// Outcome of one detector for one key.
#[derive(Debug, Clone, PartialEq)]
pub struct PatternCheck {
    pub pattern_type:  PatternType,
    pub is_suspicious: bool,
    pub risk_score:    RiskScore,
    pub evidence:      Value,
}

impl PatternCheck {
    fn clear(pattern_type: PatternType) -> Self {
        Self { pattern_type, is_suspicious: false, risk_score: 0.0, evidence: Value::Null }
    }

    fn hit(pattern_type: PatternType, risk_score: RiskScore, evidence: Value) -> Self {
        Self { pattern_type, is_suspicious: true, risk_score, evidence }
    }
}

// ── Detector ─────────────────────────────────────────────────────────────────

pub struct AmlDetector {
    config:       AmlConfig,
    patterns:     Arc<dyn PatternStore>,
    transactions: Arc<dyn TransactionStore>,
    accounts:     Arc<dyn AccountStore>,
    audit:        Arc<dyn AuditSink>,
}

impl AmlDetector {
    pub fn new(
        config: AmlConfig,
        patterns: Arc<dyn PatternStore>,
        transactions: Arc<dyn TransactionStore>,
        accounts: Arc<dyn AccountStore>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self { config, patterns, transactions, accounts, audit }
    }

    /// Run every detector, record positives, and fold them into one bundle.
    pub fn detect(&self, tx: &Transaction) -> RiskResult<SignalBundle> {
        let mut checks = vec![
            self.check_structuring(tx),
            self.check_round_amount(tx),
            self.check_rapid_movement(tx)?,
            self.check_high_risk_jurisdiction(tx),
            self.check_identical_amount_fan_in(tx)?,
            self.check_multi_transaction_pair(tx)?,
        ];
        if let (Some(ip), Some(device)) = (tx.ip_address(), tx.device_id()) {
            checks.push(self.check_sequential_accounts(ip, device)?);
        }

        let mut evidence = Vec::new();
        for check in checks.into_iter().filter(|c| c.is_suspicious) {
            let action = match tx.user_id() {
                Some(user_id) => {
                    let pattern = self.record_pattern(
                        &tx.id,
                        user_id,
                        check.pattern_type,
                        check.evidence.clone(),
                        check.risk_score,
                        tx.timestamp,
                    )?;
                    self.audit.emit(RiskEvent::PatternRecorded {
                        transaction_id:   tx.id.clone(),
                        user_id:          user_id.to_string(),
                        pattern_type:     check.pattern_type.as_str().to_string(),
                        occurrence_count: pattern.occurrence_count,
                        is_suspicious:    pattern.is_suspicious,
                        risk_score:       pattern.risk_score,
                    });
                    // A confirmed pattern escalates; a first sighting only alerts.
                    if pattern.is_suspicious { Action::Flag } else { Action::Alert }
                }
                None => Action::Alert,
            };

            let mut values = BTreeMap::new();
            values.insert("evidence".to_string(), check.evidence.clone());
            evidence.push(Evidence {
                source:     check.pattern_type.as_str().to_string(),
                action,
                risk_score: check.risk_score,
                detail:     format!("AML pattern {} detected", check.pattern_type.as_str()),
                values,
            });
        }

        Ok(SignalBundle::from_evidence(Detector::Aml, evidence))
    }

    /// Upsert the pattern row: count +1, score high-water mark,
    /// suspicious once the count reaches the configured occurrences.
    ///
    /// `source` is the transaction (or registration) behind the sighting; a
    /// second call with the same source leaves the row as it is.
    /// `detected_at` never moves `last_detected` backwards.
    pub fn record_pattern(
        &self,
        source: &str,
        user_id: &str,
        pattern_type: PatternType,
        evidence: Value,
        risk_score: RiskScore,
        detected_at: DateTime<Utc>,
    ) -> RiskResult<TransactionPattern> {
        let threshold = self.config.suspicious_occurrences;
        let mut sighting = |p: &mut TransactionPattern| {
            p.occurrence_count += 1;
            p.risk_score = p.risk_score.max(risk_score);
            if p.occurrence_count >= threshold {
                p.is_suspicious = true;
            }
            p.last_detected = Some(p.last_detected.map_or(detected_at, |t| t.max(detected_at)));
            p.push_history(evidence.clone());
        };
        let pattern = self.patterns.upsert_pattern(source, user_id, pattern_type, &mut sighting)?;

        if pattern.is_suspicious {
            log::warn!(
                "user={} pattern {} suspicious ({} occurrences, risk {:.1})",
                user_id,
                pattern_type.as_str(),
                pattern.occurrence_count,
                pattern.risk_score
            );
        }
        Ok(pattern)
    }

    // ── Individual detectors ─────────────────────────────────────────────────

    /// Amount in `[threshold × band, threshold)`.
    pub fn check_structuring(&self, tx: &Transaction) -> PatternCheck {
        let ceiling = self.config.reporting_threshold;
        let floor = ceiling * self.config.structuring_band;
        if tx.amount >= floor && tx.amount < ceiling {
            PatternCheck::hit(
                PatternType::Structuring,
                self.config.structuring_risk,
                json!({
                    "transaction_id": tx.id,
                    "amount": tx.amount,
                    "band": [floor, ceiling],
                }),
            )
        } else {
            PatternCheck::clear(PatternType::Structuring)
        }
    }

    /// Whole multiples of the round unit, on outbound purposes only.
    pub fn check_round_amount(&self, tx: &Transaction) -> PatternCheck {
        let unit = self.config.round_unit;
        let is_round = tx.amount > 0.0 && (tx.amount % unit).abs() < 1e-9;
        if tx.is_outbound() && is_round {
            PatternCheck::hit(
                PatternType::RoundAmount,
                self.config.round_amount_risk,
                json!({
                    "transaction_id": tx.id,
                    "amount": tx.amount,
                    "round_unit": unit,
                    "purpose": tx.purpose,
                }),
            )
        } else {
            PatternCheck::clear(PatternType::RoundAmount)
        }
    }

    /// Large outbound with other account activity inside the window.
    pub fn check_rapid_movement(&self, tx: &Transaction) -> RiskResult<PatternCheck> {
        let clear = PatternCheck::clear(PatternType::RapidMovement);
        if !tx.is_outbound() || tx.amount <= self.config.rapid_movement_threshold {
            return Ok(clear);
        }
        let Some(user_id) = tx.user_id() else {
            return Ok(clear);
        };

        let window = Duration::minutes(self.config.rapid_movement_window_minutes);
        let prior: Vec<Transaction> = self
            .transactions
            .user_transactions_since(user_id, tx.timestamp - window)?
            .into_iter()
            .filter(|t| t.id != tx.id && t.timestamp <= tx.timestamp)
            .collect();
        if prior.is_empty() {
            return Ok(clear);
        }

        let inbound: f64 = prior.iter().filter(|t| !t.is_outbound()).map(|t| t.amount).sum();
        Ok(PatternCheck::hit(
            PatternType::RapidMovement,
            self.config.rapid_movement_risk,
            json!({
                "transaction_id": tx.id,
                "amount": tx.amount,
                "prior_transactions": prior.len(),
                "prior_inbound_amount": inbound,
                "window_minutes": self.config.rapid_movement_window_minutes,
            }),
        ))
    }

    pub fn check_high_risk_jurisdiction(&self, tx: &Transaction) -> PatternCheck {
        match tx.country() {
            Some(country) if self.config.high_risk_countries.contains(&country.to_ascii_uppercase()) => {
                PatternCheck::hit(
                    PatternType::HighRiskJurisdiction,
                    self.config.high_risk_jurisdiction_risk,
                    json!({ "transaction_id": tx.id, "country": country }),
                )
            }
            _ => PatternCheck::clear(PatternType::HighRiskJurisdiction),
        }
    }

    /// At least `fan_in_min_sources` distinct users sent this exact amount
    /// to this merchant inside the lookback.
    pub fn check_identical_amount_fan_in(&self, tx: &Transaction) -> RiskResult<PatternCheck> {
        let clear = PatternCheck::clear(PatternType::IdenticalAmountFanIn);
        let Some(merchant_id) = tx.merchant_id() else {
            return Ok(clear);
        };

        let since = tx.timestamp - Duration::hours(self.config.fan_in_lookback_hours);
        let history = with_current(self.transactions.merchant_transactions_since(merchant_id, since)?, tx);

        let target = to_cents(tx.amount);
        let sources: BTreeSet<&str> = history
            .iter()
            .filter(|t| to_cents(t.amount) == target)
            .filter_map(|t| t.user_id())
            .collect();

        if sources.len() < self.config.fan_in_min_sources {
            return Ok(clear);
        }
        Ok(PatternCheck::hit(
            PatternType::IdenticalAmountFanIn,
            self.config.fan_in_risk,
            json!({
                "merchant_id": merchant_id,
                "amount": tx.amount,
                "distinct_sources": sources.len(),
                "sources": sources,
                "lookback_hours": self.config.fan_in_lookback_hours,
            }),
        ))
    }

    /// At least `pair_min_transactions` between the same two entities,
    /// reported per direction with counts and summed amounts.
    pub fn check_multi_transaction_pair(&self, tx: &Transaction) -> RiskResult<PatternCheck> {
        let clear = PatternCheck::clear(PatternType::MultiTransactionPair);
        let (Some(user_id), Some(merchant_id)) = (tx.user_id(), tx.merchant_id()) else {
            return Ok(clear);
        };

        let since = tx.timestamp - Duration::hours(self.config.pair_lookback_hours);
        let history = with_current(
            self.transactions.pair_transactions_since(user_id, merchant_id, since)?,
            tx,
        );
        if history.len() < self.config.pair_min_transactions {
            return Ok(clear);
        }

        let mut directions: BTreeMap<(String, String), (usize, f64)> = BTreeMap::new();
        for t in &history {
            let (Some(from), Some(to)) = (t.user_id(), t.merchant_id()) else {
                continue;
            };
            let slot = directions.entry((from.to_string(), to.to_string())).or_insert((0, 0.0));
            slot.0 += 1;
            slot.1 += t.amount;
        }
        let flows: Vec<Value> = directions
            .into_iter()
            .map(|((from, to), (count, total))| {
                json!({ "from": from, "to": to, "transaction_count": count, "total_amount": total })
            })
            .collect();

        Ok(PatternCheck::hit(
            PatternType::MultiTransactionPair,
            self.config.pair_risk,
            json!({
                "entities": [user_id, merchant_id],
                "transaction_count": history.len(),
                "flows": flows,
                "lookback_hours": self.config.pair_lookback_hours,
            }),
        ))
    }

    /// At least `sequential_min_accounts` accounts on one ip+device whose
    /// usernames or email local parts share a prefix with numeric suffixes.
    pub fn check_sequential_accounts(&self, ip_address: &str, device_id: &str) -> RiskResult<PatternCheck> {
        let clear = PatternCheck::clear(PatternType::SequentialAccounts);
        let accounts = self.accounts.accounts_for_fingerprint(ip_address, device_id)?;
        if accounts.len() < self.config.sequential_min_accounts {
            return Ok(clear);
        }

        let Some(group) = largest_template_group(&accounts) else {
            return Ok(clear);
        };
        if group.user_ids.len() < self.config.sequential_min_accounts {
            return Ok(clear);
        }

        Ok(PatternCheck::hit(
            PatternType::SequentialAccounts,
            self.config.sequential_risk,
            json!({
                "ip_address": ip_address,
                "device_id": device_id,
                "template": format!("{}<n>", group.prefix),
                "accounts": group.user_ids,
                "suffixes": group.suffixes,
                "consecutive": group.is_consecutive(),
            }),
        ))
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

/// History plus the transaction under evaluation, without duplicating it.
fn with_current(mut history: Vec<Transaction>, tx: &Transaction) -> Vec<Transaction> {
    if !history.iter().any(|t| t.id == tx.id) {
        history.push(tx.clone());
    }
    history
}

/// Exact-amount comparison without float noise.
fn to_cents(amount: f64) -> i64 {
    (amount * 100.0).round() as i64
}

#[derive(Debug, Default)]
struct TemplateGroup {
    prefix:   String,
    user_ids: BTreeSet<String>,
    suffixes: BTreeSet<u64>,
}

impl TemplateGroup {
    fn is_consecutive(&self) -> bool {
        match (self.suffixes.first(), self.suffixes.last()) {
            (Some(lo), Some(hi)) => (hi - lo)
                .checked_add(1)
                .map_or(false, |span| span == self.suffixes.len() as u64),
            _ => false,
        }
    }
}

/// Split "alice_007" into ("alice", 7). Names without a numeric suffix
/// or without a prefix do not follow a template.
fn split_template(name: &str) -> Option<(String, u64)> {
    let name = name.trim().to_ascii_lowercase();
    let digits_at = name.trim_end_matches(|c: char| c.is_ascii_digit()).len();
    if digits_at == name.len() {
        return None;
    }
    let suffix: u64 = name[digits_at..].parse().ok()?;
    let prefix = name[..digits_at].trim_end_matches(&['_', '.', '-'][..]);
    if prefix.is_empty() {
        return None;
    }
    Some((prefix.to_string(), suffix))
}

fn largest_template_group(accounts: &[AccountRecord]) -> Option<TemplateGroup> {
    let mut groups: BTreeMap<String, TemplateGroup> = BTreeMap::new();
    for account in accounts {
        let email_local = account
            .email
            .as_deref()
            .and_then(|e| e.split('@').next())
            .unwrap_or_default();
        // Username and email are separate templates; an account counts once per template.
        for candidate in [account.username.as_str(), email_local] {
            if let Some((prefix, suffix)) = split_template(candidate) {
                let group = groups.entry(prefix.clone()).or_insert_with(|| TemplateGroup {
                    prefix,
                    ..TemplateGroup::default()
                });
                group.user_ids.insert(account.user_id.clone());
                group.suffixes.insert(suffix);
            }
        }
    }
    groups.into_values().max_by_key(|g| g.user_ids.len())
}
