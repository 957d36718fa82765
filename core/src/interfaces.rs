//! Collaborator contracts consumed by the pipeline.
//!
//! RULE: Detectors reach storage only through these traits.
//! `store::RiskStore` implements all of them on SQLite; tests swap in
//! failing or slow doubles to exercise degradation.

use crate::{
    aml_detector::{PatternType, TransactionPattern},
    decision_aggregator::DecisionResult,
    error::RiskResult,
    rule_engine::RuleRecord,
    signal::{Detector, SignalBundle},
    transaction::{AccountRecord, Transaction},
    types::EntityType,
    velocity_engine::{CounterKey, VelocityCounter, VelocityRule},
};
use chrono::{DateTime, Utc};

pub trait TransactionStore: Send + Sync {
    fn get_transaction(&self, id: &str) -> RiskResult<Option<Transaction>>;

    /// Idempotent: saving the same id twice keeps the first copy.
    fn save_transaction(&self, tx: &Transaction) -> RiskResult<()>;

    fn user_transactions_since(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
    ) -> RiskResult<Vec<Transaction>>;

    fn merchant_transactions_since(
        &self,
        merchant_id: &str,
        since: DateTime<Utc>,
    ) -> RiskResult<Vec<Transaction>>;

    /// Transactions between `a` and `b` in either direction (user → merchant).
    fn pair_transactions_since(
        &self,
        a: &str,
        b: &str,
        since: DateTime<Utc>,
    ) -> RiskResult<Vec<Transaction>>;
}

pub trait RuleStore: Send + Sync {
    fn active_velocity_rules(&self, entity_type: EntityType) -> RiskResult<Vec<VelocityRule>>;

    fn active_rules(&self) -> RiskResult<Vec<RuleRecord>>;

    /// Atomic `hit_count += 1`, `last_triggered = at`, once per `(source, rule_id)`.
    fn increment_velocity_rule_hit(&self, source: &str, rule_id: &str, at: DateTime<Utc>) -> RiskResult<()>;

    /// Atomic `hit_count += 1`, `last_triggered = at`, once per `(source, rule_id)`.
    fn increment_rule_hit(&self, source: &str, rule_id: &str, at: DateTime<Utc>) -> RiskResult<()>;
}

pub trait CounterStore: Send + Sync {
    fn get_or_create(&self, key: &CounterKey, now: DateTime<Utc>) -> RiskResult<VelocityCounter>;

    /// Fetch-or-create, apply `update`, save, as one atomic unit per key.
    /// Applied at most once per `(source, key)`: a repeat returns the stored
    /// counter unchanged.
    fn atomic_update(
        &self,
        source: &str,
        key: &CounterKey,
        now: DateTime<Utc>,
        update: &mut dyn FnMut(&mut VelocityCounter),
    ) -> RiskResult<VelocityCounter>;
}

pub trait PatternStore: Send + Sync {
    /// Fetch-or-create the `(user_id, pattern_type)` row, apply `update`,
    /// save, as one atomic unit. Applied at most once per `source` and row;
    /// a repeat returns the stored pattern unchanged.
    fn upsert_pattern(
        &self,
        source: &str,
        user_id: &str,
        pattern_type: PatternType,
        update: &mut dyn FnMut(&mut TransactionPattern),
    ) -> RiskResult<TransactionPattern>;

    fn get_pattern(
        &self,
        user_id: &str,
        pattern_type: PatternType,
    ) -> RiskResult<Option<TransactionPattern>>;
}

pub trait AccountStore: Send + Sync {
    fn register_account(&self, account: &AccountRecord) -> RiskResult<()>;

    fn accounts_for_fingerprint(
        &self,
        ip_address: &str,
        device_id: &str,
    ) -> RiskResult<Vec<AccountRecord>>;
}

pub trait DecisionStore: Send + Sync {
    /// Keyed on transaction id. The last write is authoritative.
    fn upsert_decision(&self, result: &DecisionResult) -> RiskResult<()>;

    fn get_decision(&self, transaction_id: &str) -> RiskResult<Option<DecisionResult>>;

    fn load_bundle(&self, transaction_id: &str, detector: Detector) -> RiskResult<Option<SignalBundle>>;

    fn save_bundle(&self, transaction_id: &str, bundle: &SignalBundle) -> RiskResult<()>;
}
