//! Velocity engine: decaying multi-window counters per entity.
//!
//! Every transaction bumps one counter per resolved entity across all
//! seven windows, then active velocity rules for that entity type are
//! checked against the fresh counts.
//!
//! The counters are DECAYING, not sliding: a window is zeroed only when
//! the gap since the counter's last update exceeds the window length.
//! Steady traffic with gaps shorter than the window never resets it, so
//! counts can exceed what an exact sliding window would report. This is
//! an accepted approximation (see tests/velocity.rs).

use crate::{
    audit::AuditSink,
    config::VelocityConfig,
    entity_resolver::EntityResolver,
    error::RiskResult,
    event::RiskEvent,
    interfaces::{CounterStore, RuleStore},
    signal::{Detector, Evidence, SignalBundle},
    transaction::Transaction,
    types::{Action, Channel, EntityType, RiskScore, Window},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;

// ── Data Structures ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CounterKey {
    pub entity_type:  EntityType,
    pub entity_value: String,
}

impl CounterKey {
    pub fn new(entity_type: EntityType, entity_value: impl Into<String>) -> Self {
        Self { entity_type, entity_value: entity_value.into() }
    }
}

impl std::fmt::Display for CounterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.entity_value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VelocityCounter {
    pub key:          CounterKey,
    /// Indexed by `Window::index()`.
    pub counts:       [u64; 7],
    pub last_updated: DateTime<Utc>,
}

impl VelocityCounter {
    pub fn new(key: CounterKey, now: DateTime<Utc>) -> Self {
        Self { key, counts: [0; 7], last_updated: now }
    }

    pub fn count(&self, window: Window) -> u64 {
        self.counts[window.index()]
    }

    /// Lazy per-window reset, then increment every window by one.
    /// `last_updated` only ever moves forward.
    pub fn record(&mut self, now: DateTime<Utc>) {
        let elapsed = now - self.last_updated;
        for window in Window::ALL {
            if elapsed > window.duration() {
                if self.counts[window.index()] > 0 {
                    log::debug!("{} window {} reset after {}s", self.key, window.label(), elapsed.num_seconds());
                }
                self.counts[window.index()] = 0;
            }
            self.counts[window.index()] += 1;
        }
        if now > self.last_updated {
            self.last_updated = now;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VelocityRule {
    pub id:                   String,
    pub name:                 String,
    pub entity_type:          EntityType,
    pub time_window:          Window,
    /// Triggers when the window count is strictly greater than this.
    pub threshold:            u64,
    pub action:               Action,
    pub risk_score:           RiskScore,
    #[serde(default = "default_true")]
    pub is_active:            bool,
    #[serde(default = "default_true")]
    pub applies_to_pos:       bool,
    #[serde(default = "default_true")]
    pub applies_to_ecommerce: bool,
    #[serde(default = "default_true")]
    pub applies_to_wallet:    bool,
    #[serde(default)]
    pub min_amount:           Option<f64>,
    #[serde(default)]
    pub max_amount:           Option<f64>,
    #[serde(default)]
    pub hit_count:            i64,
    #[serde(default)]
    pub last_triggered:       Option<DateTime<Utc>>,
}

fn default_true() -> bool {
    true
}

impl VelocityRule {
    pub fn applies_to_channel(&self, channel: Channel) -> bool {
        match channel {
            Channel::Pos       => self.applies_to_pos,
            Channel::Ecommerce => self.applies_to_ecommerce,
            Channel::Wallet    => self.applies_to_wallet,
        }
    }

    /// Inclusive `[min_amount, max_amount]`; an open bound always matches.
    pub fn applies_to_amount(&self, amount: f64) -> bool {
        self.min_amount.map_or(true, |min| amount >= min)
            && self.max_amount.map_or(true, |max| amount <= max)
    }

    pub fn applies_to(&self, tx: &Transaction) -> bool {
        self.is_active && self.applies_to_channel(tx.channel) && self.applies_to_amount(tx.amount)
    }
}

// ── Engine ───────────────────────────────────────────────────────────────────

pub struct VelocityEngine {
    config:   VelocityConfig,
    counters: Arc<dyn CounterStore>,
    rules:    Arc<dyn RuleStore>,
    audit:    Arc<dyn AuditSink>,
}

impl VelocityEngine {
    pub fn new(
        config: VelocityConfig,
        counters: Arc<dyn CounterStore>,
        rules: Arc<dyn RuleStore>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self { config, counters, rules, audit }
    }

    /// Bump counters for every resolved entity and evaluate velocity rules.
    ///
    /// Counter mutation happens on every call, whether or not a rule fires,
    /// and at most once per transaction and counter: a retry after a partial
    /// failure reads the already-bumped counters instead of bumping again.
    /// A counter-store failure fails the whole call; the pipeline degrades it.
    pub fn check_velocity(&self, tx: &Transaction) -> RiskResult<SignalBundle> {
        let entities = EntityResolver::resolve(tx);
        let now = tx.timestamp;
        let mut evidence = Vec::new();

        for (entity_type, entity_value) in entities {
            if !self.config.tracked_entities.contains(&entity_type) {
                continue;
            }

            let key = CounterKey::new(entity_type, entity_value);
            let counter =
                self.counters.atomic_update(&tx.id, &key, now, &mut |c: &mut VelocityCounter| c.record(now))?;

            let rules = self.rules.active_velocity_rules(entity_type)?;
            for rule in rules.iter().filter(|r| r.applies_to(tx)) {
                let count = counter.count(rule.time_window);
                if count <= rule.threshold {
                    continue;
                }
                evidence.push(self.trigger(tx, rule, &key, count));
            }
        }

        Ok(SignalBundle::from_evidence(Detector::Velocity, evidence))
    }

    fn trigger(&self, tx: &Transaction, rule: &VelocityRule, key: &CounterKey, count: u64) -> Evidence {
        if let Err(e) = self.rules.increment_velocity_rule_hit(&tx.id, &rule.id, tx.timestamp) {
            log::warn!("txn={} hit count for velocity rule {} not recorded: {e}", tx.id, rule.id);
        }

        log::info!(
            "txn={} velocity rule {} triggered: {} count[{}]={} > {}",
            tx.id,
            rule.id,
            key.entity_type,
            rule.time_window.label(),
            count,
            rule.threshold
        );

        self.audit.emit(RiskEvent::VelocityRuleTriggered {
            transaction_id: tx.id.clone(),
            rule_id:        rule.id.clone(),
            entity_type:    key.entity_type.to_string(),
            window:         rule.time_window.label().to_string(),
            count,
            threshold:      rule.threshold,
            action:         rule.action,
            risk_score:     rule.risk_score,
        });

        let mut values = BTreeMap::new();
        values.insert("entity_type".to_string(), json!(key.entity_type.as_str()));
        values.insert("window".to_string(), json!(rule.time_window.label()));
        values.insert("count".to_string(), json!(count));
        values.insert("threshold".to_string(), json!(rule.threshold));

        Evidence {
            source:     rule.id.clone(),
            action:     rule.action,
            risk_score: rule.risk_score,
            detail:     format!(
                "{}: {} transactions per {} on {} (limit {})",
                rule.name,
                count,
                rule.time_window.label(),
                key.entity_type,
                rule.threshold
            ),
            values,
        }
    }
}
