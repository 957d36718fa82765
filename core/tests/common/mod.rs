//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::Value;
use std::sync::Arc;
use txguard_core::{
    rule_engine::RuleRecord,
    store::RiskStore,
    transaction::{EntityIds, Location, Transaction},
    types::{Action, Channel, EntityType, Window},
    velocity_engine::VelocityRule,
};

pub fn store() -> Arc<RiskStore> {
    let _ = env_logger::builder().is_test(true).try_init();
    let store = RiskStore::in_memory().unwrap();
    store.migrate().unwrap();
    Arc::new(store)
}

/// Minutes after a fixed midday epoch.
pub fn at(minutes: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap() + Duration::minutes(minutes)
}

/// A purchase with every entity populated.
pub fn tx(id: &str, user: &str, amount: f64, when: DateTime<Utc>) -> Transaction {
    Transaction {
        id: id.to_string(),
        entity_ids: EntityIds {
            user:        Some(user.to_string()),
            card_number: Some("4111 1111 1111 1111".to_string()),
            device:      Some(format!("device-{user}")),
            ip:          Some("198.51.100.7".to_string()),
            merchant:    Some("merchant-1".to_string()),
            email:       Some(format!("{user}@example.com")),
        },
        amount,
        currency: "USD".to_string(),
        channel: Channel::Ecommerce,
        purpose: "purchase".to_string(),
        timestamp: when,
        location: Location { country: Some("US".to_string()), city: Some("Austin".to_string()) },
    }
}

pub fn velocity_rule(
    id: &str,
    entity_type: EntityType,
    time_window: Window,
    threshold: u64,
    action: Action,
    risk_score: f64,
) -> VelocityRule {
    VelocityRule {
        id: id.to_string(),
        name: format!("{id} rule"),
        entity_type,
        time_window,
        threshold,
        action,
        risk_score,
        is_active: true,
        applies_to_pos: true,
        applies_to_ecommerce: true,
        applies_to_wallet: true,
        min_amount: None,
        max_amount: None,
        hit_count: 0,
        last_triggered: None,
    }
}

pub fn rule(id: &str, condition: Value, action: Action, risk_score: f64, priority: i64) -> RuleRecord {
    RuleRecord {
        id: id.to_string(),
        name: id.to_string(),
        condition_json: condition.to_string(),
        action,
        risk_score,
        is_active: true,
        priority,
        merchant_specific: false,
        included_merchants: Vec::new(),
        excluded_merchants: Vec::new(),
        hit_count: 0,
    }
}
