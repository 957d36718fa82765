//! AML pattern detector: each detector, the recording contract, sticky suspicion.

mod common;

use common::{at, store, tx};
use serde_json::json;
use std::sync::Arc;
use txguard_core::{
    aml_detector::{AmlDetector, PatternType},
    audit::MemorySink,
    config::RiskConfig,
    interfaces::{AccountStore, PatternStore, TransactionStore},
    store::RiskStore,
    transaction::{AccountRecord, Transaction},
    types::Action,
};

fn build(store: &Arc<RiskStore>) -> AmlDetector {
    AmlDetector::new(
        RiskConfig::default_test().aml,
        store.clone(),
        store.clone(),
        store.clone(),
        Arc::new(MemorySink::new()),
    )
}

fn with_purpose(mut t: Transaction, purpose: &str) -> Transaction {
    t.purpose = purpose.to_string();
    t
}

/// Three deposits of 9 500 within a day: the third makes structuring suspicious.
#[test]
fn structuring_becomes_suspicious_on_third_occurrence() {
    let store = store();
    let aml = build(&store);

    for i in 0..3 {
        let t = with_purpose(tx(&format!("s-{i}"), "alice", 9_500.0, at(i * 60)), "deposit");
        store.save_transaction(&t).unwrap();
        let bundle = aml.detect(&t).unwrap();

        let evidence = bundle
            .evidence
            .iter()
            .find(|e| e.source == "structuring")
            .expect("structuring evidence");
        let expected = if i < 2 { Action::Alert } else { Action::Flag };
        assert_eq!(evidence.action, expected, "occurrence {}", i + 1);

        let pattern = store.get_pattern("alice", PatternType::Structuring).unwrap().unwrap();
        assert_eq!(pattern.occurrence_count, i + 1);
        assert_eq!(pattern.is_suspicious, i == 2, "occurrence {}", i + 1);
        assert_eq!(pattern.last_detected, Some(at(i * 60)), "stamped with the transaction time");
    }
}

#[test]
fn structuring_band_edges() {
    let store = store();
    let aml = build(&store);

    assert!(aml.check_structuring(&tx("a", "u", 9_000.0, at(0))).is_suspicious);
    assert!(aml.check_structuring(&tx("b", "u", 9_999.99, at(0))).is_suspicious);
    assert!(!aml.check_structuring(&tx("c", "u", 8_999.99, at(0))).is_suspicious);
    assert!(!aml.check_structuring(&tx("d", "u", 10_000.0, at(0))).is_suspicious);
}

/// Suspicion never reverts and the score is a high-water mark.
#[test]
fn suspicion_is_sticky_and_score_is_max() {
    let store = store();
    let aml = build(&store);

    for (i, score) in [40.0, 80.0, 30.0].into_iter().enumerate() {
        aml.record_pattern(&format!("r-{i}"), "bob", PatternType::RoundAmount, json!({"s": score}), score, at(i as i64))
            .unwrap();
    }
    let pattern = aml
        .record_pattern("r-3", "bob", PatternType::RoundAmount, json!({}), 5.0, at(3))
        .unwrap();

    assert_eq!(pattern.occurrence_count, 4);
    assert!(pattern.is_suspicious);
    assert_eq!(pattern.last_detected, Some(at(3)));
    assert_eq!(pattern.risk_score, 80.0);
    assert_eq!(pattern.pattern_data["history"].as_array().map(Vec::len), Some(4));
}

/// A second sighting from the same transaction leaves the row untouched.
#[test]
fn same_source_records_once() {
    let store = store();
    let aml = build(&store);

    let first = aml.record_pattern("t-1", "carol", PatternType::Structuring, json!({}), 70.0, at(0)).unwrap();
    let again = aml.record_pattern("t-1", "carol", PatternType::Structuring, json!({}), 90.0, at(5)).unwrap();

    assert_eq!(first, again);
    assert_eq!(again.occurrence_count, 1);
    assert_eq!(again.risk_score, 70.0);

    let other = aml.record_pattern("t-1", "carol", PatternType::RoundAmount, json!({}), 25.0, at(0)).unwrap();
    assert_eq!(other.occurrence_count, 1, "a different pattern from the same transaction still counts");
}

#[test]
fn round_amount_only_on_outbound() {
    let store = store();
    let aml = build(&store);

    let withdrawal = with_purpose(tx("w", "u", 500.0, at(0)), "withdrawal");
    let purchase = tx("p", "u", 500.0, at(0));
    let odd = with_purpose(tx("o", "u", 512.5, at(0)), "transfer");

    assert!(aml.check_round_amount(&withdrawal).is_suspicious);
    assert!(!aml.check_round_amount(&purchase).is_suspicious);
    assert!(!aml.check_round_amount(&odd).is_suspicious);
}

#[test]
fn rapid_movement_needs_prior_activity() {
    let store = store();
    let aml = build(&store);

    let first_out = with_purpose(tx("out-0", "carol", 6_000.0, at(0)), "withdrawal");
    store.save_transaction(&first_out).unwrap();
    assert!(!aml.check_rapid_movement(&first_out).unwrap().is_suspicious, "no prior activity yet");

    let deposit = with_purpose(tx("in-1", "carol", 7_000.0, at(30)), "deposit");
    store.save_transaction(&deposit).unwrap();
    let out = with_purpose(tx("out-1", "carol", 6_500.0, at(45)), "transfer");
    store.save_transaction(&out).unwrap();

    let check = aml.check_rapid_movement(&out).unwrap();
    assert!(check.is_suspicious);
    assert_eq!(check.evidence["prior_transactions"], json!(2));
    assert_eq!(check.evidence["prior_inbound_amount"], json!(7_000.0));

    let small = with_purpose(tx("out-2", "carol", 100.0, at(50)), "transfer");
    assert!(!aml.check_rapid_movement(&small).unwrap().is_suspicious);
}

#[test]
fn high_risk_jurisdiction_is_case_insensitive() {
    let store = store();
    let aml = build(&store);

    let mut t = tx("t", "u", 10.0, at(0));
    t.location.country = Some("ir".to_string());
    assert!(aml.check_high_risk_jurisdiction(&t).is_suspicious);

    t.location.country = Some("FR".to_string());
    assert!(!aml.check_high_risk_jurisdiction(&t).is_suspicious);
}

#[test]
fn identical_amount_fan_in_counts_distinct_sources() {
    let store = store();
    let aml = build(&store);

    let first = tx("f-1", "dave", 250.0, at(0));
    store.save_transaction(&first).unwrap();
    assert!(!aml.check_identical_amount_fan_in(&first).unwrap().is_suspicious);

    // Same sender again does not add a source.
    let again = tx("f-2", "dave", 250.0, at(5));
    store.save_transaction(&again).unwrap();
    assert!(!aml.check_identical_amount_fan_in(&again).unwrap().is_suspicious);

    let other = tx("f-3", "erin", 250.0, at(10));
    let check = aml.check_identical_amount_fan_in(&other).unwrap();
    assert!(check.is_suspicious);
    assert_eq!(check.evidence["distinct_sources"], json!(2));
}

#[test]
fn multi_transaction_pair_reports_flows() {
    let store = store();
    let aml = build(&store);

    for i in 0..2 {
        store.save_transaction(&tx(&format!("p-{i}"), "frank", 40.0, at(i))).unwrap();
    }
    let third = tx("p-2", "frank", 60.0, at(2));
    let check = aml.check_multi_transaction_pair(&third).unwrap();

    assert!(check.is_suspicious);
    assert_eq!(check.evidence["transaction_count"], json!(3));
    let flow = &check.evidence["flows"][0];
    assert_eq!(flow["from"], json!("frank"));
    assert_eq!(flow["to"], json!("merchant-1"));
    assert_eq!(flow["total_amount"], json!(140.0));
}

#[test]
fn sequential_accounts_on_one_fingerprint() {
    let store = store();
    let aml = build(&store);

    for i in 1..=3 {
        store
            .register_account(&AccountRecord {
                user_id:    format!("u-{i}"),
                username:   format!("promo_user_{i:03}"),
                email:      None,
                ip_address: Some("203.0.113.9".to_string()),
                device_id:  Some("dev-x".to_string()),
                created_at: at(i),
            })
            .unwrap();
    }
    store
        .register_account(&AccountRecord {
            user_id:    "u-real".to_string(),
            username:   "grace".to_string(),
            email:      Some("grace@example.com".to_string()),
            ip_address: Some("203.0.113.9".to_string()),
            device_id:  Some("dev-x".to_string()),
            created_at: at(9),
        })
        .unwrap();

    let check = aml.check_sequential_accounts("203.0.113.9", "dev-x").unwrap();
    assert!(check.is_suspicious);
    assert_eq!(check.evidence["template"], json!("promo_user<n>"));
    assert_eq!(check.evidence["consecutive"], json!(true));
    assert_eq!(check.evidence["accounts"].as_array().map(Vec::len), Some(3));

    assert!(!aml.check_sequential_accounts("203.0.113.9", "dev-y").unwrap().is_suspicious);
}

#[test]
fn detection_without_user_records_nothing() {
    let store = store();
    let aml = build(&store);

    let mut t = with_purpose(tx("anon", "x", 9_500.0, at(0)), "deposit");
    t.entity_ids.user = None;
    let bundle = aml.detect(&t).unwrap();

    assert!(bundle.triggered);
    assert_eq!(bundle.risk_score, 70.0);
    assert!(store.suspicious_patterns().unwrap().is_empty());
    assert!(store.get_pattern("x", PatternType::Structuring).unwrap().is_none());
}
