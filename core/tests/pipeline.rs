//! End-to-end pipeline: degradation, retries, memoisation, lookup by id.

mod common;

use chrono::{DateTime, Utc};
use common::{at, rule, store, tx, velocity_rule};
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use txguard_core::{
    aml_detector::{PatternType, TransactionPattern},
    audit::MemorySink,
    config::RiskConfig,
    decision_aggregator::{Decision, DecisionResult},
    entity_resolver::EntityResolver,
    error::{RiskError, RiskResult},
    event::RiskEvent,
    interfaces::{CounterStore, DecisionStore, PatternStore, TransactionStore},
    ml::{MlPrediction, MlScorer, TimedScorer},
    pipeline::{Collaborators, RiskPipeline},
    signal::{Detector, SignalBundle},
    store::RiskStore,
    transaction::{AccountRecord, Transaction},
    types::{Action, EntityType, Window},
    velocity_engine::{CounterKey, VelocityCounter},
};

// ── Scorer doubles ─────────────────────────────────────────────

struct FixedScorer {
    score: f64,
    fraud: bool,
}

impl MlScorer for FixedScorer {
    fn predict(&self, _tx: &Transaction) -> RiskResult<MlPrediction> {
        Ok(MlPrediction {
            risk_score:    self.score,
            is_fraudulent: self.fraud,
            confidence:    0.8,
            model_name:    "fixed".to_string(),
            model_version: "1".to_string(),
        })
    }
}

struct SlowScorer;

impl MlScorer for SlowScorer {
    fn predict(&self, tx: &Transaction) -> RiskResult<MlPrediction> {
        std::thread::sleep(Duration::from_millis(400));
        FixedScorer { score: 99.0, fraud: true }.predict(tx)
    }
}

/// Fails the first call, then behaves.
#[derive(Default)]
struct FlakyScorer {
    calls: AtomicUsize,
}

impl MlScorer for FlakyScorer {
    fn predict(&self, tx: &Transaction) -> RiskResult<MlPrediction> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(RiskError::MlFailure { reason: "model server reset".to_string() });
        }
        FixedScorer { score: 10.0, fraud: false }.predict(tx)
    }
}

/// Blocks until the gate opens.
struct GatedScorer {
    open: Arc<AtomicBool>,
}

impl MlScorer for GatedScorer {
    fn predict(&self, tx: &Transaction) -> RiskResult<MlPrediction> {
        while !self.open.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(5));
        }
        FixedScorer { score: 20.0, fraud: false }.predict(tx)
    }
}

struct FailingCounters;

impl CounterStore for FailingCounters {
    fn get_or_create(&self, _key: &CounterKey, _now: DateTime<Utc>) -> RiskResult<VelocityCounter> {
        Err(RiskError::DetectorUnavailable {
            detector: "velocity".to_string(),
            reason:   "counter store offline".to_string(),
        })
    }

    fn atomic_update(
        &self,
        _source: &str,
        key: &CounterKey,
        now: DateTime<Utc>,
        _update: &mut dyn FnMut(&mut VelocityCounter),
    ) -> RiskResult<VelocityCounter> {
        self.get_or_create(key, now)
    }
}

/// Delegates to the real store, failing the first update of one entity type.
struct FlakyCounters {
    store:   Arc<RiskStore>,
    fail_on: EntityType,
    failed:  AtomicBool,
}

impl CounterStore for FlakyCounters {
    fn get_or_create(&self, key: &CounterKey, now: DateTime<Utc>) -> RiskResult<VelocityCounter> {
        self.store.get_or_create(key, now)
    }

    fn atomic_update(
        &self,
        source: &str,
        key: &CounterKey,
        now: DateTime<Utc>,
        update: &mut dyn FnMut(&mut VelocityCounter),
    ) -> RiskResult<VelocityCounter> {
        if key.entity_type == self.fail_on && !self.failed.swap(true, Ordering::SeqCst) {
            return Err(RiskError::DetectorUnavailable {
                detector: "velocity".to_string(),
                reason:   "counter shard unreachable".to_string(),
            });
        }
        self.store.atomic_update(source, key, now, update)
    }
}

/// Delegates to the real store, failing the first upsert of one pattern type.
struct FlakyPatterns {
    store:   Arc<RiskStore>,
    fail_on: PatternType,
    failed:  AtomicBool,
}

impl PatternStore for FlakyPatterns {
    fn upsert_pattern(
        &self,
        source: &str,
        user_id: &str,
        pattern_type: PatternType,
        update: &mut dyn FnMut(&mut TransactionPattern),
    ) -> RiskResult<TransactionPattern> {
        if pattern_type == self.fail_on && !self.failed.swap(true, Ordering::SeqCst) {
            return Err(RiskError::DetectorUnavailable {
                detector: "aml".to_string(),
                reason:   "pattern table locked".to_string(),
            });
        }
        self.store.upsert_pattern(source, user_id, pattern_type, update)
    }

    fn get_pattern(&self, user_id: &str, pattern_type: PatternType) -> RiskResult<Option<TransactionPattern>> {
        self.store.get_pattern(user_id, pattern_type)
    }
}

/// Nothing about decisions can be stored or read back.
struct OfflineDecisions;

impl DecisionStore for OfflineDecisions {
    fn upsert_decision(&self, _result: &DecisionResult) -> RiskResult<()> {
        Err(RiskError::Other(anyhow::anyhow!("decision store offline")))
    }

    fn get_decision(&self, _transaction_id: &str) -> RiskResult<Option<DecisionResult>> {
        Ok(None)
    }

    fn load_bundle(&self, _transaction_id: &str, _detector: Detector) -> RiskResult<Option<SignalBundle>> {
        Ok(None)
    }

    fn save_bundle(&self, _transaction_id: &str, _bundle: &SignalBundle) -> RiskResult<()> {
        Err(RiskError::Other(anyhow::anyhow!("decision store offline")))
    }
}

// ── Helpers ────────────────────────────────────────────────────

fn build(store: &Arc<RiskStore>, scorer: Arc<dyn MlScorer>) -> (RiskPipeline, Arc<MemorySink>) {
    let mut config = RiskConfig::default_test();
    config.ml.timeout_ms = 100;
    let sink = Arc::new(MemorySink::new());
    let pipeline = RiskPipeline::new(&config, store.clone(), scorer, sink.clone());
    (pipeline, sink)
}

fn with_parts(parts: Collaborators, scorer: Arc<dyn MlScorer>) -> RiskPipeline {
    RiskPipeline::with_collaborators(&RiskConfig::default_test(), parts, scorer, Arc::new(MemorySink::new()))
}

fn quiet() -> Arc<dyn MlScorer> {
    Arc::new(FixedScorer { score: 5.0, fraud: false })
}

fn user_count(store: &RiskStore, user: &str, window: Window) -> u64 {
    store
        .get_or_create(&CounterKey::new(EntityType::UserId, user), at(0))
        .unwrap()
        .count(window)
}

// ── Tests ──────────────────────────────────────────────────────

#[test]
fn clean_transaction_is_approved_and_persisted() {
    let store = store();
    let (pipeline, sink) = build(&store, quiet());

    let result = pipeline.evaluate(&tx("t-1", "alice", 42.0, at(0)));
    assert_eq!(result.decision, Decision::Approve);
    assert_eq!(result.signal_bundles.len(), 4);
    assert_eq!(result.risk_score, 5.0);

    assert_eq!(pipeline.decision("t-1").unwrap(), Some(result));
    assert!(store.get_transaction("t-1").unwrap().is_some());
    assert!(sink
        .events()
        .iter()
        .any(|e| matches!(e, RiskEvent::DecisionRendered { decision: Decision::Approve, .. })));
}

#[test]
fn sanctioned_country_rule_rejects() {
    let store = store();
    store
        .upsert_rule(&rule(
            "sanctions",
            json!({"kind": "comparison", "field": "country", "op": "in", "value": ["KP"]}),
            Action::Reject,
            95.0,
            100,
        ))
        .unwrap();
    let (pipeline, _) = build(&store, quiet());

    let mut t = tx("t-1", "alice", 42.0, at(0));
    t.location.country = Some("KP".to_string());
    let result = pipeline.evaluate(&t);

    assert_eq!(result.decision, Decision::Reject);
    assert!(result.is_flagged);
    assert!(result.reasons[0].contains("sanctions"), "{:?}", result.reasons);
}

/// ML exceeds its deadline: a decision still comes back from the other
/// detectors, and the reasons say ML was unavailable.
#[test]
fn ml_timeout_degrades_to_remaining_signals() {
    let store = store();
    store
        .upsert_velocity_rule(&velocity_rule("any", EntityType::UserId, Window::OneHour, 0, Action::Alert, 30.0))
        .unwrap();
    let (pipeline, sink) = build(&store, Arc::new(SlowScorer));

    let result = pipeline.evaluate(&tx("t-1", "alice", 42.0, at(0)));

    assert_eq!(result.decision, Decision::Approve, "the slow fraud score must not count");
    assert_eq!(result.risk_score, 30.0);
    assert!(result.reasons.iter().any(|r| r == "ml_unavailable"), "{:?}", result.reasons);
    assert_eq!(result.degraded_detectors(), vec![Detector::Ml]);
    assert!(sink
        .events()
        .iter()
        .any(|e| matches!(e, RiskEvent::DetectorDegraded { detector, .. } if detector == "ml")));
}

#[test]
fn failing_detector_is_isolated() {
    let store = store();
    store
        .upsert_rule(&rule(
            "big",
            json!({"kind": "comparison", "field": "amount", "op": "gt", "value": 1000}),
            Action::Review,
            72.0,
            1,
        ))
        .unwrap();
    let mut parts = Collaborators::from_store(store.clone());
    parts.counters = Arc::new(FailingCounters);
    let pipeline = RiskPipeline::with_collaborators(
        &RiskConfig::default_test(),
        parts,
        quiet(),
        Arc::new(MemorySink::new()),
    );

    let result = pipeline.evaluate(&tx("t-1", "alice", 5_000.0, at(0)));

    assert_eq!(result.decision, Decision::Review);
    assert_eq!(result.degraded_detectors(), vec![Detector::Velocity]);
    assert!(result.reasons.contains(&"velocity_unavailable".to_string()));
    assert!(result.reasons.iter().any(|r| r.starts_with("rule")));
}

/// Re-evaluating a decided transaction returns the stored decision and
/// mutates nothing.
#[test]
fn retry_does_not_double_count() {
    let store = store();
    let (pipeline, _) = build(&store, quiet());
    let mut t = tx("t-1", "alice", 9_500.0, at(0));
    t.purpose = "deposit".to_string();

    let first = pipeline.evaluate(&t);
    let second = pipeline.evaluate(&t);

    assert_eq!(first, second);
    assert_eq!(user_count(&store, "alice", Window::FiveMinutes), 1);
    let pattern = store.get_pattern("alice", PatternType::Structuring).unwrap().unwrap();
    assert_eq!(pattern.occurrence_count, 1);
    assert_eq!(store.decision_count("t-1").unwrap(), 1);
}

/// A degraded decision is re-attempted on retry: the failed detector runs
/// again while memoised counting steps are reused.
#[test]
fn retry_after_degradation_reuses_counting_steps() {
    let store = store();
    let (pipeline, _) = build(&store, Arc::new(FlakyScorer::default()));
    let t = tx("t-1", "alice", 42.0, at(0));

    let first = pipeline.evaluate(&t);
    assert_eq!(first.degraded_detectors(), vec![Detector::Ml]);

    let second = pipeline.evaluate(&t);
    assert!(second.degraded_detectors().is_empty(), "{:?}", second.reasons);
    assert_eq!(second.risk_score, 10.0);
    assert_eq!(user_count(&store, "alice", Window::FiveMinutes), 1, "velocity ran twice");
    assert_eq!(store.decision_count("t-1").unwrap(), 1);
}

/// Velocity fails part way through its entities: counters already bumped
/// for this transaction are not bumped again by the retry.
#[test]
fn partial_velocity_failure_retries_without_double_count() {
    let store = store();
    let mut parts = Collaborators::from_store(store.clone());
    parts.counters = Arc::new(FlakyCounters {
        store:   store.clone(),
        fail_on: EntityType::CardNumber,
        failed:  AtomicBool::new(false),
    });
    let pipeline = with_parts(parts, quiet());
    let t = tx("t-1", "alice", 42.0, at(0));

    let first = pipeline.evaluate(&t);
    assert_eq!(first.degraded_detectors(), vec![Detector::Velocity]);
    assert_eq!(user_count(&store, "alice", Window::FiveMinutes), 1);

    let second = pipeline.evaluate(&t);
    assert!(second.degraded_detectors().is_empty(), "{:?}", second.reasons);
    assert_eq!(user_count(&store, "alice", Window::FiveMinutes), 1, "user counter bumped twice");
    let card = CounterKey::new(EntityType::CardNumber, EntityResolver::resolve(&t)[&EntityType::CardNumber].clone());
    assert_eq!(store.get_or_create(&card, at(0)).unwrap().count(Window::FiveMinutes), 1);
}

/// AML fails on its second pattern: the first pattern's sighting from this
/// transaction is not recorded again by the retry.
#[test]
fn partial_aml_failure_retries_without_double_count() {
    let store = store();
    let mut parts = Collaborators::from_store(store.clone());
    parts.patterns = Arc::new(FlakyPatterns {
        store:   store.clone(),
        fail_on: PatternType::RoundAmount,
        failed:  AtomicBool::new(false),
    });
    let pipeline = with_parts(parts, quiet());
    let mut t = tx("t-1", "alice", 9_500.0, at(0));
    t.purpose = "withdrawal".to_string();

    let first = pipeline.evaluate(&t);
    assert_eq!(first.degraded_detectors(), vec![Detector::Aml]);

    let second = pipeline.evaluate(&t);
    assert!(second.degraded_detectors().is_empty(), "{:?}", second.reasons);
    let structuring = store.get_pattern("alice", PatternType::Structuring).unwrap().unwrap();
    assert_eq!(structuring.occurrence_count, 1, "structuring recorded twice");
    let round = store.get_pattern("alice", PatternType::RoundAmount).unwrap().unwrap();
    assert_eq!(round.occurrence_count, 1);
}

/// Neither bundles nor the decision can be persisted, so every detector runs
/// again on retry; counting still happens once.
#[test]
fn unpersisted_decision_retries_without_double_count() {
    let store = store();
    let mut parts = Collaborators::from_store(store.clone());
    parts.decisions = Arc::new(OfflineDecisions);
    let pipeline = with_parts(parts, quiet());
    let mut t = tx("t-1", "alice", 9_500.0, at(0));
    t.purpose = "deposit".to_string();

    let first = pipeline.evaluate(&t);
    let second = pipeline.evaluate(&t);

    assert_eq!(first.decision, second.decision);
    assert_eq!(first.risk_score, second.risk_score);
    assert_eq!(user_count(&store, "alice", Window::FiveMinutes), 1);
    let pattern = store.get_pattern("alice", PatternType::Structuring).unwrap().unwrap();
    assert_eq!(pattern.occurrence_count, 1);
}

#[test]
fn evaluate_by_id_loads_stored_transaction() {
    let store = store();
    let (pipeline, _) = build(&store, quiet());

    let err = pipeline.evaluate_by_id("missing").unwrap_err();
    assert!(matches!(err, RiskError::TransactionNotFound { ref id } if id == "missing"));

    store.save_transaction(&tx("t-9", "alice", 12.0, at(0))).unwrap();
    let result = pipeline.evaluate_by_id("t-9").unwrap();
    assert_eq!(result.transaction_id, "t-9");
}

#[test]
fn registering_templated_accounts_records_pattern() {
    let store = store();
    let (pipeline, _) = build(&store, quiet());

    let mut last = None;
    for i in 1..=3 {
        last = pipeline
            .register_account(&AccountRecord {
                user_id:    format!("farm-{i}"),
                username:   format!("bonus{i}"),
                email:      Some(format!("bonus{i}@example.com")),
                ip_address: Some("203.0.113.50".to_string()),
                device_id:  Some("device-farm".to_string()),
                created_at: at(i),
            })
            .unwrap();
    }

    assert!(last.map(|c| c.is_suspicious).unwrap_or(false));
    let pattern = store.get_pattern("farm-3", PatternType::SequentialAccounts).unwrap().unwrap();
    assert_eq!(pattern.occurrence_count, 1);
    assert!(store.get_pattern("farm-2", PatternType::SequentialAccounts).unwrap().is_none());
}

/// Suffixes at both ends of the integer range still produce a check result.
#[test]
fn extreme_account_suffixes_do_not_abort_registration() {
    let store = store();
    let (pipeline, _) = build(&store, quiet());

    let mut last = None;
    for (i, name) in ["promo0", "promo5", "promo18446744073709551615"].iter().enumerate() {
        last = pipeline
            .register_account(&AccountRecord {
                user_id:    format!("edge-{i}"),
                username:   name.to_string(),
                email:      None,
                ip_address: Some("203.0.113.77".to_string()),
                device_id:  Some("device-edge".to_string()),
                created_at: at(i as i64),
            })
            .unwrap();
    }

    let check = last.unwrap();
    assert!(check.is_suspicious);
    assert_eq!(check.evidence["consecutive"], json!(false));

    let result = pipeline.evaluate(&{
        let mut t = tx("t-edge", "edge-2", 42.0, at(5));
        t.entity_ids.ip = Some("203.0.113.77".to_string());
        t.entity_ids.device = Some("device-edge".to_string());
        t
    });
    assert!(result.degraded_detectors().is_empty(), "{:?}", result.reasons);
}

/// A hung model holds at most `max_in_flight` workers; further calls fail
/// fast instead of spawning more threads, and slots free up once it recovers.
#[test]
fn hung_scorer_is_capped_in_flight() {
    let open = Arc::new(AtomicBool::new(false));
    let scorer = TimedScorer::new(Arc::new(GatedScorer { open: open.clone() }), 20, 2);
    let t = tx("t-1", "alice", 42.0, at(0));

    for _ in 0..2 {
        assert!(matches!(scorer.predict(&t), Err(RiskError::MlTimeout { timeout_ms: 20 })));
    }
    assert_eq!(scorer.in_flight(), 2);

    assert!(matches!(scorer.predict(&t), Err(RiskError::MlFailure { .. })));
    assert_eq!(scorer.in_flight(), 2);

    open.store(true, Ordering::SeqCst);
    for _ in 0..200 {
        if scorer.in_flight() == 0 {
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(scorer.in_flight(), 0, "abandoned workers must release their slots");
    assert_eq!(scorer.predict(&t).unwrap().risk_score, 20.0);
}
