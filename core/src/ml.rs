//! ML scoring seam. The pipeline sees a model only through `MlScorer`.
//!
//! `TimedScorer` bounds any scorer by a deadline: the prediction runs on a
//! worker thread and the caller stops waiting after `timeout_ms`. A late
//! result is dropped with the channel. Workers are capped; once the cap is
//! reached a call fails immediately and the pipeline degrades ML.

use crate::{
    error::{RiskError, RiskResult},
    signal::{Detector, Evidence, SignalBundle},
    transaction::Transaction,
    types::{Action, RiskScore, MAX_RISK_SCORE},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MlPrediction {
    pub risk_score:    RiskScore,
    pub is_fraudulent: bool,
    pub confidence:    f64,
    pub model_name:    String,
    pub model_version: String,
}

impl MlPrediction {
    /// Fraudulent predictions ask for review; others only contribute score.
    pub fn into_bundle(self) -> SignalBundle {
        let risk_score = self.risk_score.clamp(0.0, MAX_RISK_SCORE);
        let mut values = BTreeMap::new();
        values.insert("confidence".to_string(), json!(self.confidence));
        values.insert("model_version".to_string(), json!(self.model_version));
        values.insert("is_fraudulent".to_string(), json!(self.is_fraudulent));

        let evidence = Evidence {
            source:     self.model_name.clone(),
            action:     if self.is_fraudulent { Action::Review } else { Action::Alert },
            risk_score,
            detail:     format!(
                "model {} v{} scored {:.1} (confidence {:.2})",
                self.model_name, self.model_version, risk_score, self.confidence
            ),
            values,
        };

        SignalBundle {
            detector:   Detector::Ml,
            triggered:  self.is_fraudulent,
            risk_score,
            evidence:   vec![evidence],
            degraded:   None,
        }
    }
}

pub trait MlScorer: Send + Sync {
    fn predict(&self, tx: &Transaction) -> RiskResult<MlPrediction>;
}

/// Runs the inner scorer on a worker thread with a deadline.
///
/// A timed-out worker keeps its slot until the inner scorer returns, so a
/// hung model holds at most `max_in_flight` threads.
pub struct TimedScorer {
    inner:         Arc<dyn MlScorer>,
    timeout_ms:    u64,
    max_in_flight: usize,
    in_flight:     Arc<AtomicUsize>,
}

impl TimedScorer {
    pub fn new(inner: Arc<dyn MlScorer>, timeout_ms: u64, max_in_flight: usize) -> Self {
        Self {
            inner,
            timeout_ms,
            max_in_flight: max_in_flight.max(1),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Workers still running, including abandoned ones.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    fn acquire(&self) -> Option<Slot> {
        self.in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < self.max_in_flight).then_some(n + 1)
            })
            .ok()
            .map(|_| Slot(Arc::clone(&self.in_flight)))
    }
}

/// Releases one in-flight slot when the worker finishes.
struct Slot(Arc<AtomicUsize>);

impl Drop for Slot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MlScorer for TimedScorer {
    fn predict(&self, tx: &Transaction) -> RiskResult<MlPrediction> {
        let slot = self.acquire().ok_or_else(|| RiskError::MlFailure {
            reason: format!("{} predictions already in flight", self.max_in_flight),
        })?;
        let (sender, receiver) = mpsc::channel();
        let inner = Arc::clone(&self.inner);
        let tx_owned = tx.clone();

        thread::Builder::new()
            .name(format!("ml-{}", tx.id))
            .spawn(move || {
                let _slot = slot;
                // The receiver may be gone after a timeout.
                let _ = sender.send(inner.predict(&tx_owned));
            })
            .map_err(|e| RiskError::MlFailure { reason: format!("cannot spawn scorer: {e}") })?;

        match receiver.recv_timeout(Duration::from_millis(self.timeout_ms)) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                Err(RiskError::MlTimeout { timeout_ms: self.timeout_ms })
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(RiskError::MlFailure {
                reason: "scorer thread exited without a result".to_string(),
            }),
        }
    }
}

// ── Heuristic model ──────────────────────────────────────────────────────────

const HEURISTIC_FRAUD_CUTOFF: f64 = 75.0;

/// Deterministic stand-in model used by the runner and tests.
/// Scores on amount, late-night hours and cross-border wallet traffic.
pub struct HeuristicScorer {
    pub home_country: String,
}

impl Default for HeuristicScorer {
    fn default() -> Self {
        Self { home_country: "US".to_string() }
    }
}

impl MlScorer for HeuristicScorer {
    fn predict(&self, tx: &Transaction) -> RiskResult<MlPrediction> {
        use chrono::Timelike;

        let mut score = (tx.amount.max(0.0) + 1.0).log10() * 12.0;
        let hour = tx.timestamp.hour();
        if hour < 5 {
            score += 15.0;
        }
        let foreign = tx.country().is_some_and(|c| !c.eq_ignore_ascii_case(&self.home_country));
        if foreign {
            score += 10.0;
            if tx.channel == crate::types::Channel::Wallet {
                score += 10.0;
            }
        }
        let risk_score = score.clamp(0.0, MAX_RISK_SCORE);

        Ok(MlPrediction {
            risk_score,
            is_fraudulent: risk_score >= HEURISTIC_FRAUD_CUTOFF,
            confidence: 0.6,
            model_name: "heuristic".to_string(),
            model_version: "1".to_string(),
        })
    }
}
