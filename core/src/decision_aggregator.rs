//! Decision aggregator: fuses the four signal bundles into one verdict.
//!
//! Fusion, first match wins:
//!   1. Any `reject` evidence                                   → Reject
//!   2. Max risk ≥ review threshold, an escalating trigger,
//!      or a fraudulent ML prediction                           → Review
//!   3. Otherwise                                               → Approve
//!
//! The aggregate risk is the MAXIMUM bundle score. Summing would make the
//! score depend on how finely rules are split.
//!
//! RULE: One stored DecisionResult per transaction id. The write is an
//! upsert; the last write is authoritative.

use crate::{
    config::DecisionConfig,
    error::RiskResult,
    interfaces::DecisionStore,
    signal::{max_risk, Detector, SignalBundle},
    transaction::Transaction,
    types::{Action, RiskScore, TransactionId},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approve,
    Review,
    Reject,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Review  => "review",
            Self::Reject  => "reject",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "approve" => Some(Self::Approve),
            "review"  => Some(Self::Review),
            "reject"  => Some(Self::Reject),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionResult {
    pub transaction_id: TransactionId,
    pub decision:       Decision,
    pub risk_score:     RiskScore,
    pub is_flagged:     bool,
    /// One line per contributing bundle, highest risk first.
    pub reasons:        Vec<String>,
    pub signal_bundles: Vec<SignalBundle>,
}

impl DecisionResult {
    pub fn degraded_detectors(&self) -> Vec<Detector> {
        self.signal_bundles
            .iter()
            .filter(|b| b.is_degraded())
            .map(|b| b.detector)
            .collect()
    }
}

pub struct DecisionAggregator {
    config: DecisionConfig,
    store:  Arc<dyn DecisionStore>,
}

impl DecisionAggregator {
    pub fn new(config: DecisionConfig, store: Arc<dyn DecisionStore>) -> Self {
        Self { config, store }
    }

    /// Fuse and persist. Calling twice with the same inputs leaves one row
    /// holding the same result.
    pub fn decide(&self, tx: &Transaction, bundles: &[SignalBundle]) -> RiskResult<DecisionResult> {
        let result = self.fuse(tx, bundles);
        self.store.upsert_decision(&result)?;
        Ok(result)
    }

    /// Pure fusion step. No storage access.
    pub fn fuse(&self, tx: &Transaction, bundles: &[SignalBundle]) -> DecisionResult {
        let risk_score = max_risk(bundles.iter().map(|b| b.risk_score));

        let has_reject = bundles.iter().any(|b| b.has_action(Action::Reject));
        let escalating = bundles
            .iter()
            .any(|b| b.triggered && b.evidence.iter().any(|e| e.action.escalates()));
        let ml_fraud = bundles
            .iter()
            .any(|b| b.detector == Detector::Ml && b.triggered && !b.is_degraded());

        let decision = if has_reject {
            Decision::Reject
        } else if risk_score >= self.config.review_threshold || escalating || ml_fraud {
            Decision::Review
        } else {
            Decision::Approve
        };

        DecisionResult {
            transaction_id: tx.id.clone(),
            decision,
            risk_score,
            is_flagged: decision != Decision::Approve,
            reasons: reasons(bundles),
            signal_bundles: bundles.to_vec(),
        }
    }
}

/// Contributing bundles (triggered or degraded), highest risk first.
/// Equal scores keep detector order.
fn reasons(bundles: &[SignalBundle]) -> Vec<String> {
    let mut contributing: Vec<&SignalBundle> = bundles
        .iter()
        .filter(|b| b.triggered || b.is_degraded())
        .collect();
    contributing.sort_by(|a, b| {
        b.risk_score
            .total_cmp(&a.risk_score)
            .then(a.detector.cmp(&b.detector))
    });

    contributing
        .into_iter()
        .map(|b| match &b.degraded {
            Some(reason) => reason.clone(),
            None => {
                let details: Vec<&str> = b.evidence.iter().map(|e| e.detail.as_str()).collect();
                format!("{} risk {:.1}: {}", b.detector, b.risk_score, details.join("; "))
            }
        })
        .collect()
}
