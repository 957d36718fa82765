//! Signal bundles: the normalised output of one detector for one transaction.

use crate::types::{Action, RiskScore};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// The four detectors the aggregator fuses. Order is the tie-break order
/// for reasons with equal scores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Detector {
    Velocity,
    Rule,
    Aml,
    Ml,
}

impl Detector {
    pub const ALL: [Detector; 4] = [Self::Velocity, Self::Rule, Self::Aml, Self::Ml];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Velocity => "velocity",
            Self::Rule     => "rule",
            Self::Aml      => "aml",
            Self::Ml       => "ml",
        }
    }

    /// Reason code recorded when this detector could not produce a signal.
    pub fn unavailable_reason(&self) -> &'static str {
        match self {
            Self::Velocity => "velocity_unavailable",
            Self::Rule     => "rule_unavailable",
            Self::Aml      => "aml_unavailable",
            Self::Ml       => "ml_unavailable",
        }
    }
}

impl fmt::Display for Detector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One triggered contribution inside a bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    /// Rule id, pattern type or model name that produced this hit.
    pub source:     String,
    pub action:     Action,
    pub risk_score: RiskScore,
    pub detail:     String,
    /// Literal values compared, kept for audit.
    #[serde(default)]
    pub values:     BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalBundle {
    pub detector:   Detector,
    pub triggered:  bool,
    pub risk_score: RiskScore,
    pub evidence:   Vec<Evidence>,
    /// Set when the detector failed and this is a neutral stand-in.
    #[serde(default)]
    pub degraded:   Option<String>,
}

impl SignalBundle {
    /// An empty, healthy bundle: nothing triggered.
    pub fn quiet(detector: Detector) -> Self {
        Self {
            detector,
            triggered: false,
            risk_score: 0.0,
            evidence: Vec::new(),
            degraded: None,
        }
    }

    /// Neutral "no signal" bundle standing in for a failed detector.
    pub fn degraded(detector: Detector, reason: impl Into<String>) -> Self {
        Self {
            degraded: Some(reason.into()),
            ..Self::quiet(detector)
        }
    }

    /// Build a bundle from triggered evidence. Risk is the maximum, never the sum.
    pub fn from_evidence(detector: Detector, evidence: Vec<Evidence>) -> Self {
        let risk_score = max_risk(evidence.iter().map(|e| e.risk_score));
        Self {
            detector,
            triggered: !evidence.is_empty(),
            risk_score,
            evidence,
            degraded: None,
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.is_some()
    }

    pub fn has_action(&self, action: Action) -> bool {
        self.evidence.iter().any(|e| e.action == action)
    }

    /// Most severe action among the evidence, if any.
    pub fn strongest_action(&self) -> Option<Action> {
        self.evidence.iter().map(|e| e.action).max()
    }
}

/// Max-aggregation shared by every detector and the aggregator.
/// An empty input scores 0.
pub fn max_risk(scores: impl IntoIterator<Item = RiskScore>) -> RiskScore {
    scores.into_iter().fold(0.0, f64::max)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(score: f64) -> Evidence {
        Evidence {
            source: "r".into(),
            action: Action::Alert,
            risk_score: score,
            detail: String::new(),
            values: BTreeMap::new(),
        }
    }

    #[test]
    fn bundle_score_is_max_not_sum() {
        let bundle = SignalBundle::from_evidence(Detector::Rule, vec![hit(40.0), hit(90.0)]);
        assert!(bundle.triggered);
        assert_eq!(bundle.risk_score, 90.0);
    }

    #[test]
    fn degraded_bundle_is_neutral() {
        let bundle = SignalBundle::degraded(Detector::Ml, "ml_unavailable");
        assert!(!bundle.triggered);
        assert_eq!(bundle.risk_score, 0.0);
        assert!(bundle.is_degraded());
    }
}
