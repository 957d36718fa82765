//! Audit events: everything the pipeline tells the outside world.
//!
//! RULE: Emission is fire-and-forget. The pipeline never depends on an
//! event being delivered; sinks log and swallow their own failures.

use crate::{
    decision_aggregator::Decision,
    types::{Action, RiskScore, TransactionId},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Variants are appended as the pipeline grows; never removed or reordered.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RiskEvent {
    VelocityRuleTriggered {
        transaction_id: TransactionId,
        rule_id:        String,
        entity_type:    String,
        window:         String,
        count:          u64,
        threshold:      u64,
        action:         Action,
        risk_score:     RiskScore,
    },
    RuleTriggered {
        transaction_id: TransactionId,
        rule_id:        String,
        rule_name:      String,
        action:         Action,
        risk_score:     RiskScore,
    },
    PatternRecorded {
        transaction_id:   TransactionId,
        user_id:          String,
        pattern_type:     String,
        occurrence_count: i64,
        is_suspicious:    bool,
        risk_score:       RiskScore,
    },
    DetectorDegraded {
        transaction_id: TransactionId,
        detector:       String,
        reason:         String,
    },
    DecisionRendered {
        transaction_id: TransactionId,
        decision:       Decision,
        risk_score:     RiskScore,
        is_flagged:     bool,
        reasons:        Vec<String>,
    },
}

impl RiskEvent {
    /// Stable name for the `event_type` column in event_log.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::VelocityRuleTriggered { .. } => "velocity_rule_triggered",
            Self::RuleTriggered { .. }         => "rule_triggered",
            Self::PatternRecorded { .. }       => "pattern_recorded",
            Self::DetectorDegraded { .. }      => "detector_degraded",
            Self::DecisionRendered { .. }      => "decision_rendered",
        }
    }

    pub fn transaction_id(&self) -> &str {
        match self {
            Self::VelocityRuleTriggered { transaction_id, .. }
            | Self::RuleTriggered { transaction_id, .. }
            | Self::PatternRecorded { transaction_id, .. }
            | Self::DetectorDegraded { transaction_id, .. }
            | Self::DecisionRendered { transaction_id, .. } => transaction_id,
        }
    }
}

/// The event log entry as persisted to SQLite.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLogEntry {
    pub id:             Option<i64>,
    pub transaction_id: TransactionId,
    pub event_type:     String,
    pub payload:        String, // JSON-serialized RiskEvent
    pub created_at:     DateTime<Utc>,
}
