use super::{bad_column, json_column, to_millis, RiskStore};
use crate::{
    decision_aggregator::{Decision, DecisionResult},
    error::RiskResult,
    interfaces::DecisionStore,
    signal::{Detector, SignalBundle},
};
use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use std::collections::BTreeMap;

impl DecisionStore for RiskStore {
    fn upsert_decision(&self, result: &DecisionResult) -> RiskResult<()> {
        let now = to_millis(Utc::now());
        self.conn()?.execute(
            "INSERT INTO decision_result (
                transaction_id, decision, risk_score, is_flagged, reasons, signal_bundles,
                created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
            ON CONFLICT(transaction_id) DO UPDATE SET
                decision = excluded.decision,
                risk_score = excluded.risk_score,
                is_flagged = excluded.is_flagged,
                reasons = excluded.reasons,
                signal_bundles = excluded.signal_bundles,
                updated_at = excluded.updated_at",
            params![
                result.transaction_id,
                result.decision.as_str(),
                result.risk_score,
                result.is_flagged,
                serde_json::to_string(&result.reasons)?,
                serde_json::to_string(&result.signal_bundles)?,
                now,
            ],
        )?;
        Ok(())
    }

    fn get_decision(&self, transaction_id: &str) -> RiskResult<Option<DecisionResult>> {
        let result = self
            .conn()?
            .query_row(
                "SELECT transaction_id, decision, risk_score, is_flagged, reasons, signal_bundles
                 FROM decision_result WHERE transaction_id = ?1",
                params![transaction_id],
                |row| {
                    let decision: String = row.get(1)?;
                    let reasons: String = row.get(4)?;
                    let bundles: String = row.get(5)?;
                    Ok(DecisionResult {
                        transaction_id: row.get(0)?,
                        decision:       Decision::parse(&decision)
                            .ok_or_else(|| bad_column(1, format!("unknown decision '{decision}'")))?,
                        risk_score:     row.get(2)?,
                        is_flagged:     row.get(3)?,
                        reasons:        json_column(4, &reasons)?,
                        signal_bundles: json_column(5, &bundles)?,
                    })
                },
            )
            .optional()?;
        Ok(result)
    }

    fn load_bundle(&self, transaction_id: &str, detector: Detector) -> RiskResult<Option<SignalBundle>> {
        let payload: Option<String> = self
            .conn()?
            .query_row(
                "SELECT payload FROM signal_bundle WHERE transaction_id = ?1 AND detector = ?2",
                params![transaction_id, detector.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        match payload {
            Some(p) => Ok(Some(serde_json::from_str(&p)?)),
            None => Ok(None),
        }
    }

    /// First write wins: a memoised bundle is never replaced.
    fn save_bundle(&self, transaction_id: &str, bundle: &SignalBundle) -> RiskResult<()> {
        self.conn()?.execute(
            "INSERT OR IGNORE INTO signal_bundle (transaction_id, detector, payload, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                transaction_id,
                bundle.detector.as_str(),
                serde_json::to_string(bundle)?,
                to_millis(Utc::now()),
            ],
        )?;
        Ok(())
    }
}

impl RiskStore {
    pub fn decision_count(&self, transaction_id: &str) -> RiskResult<i64> {
        let count = self.conn()?.query_row(
            "SELECT COUNT(*) FROM decision_result WHERE transaction_id = ?1",
            params![transaction_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Decisions grouped by outcome, for run summaries.
    pub fn decision_totals(&self) -> RiskResult<BTreeMap<String, i64>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT decision, COUNT(*) FROM decision_result GROUP BY decision")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<Result<BTreeMap<_, _>, _>>()?;
        Ok(rows)
    }
}
