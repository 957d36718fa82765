use super::{bad_column, claim_mutation, from_millis, json_column, to_millis, RiskStore};
use crate::{
    aml_detector::{PatternType, TransactionPattern},
    error::RiskResult,
    interfaces::PatternStore,
};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

fn load_pattern(
    conn: &Connection,
    user_id: &str,
    pattern_type: PatternType,
) -> RiskResult<Option<TransactionPattern>> {
    let pattern = conn
        .query_row(
            "SELECT user_id, pattern_type, pattern_data, occurrence_count, risk_score,
                    is_suspicious, last_detected
             FROM transaction_pattern WHERE user_id = ?1 AND pattern_type = ?2",
            params![user_id, pattern_type.as_str()],
            |row| {
                let kind: String = row.get(1)?;
                let data: String = row.get(2)?;
                Ok(TransactionPattern {
                    user_id:          row.get(0)?,
                    pattern_type:     PatternType::parse(&kind)
                        .ok_or_else(|| bad_column(1, format!("unknown pattern type '{kind}'")))?,
                    pattern_data:     json_column(2, &data)?,
                    occurrence_count: row.get(3)?,
                    risk_score:       row.get(4)?,
                    is_suspicious:    row.get(5)?,
                    last_detected:    row
                        .get::<_, Option<i64>>(6)?
                        .map(|ms| from_millis(6, ms))
                        .transpose()?,
                })
            },
        )
        .optional()?;
    Ok(pattern)
}

impl PatternStore for RiskStore {
    fn upsert_pattern(
        &self,
        source: &str,
        user_id: &str,
        pattern_type: PatternType,
        update: &mut dyn FnMut(&mut TransactionPattern),
    ) -> RiskResult<TransactionPattern> {
        let key = format!("{user_id}:{}", pattern_type.as_str());
        let mutation_key = format!("pattern:{key}");
        self.atomic(&key, |conn| {
            let stored = load_pattern(conn, user_id, pattern_type)?;
            if !claim_mutation(conn, source, &mutation_key)? {
                log::debug!("{source}: {mutation_key} already applied");
                return Ok(stored.unwrap_or_else(|| TransactionPattern::new(user_id, pattern_type)));
            }
            let mut pattern = stored.unwrap_or_else(|| TransactionPattern::new(user_id, pattern_type));
            update(&mut pattern);
            conn.execute(
                "INSERT INTO transaction_pattern (
                    user_id, pattern_type, pattern_data, occurrence_count, risk_score,
                    is_suspicious, first_detected, last_detected
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ON CONFLICT(user_id, pattern_type) DO UPDATE SET
                    pattern_data = excluded.pattern_data,
                    occurrence_count = excluded.occurrence_count,
                    risk_score = excluded.risk_score,
                    is_suspicious = excluded.is_suspicious,
                    last_detected = excluded.last_detected",
                params![
                    pattern.user_id,
                    pattern.pattern_type.as_str(),
                    serde_json::to_string(&pattern.pattern_data)?,
                    pattern.occurrence_count,
                    pattern.risk_score,
                    pattern.is_suspicious,
                    to_millis(pattern.last_detected.unwrap_or_else(Utc::now)),
                    pattern.last_detected.map(to_millis),
                ],
            )?;
            Ok(pattern)
        })
    }

    fn get_pattern(&self, user_id: &str, pattern_type: PatternType) -> RiskResult<Option<TransactionPattern>> {
        let conn = self.conn()?;
        load_pattern(&conn, user_id, pattern_type)
    }
}

impl RiskStore {
    pub fn suspicious_patterns(&self) -> RiskResult<Vec<(String, PatternType)>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT user_id, pattern_type FROM transaction_pattern
             WHERE is_suspicious = 1 ORDER BY user_id ASC, pattern_type ASC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                let kind: String = row.get(1)?;
                let pattern_type = PatternType::parse(&kind)
                    .ok_or_else(|| bad_column(1, format!("unknown pattern type '{kind}'")))?;
                Ok((row.get::<_, String>(0)?, pattern_type))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}
