use super::{bad_column, claim_mutation, from_millis, to_millis, RiskStore};
use crate::{
    error::RiskResult,
    interfaces::CounterStore,
    types::{Action, EntityType, Window},
    velocity_engine::{CounterKey, VelocityCounter, VelocityRule},
};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

const COUNTER_COLUMNS: &str =
    "count_5m, count_15m, count_1h, count_6h, count_24h, count_7d, count_30d, last_updated";

fn load_counter(conn: &Connection, key: &CounterKey) -> RiskResult<Option<VelocityCounter>> {
    let counter = conn
        .query_row(
            &format!(
                "SELECT {COUNTER_COLUMNS} FROM velocity_counter
                 WHERE entity_type = ?1 AND entity_value = ?2"
            ),
            params![key.entity_type.as_str(), key.entity_value],
            |row| {
                let mut counts = [0u64; 7];
                for (i, slot) in counts.iter_mut().enumerate() {
                    *slot = row.get::<_, i64>(i)?.max(0) as u64;
                }
                Ok(VelocityCounter {
                    key: key.clone(),
                    counts,
                    last_updated: from_millis(7, row.get(7)?)?,
                })
            },
        )
        .optional()?;
    Ok(counter)
}

fn save_counter(conn: &Connection, counter: &VelocityCounter) -> RiskResult<()> {
    let c = &counter.counts;
    conn.execute(
        &format!(
            "INSERT INTO velocity_counter (entity_type, entity_value, {COUNTER_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(entity_type, entity_value) DO UPDATE SET
                count_5m = excluded.count_5m,
                count_15m = excluded.count_15m,
                count_1h = excluded.count_1h,
                count_6h = excluded.count_6h,
                count_24h = excluded.count_24h,
                count_7d = excluded.count_7d,
                count_30d = excluded.count_30d,
                last_updated = excluded.last_updated"
        ),
        params![
            counter.key.entity_type.as_str(),
            counter.key.entity_value,
            c[0] as i64,
            c[1] as i64,
            c[2] as i64,
            c[3] as i64,
            c[4] as i64,
            c[5] as i64,
            c[6] as i64,
            to_millis(counter.last_updated),
        ],
    )?;
    Ok(())
}

impl CounterStore for RiskStore {
    fn get_or_create(&self, key: &CounterKey, now: DateTime<Utc>) -> RiskResult<VelocityCounter> {
        self.atomic(&key.to_string(), |conn| match load_counter(conn, key)? {
            Some(counter) => Ok(counter),
            None => {
                let counter = VelocityCounter::new(key.clone(), now);
                save_counter(conn, &counter)?;
                Ok(counter)
            }
        })
    }

    fn atomic_update(
        &self,
        source: &str,
        key: &CounterKey,
        now: DateTime<Utc>,
        update: &mut dyn FnMut(&mut VelocityCounter),
    ) -> RiskResult<VelocityCounter> {
        let mutation_key = format!("velocity:{key}");
        self.atomic(&key.to_string(), |conn| {
            let stored = load_counter(conn, key)?;
            if !claim_mutation(conn, source, &mutation_key)? {
                log::debug!("{source}: {mutation_key} already applied");
                return Ok(stored.unwrap_or_else(|| VelocityCounter::new(key.clone(), now)));
            }
            let mut counter = stored.unwrap_or_else(|| VelocityCounter::new(key.clone(), now));
            update(&mut counter);
            save_counter(conn, &counter)?;
            Ok(counter)
        })
    }
}

// ── Velocity rules ────────────────────────────────────────────────

impl RiskStore {
    /// Insert or replace a velocity rule definition. Hit statistics are kept.
    pub fn upsert_velocity_rule(&self, rule: &VelocityRule) -> RiskResult<()> {
        self.conn()?.execute(
            "INSERT INTO velocity_rule (
                rule_id, name, entity_type, time_window, threshold, action, risk_score,
                is_active, applies_to_pos, applies_to_ecommerce, applies_to_wallet,
                min_amount, max_amount, hit_count, last_triggered
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
            ON CONFLICT(rule_id) DO UPDATE SET
                name = excluded.name,
                entity_type = excluded.entity_type,
                time_window = excluded.time_window,
                threshold = excluded.threshold,
                action = excluded.action,
                risk_score = excluded.risk_score,
                is_active = excluded.is_active,
                applies_to_pos = excluded.applies_to_pos,
                applies_to_ecommerce = excluded.applies_to_ecommerce,
                applies_to_wallet = excluded.applies_to_wallet,
                min_amount = excluded.min_amount,
                max_amount = excluded.max_amount",
            params![
                rule.id,
                rule.name,
                rule.entity_type.as_str(),
                rule.time_window.label(),
                rule.threshold as i64,
                rule.action.as_str(),
                rule.risk_score,
                rule.is_active,
                rule.applies_to_pos,
                rule.applies_to_ecommerce,
                rule.applies_to_wallet,
                rule.min_amount,
                rule.max_amount,
                rule.hit_count,
                rule.last_triggered.map(to_millis),
            ],
        )?;
        Ok(())
    }

    pub fn velocity_rules(&self, entity_type: Option<EntityType>, active_only: bool) -> RiskResult<Vec<VelocityRule>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT rule_id, name, entity_type, time_window, threshold, action, risk_score,
                    is_active, applies_to_pos, applies_to_ecommerce, applies_to_wallet,
                    min_amount, max_amount, hit_count, last_triggered
             FROM velocity_rule
             WHERE (?1 IS NULL OR entity_type = ?1) AND (?2 = 0 OR is_active = 1)
             ORDER BY rule_id ASC",
        )?;
        let rows = stmt
            .query_map(params![entity_type.map(|e| e.as_str()), active_only], |row| {
                let entity: String = row.get(2)?;
                let window: String = row.get(3)?;
                let action: String = row.get(5)?;
                Ok(VelocityRule {
                    id:                   row.get(0)?,
                    name:                 row.get(1)?,
                    entity_type:          EntityType::parse(&entity)
                        .ok_or_else(|| bad_column(2, format!("unknown entity type '{entity}'")))?,
                    time_window:          Window::parse(&window)
                        .ok_or_else(|| bad_column(3, format!("unknown window '{window}'")))?,
                    threshold:            row.get::<_, i64>(4)?.max(0) as u64,
                    action:               Action::parse(&action)
                        .ok_or_else(|| bad_column(5, format!("unknown action '{action}'")))?,
                    risk_score:           row.get(6)?,
                    is_active:            row.get(7)?,
                    applies_to_pos:       row.get(8)?,
                    applies_to_ecommerce: row.get(9)?,
                    applies_to_wallet:    row.get(10)?,
                    min_amount:           row.get(11)?,
                    max_amount:           row.get(12)?,
                    hit_count:            row.get(13)?,
                    last_triggered:       row
                        .get::<_, Option<i64>>(14)?
                        .map(|ms| from_millis(14, ms))
                        .transpose()?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}
