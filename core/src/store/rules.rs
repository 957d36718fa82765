use super::{bad_column, claim_mutation, json_column, to_millis, RiskStore};
use crate::{
    error::{RiskError, RiskResult},
    interfaces::RuleStore,
    rule_engine::RuleRecord,
    types::{Action, EntityType, RiskScore},
    velocity_engine::VelocityRule,
};
use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::Deserialize;
use std::path::Path;

impl RiskStore {
    /// Insert or replace a rule definition. Hit statistics are kept.
    pub fn upsert_rule(&self, rule: &RuleRecord) -> RiskResult<()> {
        self.conn()?.execute(
            "INSERT INTO risk_rule (
                rule_id, name, condition_json, action, risk_score, is_active, priority,
                merchant_specific, included_merchants, excluded_merchants, hit_count
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT(rule_id) DO UPDATE SET
                name = excluded.name,
                condition_json = excluded.condition_json,
                action = excluded.action,
                risk_score = excluded.risk_score,
                is_active = excluded.is_active,
                priority = excluded.priority,
                merchant_specific = excluded.merchant_specific,
                included_merchants = excluded.included_merchants,
                excluded_merchants = excluded.excluded_merchants",
            params![
                rule.id,
                rule.name,
                rule.condition_json,
                rule.action.as_str(),
                rule.risk_score,
                rule.is_active,
                rule.priority,
                rule.merchant_specific,
                serde_json::to_string(&rule.included_merchants)?,
                serde_json::to_string(&rule.excluded_merchants)?,
                rule.hit_count,
            ],
        )?;
        Ok(())
    }

    pub fn rules(&self, active_only: bool) -> RiskResult<Vec<RuleRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT rule_id, name, condition_json, action, risk_score, is_active, priority,
                    merchant_specific, included_merchants, excluded_merchants, hit_count
             FROM risk_rule WHERE (?1 = 0 OR is_active = 1)
             ORDER BY rule_id ASC",
        )?;
        let rows = stmt
            .query_map(params![active_only], |row| {
                let action: String = row.get(3)?;
                let included: String = row.get(8)?;
                let excluded: String = row.get(9)?;
                Ok(RuleRecord {
                    id:                 row.get(0)?,
                    name:               row.get(1)?,
                    condition_json:     row.get(2)?,
                    action:             Action::parse(&action)
                        .ok_or_else(|| bad_column(3, format!("unknown action '{action}'")))?,
                    risk_score:         row.get(4)?,
                    is_active:          row.get(5)?,
                    priority:           row.get(6)?,
                    merchant_specific:  row.get(7)?,
                    included_merchants: json_column(8, &included)?,
                    excluded_merchants: json_column(9, &excluded)?,
                    hit_count:          row.get(10)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Seed both rule catalogues from `{data_dir}/rules/`. Missing files are
    /// skipped; malformed files are an error.
    pub fn seed_rules(&self, data_dir: &str) -> RiskResult<(usize, usize)> {
        let dir = Path::new(data_dir).join("rules");
        let catalogue = RuleCatalogue::load(&dir)?;
        for rule in &catalogue.velocity_rules {
            self.upsert_velocity_rule(rule)?;
        }
        for rule in &catalogue.rules {
            self.upsert_rule(rule)?;
        }
        log::info!(
            "Seeded {} velocity rules and {} rules from {}",
            catalogue.velocity_rules.len(),
            catalogue.rules.len(),
            dir.display()
        );
        Ok((catalogue.velocity_rules.len(), catalogue.rules.len()))
    }
}

impl RuleStore for RiskStore {
    fn active_velocity_rules(&self, entity_type: EntityType) -> RiskResult<Vec<VelocityRule>> {
        self.velocity_rules(Some(entity_type), true)
    }

    fn active_rules(&self) -> RiskResult<Vec<RuleRecord>> {
        self.rules(true)
    }

    fn increment_velocity_rule_hit(&self, source: &str, rule_id: &str, at: DateTime<Utc>) -> RiskResult<()> {
        self.record_hit(source, "velocity_rule", rule_id, at)
    }

    fn increment_rule_hit(&self, source: &str, rule_id: &str, at: DateTime<Utc>) -> RiskResult<()> {
        self.record_hit(source, "risk_rule", rule_id, at)
    }
}

impl RiskStore {
    /// `hit_count + 1` on `table`, once per source and rule.
    fn record_hit(&self, source: &str, table: &str, rule_id: &str, at: DateTime<Utc>) -> RiskResult<()> {
        let mutation_key = format!("{table}:{rule_id}");
        self.atomic(&mutation_key, |conn| {
            if !claim_mutation(conn, source, &mutation_key)? {
                return Ok(());
            }
            conn.execute(
                &format!(
                    "UPDATE {table}
                     SET hit_count = hit_count + 1, last_triggered = MAX(COALESCE(last_triggered, 0), ?2)
                     WHERE rule_id = ?1"
                ),
                params![rule_id, to_millis(at)],
            )?;
            Ok(())
        })
    }
}

// ── Catalogue files ─────────────────────────────────────────────

/// Rule definitions as written in `rules.json`: the condition is inline JSON.
#[derive(Debug, Deserialize)]
struct RuleDefinition {
    id:                 String,
    name:               String,
    condition:          serde_json::Value,
    action:             Action,
    risk_score:         RiskScore,
    #[serde(default = "default_true")]
    is_active:          bool,
    #[serde(default)]
    priority:           i64,
    #[serde(default)]
    merchant_specific:  bool,
    #[serde(default)]
    included_merchants: Vec<String>,
    #[serde(default)]
    excluded_merchants: Vec<String>,
}

fn default_true() -> bool {
    true
}

impl From<RuleDefinition> for RuleRecord {
    fn from(d: RuleDefinition) -> Self {
        Self {
            id:                 d.id,
            name:               d.name,
            condition_json:     d.condition.to_string(),
            action:             d.action,
            risk_score:         d.risk_score,
            is_active:          d.is_active,
            priority:           d.priority,
            merchant_specific:  d.merchant_specific,
            included_merchants: d.included_merchants,
            excluded_merchants: d.excluded_merchants,
            hit_count:          0,
        }
    }
}

#[derive(Debug, Default)]
pub struct RuleCatalogue {
    pub velocity_rules: Vec<VelocityRule>,
    pub rules:          Vec<RuleRecord>,
}

impl RuleCatalogue {
    /// Read `velocity_rules.json` and `rules.json` from `dir`.
    pub fn load(dir: &Path) -> RiskResult<Self> {
        let velocity_rules = read_optional::<Vec<VelocityRule>>(&dir.join("velocity_rules.json"))?
            .unwrap_or_default();
        let rules = read_optional::<Vec<RuleDefinition>>(&dir.join("rules.json"))?
            .unwrap_or_default()
            .into_iter()
            .map(RuleRecord::from)
            .collect();
        Ok(Self { velocity_rules, rules })
    }
}

fn read_optional<T: serde::de::DeserializeOwned>(path: &Path) -> RiskResult<Option<T>> {
    if !path.exists() {
        log::warn!("Rule file {} not found; skipping", path.display());
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)
        .map_err(|e| RiskError::Other(anyhow::anyhow!("Cannot read {}: {e}", path.display())))?;
    Ok(Some(serde_json::from_str(&content)?))
}
