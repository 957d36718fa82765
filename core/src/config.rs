use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

// ── Velocity ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VelocityConfig {
    /// Entity types that get counters. Others are resolved but not counted.
    #[serde(default = "default_tracked_entities")]
    pub tracked_entities: Vec<crate::types::EntityType>,
}

fn default_tracked_entities() -> Vec<crate::types::EntityType> {
    crate::types::EntityType::ALL.to_vec()
}

// ── AML ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AmlConfig {
    /// Currency-transaction reporting threshold.
    pub reporting_threshold: f64,
    /// Lower edge of the structuring band, as a fraction of the threshold.
    pub structuring_band: f64,
    pub structuring_risk: f64,

    pub round_unit: f64,
    pub round_amount_risk: f64,

    pub rapid_movement_threshold: f64,
    pub rapid_movement_window_minutes: i64,
    pub rapid_movement_risk: f64,

    pub high_risk_countries: BTreeSet<String>,
    pub high_risk_jurisdiction_risk: f64,

    pub fan_in_lookback_hours: i64,
    pub fan_in_min_sources: usize,
    pub fan_in_risk: f64,

    pub pair_lookback_hours: i64,
    pub pair_min_transactions: usize,
    pub pair_risk: f64,

    pub sequential_min_accounts: usize,
    pub sequential_risk: f64,

    /// Occurrences at which a pattern becomes suspicious.
    pub suspicious_occurrences: i64,
}

// ── Decision ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionConfig {
    pub review_threshold: f64,
}

// ── ML ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MlConfig {
    pub timeout_ms: u64,
    /// Predictions allowed to run at once, including ones abandoned
    /// after a timeout. Further calls fail fast until a slot frees up.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
}

fn default_max_in_flight() -> usize {
    32
}

// ── Store ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Attempts for one atomic update before reporting contention.
    pub max_attempts: u32,
    /// First backoff delay; doubles per attempt.
    pub base_backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    #[serde(default)]
    pub velocity: VelocityConfig,
    pub aml:      AmlConfig,
    pub decision: DecisionConfig,
    pub ml:       MlConfig,
    pub store:    StoreConfig,
}

impl Default for VelocityConfig {
    fn default() -> Self {
        Self { tracked_entities: default_tracked_entities() }
    }
}

impl RiskConfig {
    /// Load from `{data_dir}/risk_config.json`.
    /// In tests, use RiskConfig::default_test().
    pub fn load(data_dir: &str) -> anyhow::Result<Self> {
        let path = format!("{data_dir}/risk_config.json");
        let content = std::fs::read_to_string(&path)
            .map_err(|e| anyhow::anyhow!("Cannot read {path}: {e}"))?;
        let config: RiskConfig = serde_json::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Cannot parse {path}: {e}"))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if !(0.0..1.0).contains(&self.aml.structuring_band) {
            anyhow::bail!("aml.structuring_band must be in [0, 1), got {}", self.aml.structuring_band);
        }
        if self.aml.round_unit <= 0.0 {
            anyhow::bail!("aml.round_unit must be positive");
        }
        if self.ml.max_in_flight == 0 {
            anyhow::bail!("ml.max_in_flight must be at least 1");
        }
        if self.store.max_attempts == 0 {
            anyhow::bail!("store.max_attempts must be at least 1");
        }
        Ok(())
    }

    /// Config with hardcoded defaults for use in tests.
    pub fn default_test() -> Self {
        Self {
            velocity: VelocityConfig::default(),
            aml: AmlConfig {
                reporting_threshold: 10_000.0,
                structuring_band: 0.9,
                structuring_risk: 70.0,
                round_unit: 100.0,
                round_amount_risk: 25.0,
                rapid_movement_threshold: 5_000.0,
                rapid_movement_window_minutes: 24 * 60,
                rapid_movement_risk: 60.0,
                high_risk_countries: ["IR", "KP", "MM", "SY"].iter().map(|c| c.to_string()).collect(),
                high_risk_jurisdiction_risk: 50.0,
                fan_in_lookback_hours: 24,
                fan_in_min_sources: 2,
                fan_in_risk: 65.0,
                pair_lookback_hours: 24,
                pair_min_transactions: 3,
                pair_risk: 55.0,
                sequential_min_accounts: 3,
                sequential_risk: 75.0,
                suspicious_occurrences: 3,
            },
            decision: DecisionConfig { review_threshold: 70.0 },
            ml: MlConfig { timeout_ms: 500, max_in_flight: 32 },
            store: StoreConfig { max_attempts: 5, base_backoff_ms: 5 },
        }
    }
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self::default_test()
    }
}
