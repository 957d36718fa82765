use thiserror::Error;

#[derive(Error, Debug)]
pub enum RiskError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Transaction '{id}' not found")]
    TransactionNotFound { id: String },

    #[error("Rule '{rule}' has an invalid condition: {reason}")]
    InvalidCondition { rule: String, reason: String },

    #[error("Store contention on '{key}' after {attempts} attempts")]
    Contention { key: String, attempts: u32 },

    #[error("Detector '{detector}' unavailable: {reason}")]
    DetectorUnavailable { detector: String, reason: String },

    #[error("ML scoring timed out after {timeout_ms}ms")]
    MlTimeout { timeout_ms: u64 },

    #[error("ML scoring failed: {reason}")]
    MlFailure { reason: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type RiskResult<T> = Result<T, RiskError>;
