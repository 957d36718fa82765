//! SQLite persistence layer.
//!
//! RULE: Only the store talks to the database.
//! Detectors reach it through the traits in `interfaces`; they never
//! execute SQL directly.
//!
//! One connection behind a mutex. Read-modify-write paths (counters,
//! patterns) run in an IMMEDIATE transaction and retry on BUSY/LOCKED.
//! Each of those writes also claims an `applied_mutation` marker in the
//! same transaction, so replaying a source never counts twice.

use crate::{
    config::StoreConfig,
    error::{RiskError, RiskResult},
    event::EventLogEntry,
};
use chrono::{DateTime, Utc};
use rand::Rng;
use rusqlite::{params, Connection, ErrorCode, TransactionBehavior};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

mod decisions;
mod patterns;
mod rules;
mod transactions;
mod velocity;

pub use rules::RuleCatalogue;

pub struct RiskStore {
    conn:  Mutex<Connection>,
    path:  Option<String>, // None for :memory:, Some(path) for file
    retry: StoreConfig,
}

impl RiskStore {
    pub fn open(path: &str) -> RiskResult<Self> {
        let conn = Connection::open_with_flags(
            path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_URI,
        )?;
        // WAL mode only for real files (shared-memory and :memory: ignore it).
        let _ = conn.execute_batch("PRAGMA journal_mode=WAL;");
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self {
            conn:  Mutex::new(conn),
            path:  Some(path.to_string()),
            retry: default_retry(),
        })
    }

    /// Open an in-memory database (used in tests).
    pub fn in_memory() -> RiskResult<Self> {
        let conn = Connection::open(":memory:")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self { conn: Mutex::new(conn), path: None, retry: default_retry() })
    }

    pub fn with_retry(mut self, retry: StoreConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Reopen a new connection to the same database.
    /// For in-memory databases, this returns a new in-memory database (isolated).
    pub fn reopen(&self) -> RiskResult<Self> {
        let store = match &self.path {
            Some(p) => Self::open(p)?,
            None => Self::in_memory()?,
        };
        Ok(store.with_retry(self.retry.clone()))
    }

    /// Apply all schema migrations in order.
    pub fn migrate(&self) -> RiskResult<()> {
        let conn = self.conn()?;
        conn.execute_batch(include_str!("../../../migrations/001_foundation.sql"))?;
        conn.execute_batch(include_str!("../../../migrations/002_velocity.sql"))?;
        conn.execute_batch(include_str!("../../../migrations/003_rules.sql"))?;
        conn.execute_batch(include_str!("../../../migrations/004_aml_patterns.sql"))?;
        conn.execute_batch(include_str!("../../../migrations/005_decisions.sql"))?;
        conn.execute_batch(include_str!("../../../migrations/006_applied_mutations.sql"))?;
        Ok(())
    }

    // ── Connection access ──────────────────────────────────────

    pub(crate) fn conn(&self) -> RiskResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| RiskError::Other(anyhow::anyhow!("store connection poisoned")))
    }

    /// Run `work` inside an IMMEDIATE transaction, retrying on BUSY/LOCKED
    /// with exponential backoff. `work` may run more than once; only the
    /// committed attempt has any effect.
    pub(crate) fn atomic<T>(
        &self,
        key: &str,
        mut work: impl FnMut(&Connection) -> RiskResult<T>,
    ) -> RiskResult<T> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let outcome = {
                let mut conn = self.conn()?;
                run_immediate(&mut conn, &mut work)
            };
            match outcome {
                Err(RiskError::Database(e)) if is_contention(&e) => {
                    if attempt >= self.retry.max_attempts {
                        log::warn!("{key}: giving up after {attempt} contended attempts");
                        return Err(RiskError::Contention { key: key.to_string(), attempts: attempt });
                    }
                    let delay = self.backoff(attempt);
                    log::debug!("{key}: contended (attempt {attempt}), retrying in {delay:?}");
                    std::thread::sleep(delay);
                }
                other => return other,
            }
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.retry.base_backoff_ms.max(1);
        let exp = base.saturating_mul(1u64 << attempt.saturating_sub(1).min(16));
        let jitter = rand::thread_rng().gen_range(0..=base);
        Duration::from_millis(exp + jitter)
    }

    // ── Event log ──────────────────────────────────────────────

    pub fn append_event(&self, entry: &EventLogEntry) -> RiskResult<()> {
        self.conn()?.execute(
            "INSERT INTO event_log (transaction_id, event_type, payload, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                entry.transaction_id,
                entry.event_type,
                entry.payload,
                to_millis(entry.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn events_for_transaction(&self, transaction_id: &str) -> RiskResult<Vec<EventLogEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, transaction_id, event_type, payload, created_at
             FROM event_log WHERE transaction_id = ?1
             ORDER BY id ASC",
        )?;
        let entries = stmt
            .query_map(params![transaction_id], |row| {
                Ok(EventLogEntry {
                    id:             Some(row.get(0)?),
                    transaction_id: row.get(1)?,
                    event_type:     row.get(2)?,
                    payload:        row.get(3)?,
                    created_at:     from_millis(4, row.get(4)?)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }
}

/// Claim `(source, mutation_key)` inside the caller's transaction.
/// Returns false when the mutation was already applied.
pub(crate) fn claim_mutation(conn: &Connection, source: &str, mutation_key: &str) -> RiskResult<bool> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO applied_mutation (source, mutation_key, applied_at)
         VALUES (?1, ?2, ?3)",
        params![source, mutation_key, to_millis(Utc::now())],
    )?;
    Ok(inserted == 1)
}

fn default_retry() -> StoreConfig {
    StoreConfig { max_attempts: 5, base_backoff_ms: 5 }
}

fn run_immediate<T>(
    conn: &mut Connection,
    work: &mut impl FnMut(&Connection) -> RiskResult<T>,
) -> RiskResult<T> {
    let txn = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let value = work(&txn)?;
    txn.commit()?;
    Ok(value)
}

fn is_contention(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _)
            if matches!(f.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

// ── Column helpers ─────────────────────────────────────────────

pub(crate) fn to_millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

pub(crate) fn from_millis(idx: usize, ms: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, ms))
}

pub(crate) fn bad_column(idx: usize, what: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, what.into())
}

pub(crate) fn json_column<T: serde::de::DeserializeOwned>(idx: usize, text: &str) -> rusqlite::Result<T> {
    serde_json::from_str(text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e)))
}
