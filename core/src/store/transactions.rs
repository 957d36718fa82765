use super::{from_millis, json_column, to_millis, RiskStore};
use crate::{
    error::RiskResult,
    interfaces::{AccountStore, TransactionStore},
    transaction::{AccountRecord, Transaction},
};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

impl RiskStore {
    fn transactions_where(
        &self,
        clause: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> RiskResult<Vec<Transaction>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT payload FROM transaction_record WHERE {clause} ORDER BY occurred_at ASC, transaction_id ASC"
        ))?;
        let rows = stmt
            .query_map(params, |row| {
                let payload: String = row.get(0)?;
                json_column::<Transaction>(0, &payload)
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

impl TransactionStore for RiskStore {
    fn get_transaction(&self, id: &str) -> RiskResult<Option<Transaction>> {
        let payload: Option<String> = self
            .conn()?
            .query_row(
                "SELECT payload FROM transaction_record WHERE transaction_id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        match payload {
            Some(p) => Ok(Some(serde_json::from_str(&p)?)),
            None => Ok(None),
        }
    }

    fn save_transaction(&self, tx: &Transaction) -> RiskResult<()> {
        let payload = serde_json::to_string(tx)?;
        self.conn()?.execute(
            "INSERT OR IGNORE INTO transaction_record
                (transaction_id, user_id, merchant_id, amount, occurred_at, payload)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                tx.id,
                tx.user_id(),
                tx.merchant_id(),
                tx.amount,
                to_millis(tx.timestamp),
                payload,
            ],
        )?;
        Ok(())
    }

    fn user_transactions_since(&self, user_id: &str, since: DateTime<Utc>) -> RiskResult<Vec<Transaction>> {
        self.transactions_where(
            "user_id = ?1 AND occurred_at >= ?2",
            &[&user_id, &to_millis(since)],
        )
    }

    fn merchant_transactions_since(
        &self,
        merchant_id: &str,
        since: DateTime<Utc>,
    ) -> RiskResult<Vec<Transaction>> {
        self.transactions_where(
            "merchant_id = ?1 AND occurred_at >= ?2",
            &[&merchant_id, &to_millis(since)],
        )
    }

    fn pair_transactions_since(&self, a: &str, b: &str, since: DateTime<Utc>) -> RiskResult<Vec<Transaction>> {
        self.transactions_where(
            "((user_id = ?1 AND merchant_id = ?2) OR (user_id = ?2 AND merchant_id = ?1))
             AND occurred_at >= ?3",
            &[&a, &b, &to_millis(since)],
        )
    }
}

impl AccountStore for RiskStore {
    fn register_account(&self, account: &AccountRecord) -> RiskResult<()> {
        self.conn()?.execute(
            "INSERT INTO account_record (user_id, username, email, ip_address, device_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(user_id) DO UPDATE SET
                username = excluded.username,
                email = excluded.email,
                ip_address = excluded.ip_address,
                device_id = excluded.device_id",
            params![
                account.user_id,
                account.username,
                account.email,
                account.ip_address,
                account.device_id,
                to_millis(account.created_at),
            ],
        )?;
        Ok(())
    }

    fn accounts_for_fingerprint(&self, ip_address: &str, device_id: &str) -> RiskResult<Vec<AccountRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT user_id, username, email, ip_address, device_id, created_at
             FROM account_record WHERE ip_address = ?1 AND device_id = ?2
             ORDER BY created_at ASC, user_id ASC",
        )?;
        let rows = stmt
            .query_map(params![ip_address, device_id], |row| {
                Ok(AccountRecord {
                    user_id:    row.get(0)?,
                    username:   row.get(1)?,
                    email:      row.get(2)?,
                    ip_address: row.get(3)?,
                    device_id:  row.get(4)?,
                    created_at: from_millis(5, row.get(5)?)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}
