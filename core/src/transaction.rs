//! Immutable transaction input and the account records the AML detector reads.
//!
//! RULE: The pipeline never mutates a Transaction. Status and risk fields
//! belong to the transaction store that owns persistence.

use crate::types::{Channel, TransactionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Raw identifiers as they arrive at ingestion.
/// `card_number` may carry a full PAN; it is hashed before any lookup.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityIds {
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub card_number: Option<String>,
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub merchant: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Location {
    /// ISO 3166-1 alpha-2 country code.
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id:         TransactionId,
    pub entity_ids: EntityIds,
    pub amount:     f64,
    pub currency:   String,
    pub channel:    Channel,
    /// Free-form purpose: "purchase", "withdrawal", "transfer", "deposit", ...
    pub purpose:    String,
    pub timestamp:  DateTime<Utc>,
    #[serde(default)]
    pub location:   Location,
}

impl Transaction {
    /// Fresh id for transactions that arrive without one.
    pub fn new_id() -> TransactionId {
        format!("txn-{}", uuid::Uuid::new_v4())
    }

    pub fn user_id(&self) -> Option<&str> {
        non_empty(self.entity_ids.user.as_deref())
    }

    pub fn merchant_id(&self) -> Option<&str> {
        non_empty(self.entity_ids.merchant.as_deref())
    }

    pub fn device_id(&self) -> Option<&str> {
        non_empty(self.entity_ids.device.as_deref())
    }

    pub fn ip_address(&self) -> Option<&str> {
        non_empty(self.entity_ids.ip.as_deref())
    }

    pub fn country(&self) -> Option<&str> {
        non_empty(self.location.country.as_deref())
    }

    /// Withdrawal and transfer purposes move money out of the account.
    pub fn is_outbound(&self) -> bool {
        let purpose = self.purpose.to_ascii_lowercase();
        purpose == "withdrawal" || purpose == "transfer"
    }
}

/// A registered account, as seen by the sequential-account detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountRecord {
    pub user_id:    String,
    pub username:   String,
    #[serde(default)]
    pub email:      Option<String>,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub device_id:  Option<String>,
    pub created_at: DateTime<Utc>,
}

pub(crate) fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
