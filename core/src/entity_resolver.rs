//! Entity resolution: canonical lookup keys from a transaction.
//!
//! RULE: Raw PAN and raw email never leave this module. Both are
//! normalised and passed through SHA-256 before they become a key.

use crate::{
    transaction::{non_empty, Transaction},
    types::EntityType,
};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Resolved `entity_type → entity_value` map. Missing fields have no entry.
pub type EntityMap = BTreeMap<EntityType, String>;

pub struct EntityResolver;

impl EntityResolver {
    pub fn resolve(tx: &Transaction) -> EntityMap {
        let ids = &tx.entity_ids;
        let mut out = EntityMap::new();

        if let Some(user) = non_empty(ids.user.as_deref()) {
            out.insert(EntityType::UserId, user.to_string());
        }
        if let Some(pan) = non_empty(ids.card_number.as_deref()) {
            out.insert(EntityType::CardNumber, hash_card_number(pan));
        }
        if let Some(device) = non_empty(ids.device.as_deref()) {
            out.insert(EntityType::DeviceId, device.to_string());
        }
        if let Some(ip) = non_empty(ids.ip.as_deref()) {
            out.insert(EntityType::IpAddress, ip.to_string());
        }
        if let Some(merchant) = non_empty(ids.merchant.as_deref()) {
            out.insert(EntityType::MerchantId, merchant.to_string());
        }
        if let Some(email) = non_empty(ids.email.as_deref()) {
            out.insert(EntityType::Email, hash_email(email));
        }

        out
    }
}

/// Digits only, so "4111 1111-1111 1111" and "4111111111111111" collide.
pub fn hash_card_number(pan: &str) -> String {
    let digits: String = pan.chars().filter(char::is_ascii_digit).collect();
    sha256_hex(&digits)
}

pub fn hash_email(email: &str) -> String {
    sha256_hex(&email.trim().to_ascii_lowercase())
}

fn sha256_hex(value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    hex::encode(hasher.finalize())
}
