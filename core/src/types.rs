//! Shared primitive types used across the whole pipeline.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A stable, unique identifier for a transaction.
pub type TransactionId = String;

/// Risk scores live on a 0..=100 scale everywhere in the pipeline.
pub type RiskScore = f64;

pub const MAX_RISK_SCORE: RiskScore = 100.0;

/// Identifier kinds the entity resolver can extract.
/// NEVER reorder: the string names are persisted as counter keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    UserId,
    CardNumber,
    DeviceId,
    IpAddress,
    MerchantId,
    Email,
}

impl EntityType {
    pub const ALL: [EntityType; 6] = [
        Self::UserId,
        Self::CardNumber,
        Self::DeviceId,
        Self::IpAddress,
        Self::MerchantId,
        Self::Email,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UserId     => "user_id",
            Self::CardNumber => "card_number",
            Self::DeviceId   => "device_id",
            Self::IpAddress  => "ip_address",
            Self::MerchantId => "merchant_id",
            Self::Email      => "email",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|e| e.as_str() == s)
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Pos,
    Ecommerce,
    Wallet,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pos       => "pos",
            Self::Ecommerce => "ecommerce",
            Self::Wallet    => "wallet",
        }
    }
}

/// What a triggered rule or detector asks the aggregator to do.
/// Ordered by severity: `Alert < Flag < Review < Reject`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Record only. Contributes its score, never escalates by itself.
    Alert,
    Flag,
    Review,
    Reject,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Alert  => "alert",
            Self::Flag   => "flag",
            Self::Review => "review",
            Self::Reject => "reject",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        [Self::Alert, Self::Flag, Self::Review, Self::Reject]
            .into_iter()
            .find(|a| a.as_str() == s)
    }

    /// True for actions that force a manual review when triggered.
    pub fn escalates(&self) -> bool {
        matches!(self, Self::Flag | Self::Review)
    }
}

/// Velocity lookback windows.
/// NEVER reorder: the index is the column position in `velocity_counter`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Window {
    #[serde(rename = "5m")]
    FiveMinutes,
    #[serde(rename = "15m")]
    FifteenMinutes,
    #[serde(rename = "1h")]
    OneHour,
    #[serde(rename = "6h")]
    SixHours,
    #[serde(rename = "24h")]
    OneDay,
    #[serde(rename = "7d")]
    SevenDays,
    #[serde(rename = "30d")]
    ThirtyDays,
}

impl Window {
    pub const ALL: [Window; 7] = [
        Self::FiveMinutes,
        Self::FifteenMinutes,
        Self::OneHour,
        Self::SixHours,
        Self::OneDay,
        Self::SevenDays,
        Self::ThirtyDays,
    ];

    pub fn index(&self) -> usize {
        *self as usize
    }

    pub fn duration(&self) -> Duration {
        match self {
            Self::FiveMinutes    => Duration::minutes(5),
            Self::FifteenMinutes => Duration::minutes(15),
            Self::OneHour        => Duration::hours(1),
            Self::SixHours       => Duration::hours(6),
            Self::OneDay         => Duration::hours(24),
            Self::SevenDays      => Duration::days(7),
            Self::ThirtyDays     => Duration::days(30),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::FiveMinutes    => "5m",
            Self::FifteenMinutes => "15m",
            Self::OneHour        => "1h",
            Self::SixHours       => "6h",
            Self::OneDay         => "24h",
            Self::SevenDays      => "7d",
            Self::ThirtyDays     => "30d",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|w| w.label() == s)
    }
}
