//! Declarative rule conditions and their interpreter.
//!
//! A condition is a small tree of comparisons joined by `and` / `or` / `not`,
//! stored as JSON and evaluated against a transaction's field map.
//! There is no dynamic code execution: unknown fields and ill-typed
//! comparisons are configuration errors, reported per rule.

use crate::transaction::Transaction;
use chrono::{Datelike, Timelike};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Fields a condition may reference.
pub const KNOWN_FIELDS: &[&str] = &[
    "amount",
    "currency",
    "channel",
    "purpose",
    "country",
    "city",
    "user_id",
    "merchant_id",
    "device_id",
    "ip_address",
    "hour",
    "weekday",
];

pub type FieldMap = BTreeMap<&'static str, Value>;

/// Literal values a triggered condition compared, keyed by field.
pub type ConditionValues = BTreeMap<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    #[serde(alias = "==")]
    Eq,
    #[serde(alias = "!=")]
    Ne,
    #[serde(alias = ">")]
    Gt,
    #[serde(alias = ">=")]
    Gte,
    #[serde(alias = "<")]
    Lt,
    #[serde(alias = "<=")]
    Lte,
    In,
    NotIn,
    Contains,
    StartsWith,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Condition {
    Comparison {
        field: String,
        op:    CompareOp,
        value: Value,
    },
    And {
        conditions: Vec<Condition>,
    },
    Or {
        conditions: Vec<Condition>,
    },
    Not {
        condition: Box<Condition>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConditionError {
    UnknownField(String),
    TypeMismatch { field: String, op: CompareOp, detail: String },
    Empty,
}

impl fmt::Display for ConditionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownField(field) => write!(f, "unknown field '{field}'"),
            Self::TypeMismatch { field, op, detail } => {
                write!(f, "cannot apply {op:?} to '{field}': {detail}")
            }
            Self::Empty => write!(f, "empty and/or group"),
        }
    }
}

impl std::error::Error for ConditionError {}

impl Condition {
    pub fn compare(field: impl Into<String>, op: CompareOp, value: Value) -> Self {
        Self::Comparison { field: field.into(), op, value }
    }

    pub fn and(conditions: Vec<Condition>) -> Self {
        Self::And { conditions }
    }

    pub fn or(conditions: Vec<Condition>) -> Self {
        Self::Or { conditions }
    }

    pub fn negate(condition: Condition) -> Self {
        Self::Not { condition: Box::new(condition) }
    }

    /// Parse a stored condition. A parse failure is a configuration error.
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Static check: every field is known and every group is non-empty.
    pub fn validate(&self) -> Result<(), ConditionError> {
        match self {
            Self::Comparison { field, .. } => {
                if KNOWN_FIELDS.contains(&field.as_str()) {
                    Ok(())
                } else {
                    Err(ConditionError::UnknownField(field.clone()))
                }
            }
            Self::And { conditions } | Self::Or { conditions } => {
                if conditions.is_empty() {
                    return Err(ConditionError::Empty);
                }
                conditions.iter().try_for_each(Condition::validate)
            }
            Self::Not { condition } => condition.validate(),
        }
    }

    /// Evaluate against `fields`, recording every compared value in `seen`.
    pub fn evaluate(
        &self,
        fields: &FieldMap,
        seen: &mut ConditionValues,
    ) -> Result<bool, ConditionError> {
        match self {
            Self::Comparison { field, op, value } => {
                let actual = fields
                    .get(field.as_str())
                    .ok_or_else(|| ConditionError::UnknownField(field.clone()))?;
                seen.insert(field.clone(), actual.clone());
                compare(field, *op, actual, value)
            }
            Self::And { conditions } => {
                if conditions.is_empty() {
                    return Err(ConditionError::Empty);
                }
                for c in conditions {
                    if !c.evaluate(fields, seen)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Self::Or { conditions } => {
                if conditions.is_empty() {
                    return Err(ConditionError::Empty);
                }
                for c in conditions {
                    if c.evaluate(fields, seen)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Self::Not { condition } => Ok(!condition.evaluate(fields, seen)?),
        }
    }
}

/// Flatten a transaction into the field map conditions read.
/// Absent optional fields map to `null`.
pub fn transaction_fields(tx: &Transaction) -> FieldMap {
    let opt = |v: Option<&str>| v.map_or(Value::Null, |s| json!(s));
    let mut fields = FieldMap::new();
    fields.insert("amount", json!(tx.amount));
    fields.insert("currency", json!(tx.currency));
    fields.insert("channel", json!(tx.channel.as_str()));
    fields.insert("purpose", json!(tx.purpose));
    fields.insert("country", opt(tx.country()));
    fields.insert("city", opt(tx.location.city.as_deref()));
    fields.insert("user_id", opt(tx.user_id()));
    fields.insert("merchant_id", opt(tx.merchant_id()));
    fields.insert("device_id", opt(tx.device_id()));
    fields.insert("ip_address", opt(tx.ip_address()));
    fields.insert("hour", json!(tx.timestamp.hour()));
    fields.insert("weekday", json!(tx.timestamp.weekday().num_days_from_monday()));
    fields
}

fn compare(field: &str, op: CompareOp, actual: &Value, expected: &Value) -> Result<bool, ConditionError> {
    let mismatch = |detail: &str| ConditionError::TypeMismatch {
        field: field.to_string(),
        op,
        detail: detail.to_string(),
    };

    match op {
        CompareOp::Eq => Ok(loosely_equal(actual, expected)),
        CompareOp::Ne => Ok(!loosely_equal(actual, expected)),
        CompareOp::Gt | CompareOp::Gte | CompareOp::Lt | CompareOp::Lte => {
            let rhs = expected.as_f64().ok_or_else(|| mismatch("operand is not a number"))?;
            let lhs = match actual {
                // A missing value never satisfies an ordering comparison.
                Value::Null => return Ok(false),
                other => other.as_f64().ok_or_else(|| mismatch("field is not numeric"))?,
            };
            Ok(match op {
                CompareOp::Gt  => lhs > rhs,
                CompareOp::Gte => lhs >= rhs,
                CompareOp::Lt  => lhs < rhs,
                _              => lhs <= rhs,
            })
        }
        CompareOp::In | CompareOp::NotIn => {
            let list = expected.as_array().ok_or_else(|| mismatch("operand is not a list"))?;
            let found = list.iter().any(|v| loosely_equal(actual, v));
            Ok(if op == CompareOp::In { found } else { !found })
        }
        CompareOp::Contains | CompareOp::StartsWith => {
            let needle = expected.as_str().ok_or_else(|| mismatch("operand is not a string"))?;
            let haystack = match actual {
                Value::Null => return Ok(false),
                Value::String(s) => s.as_str(),
                _ => return Err(mismatch("field is not a string")),
            };
            Ok(if op == CompareOp::Contains {
                haystack.contains(needle)
            } else {
                haystack.starts_with(needle)
            })
        }
    }
}

/// Numbers compare by value (so `100` equals `100.0`); everything else structurally.
fn loosely_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(amount: f64, channel: &str) -> FieldMap {
        let mut f = FieldMap::new();
        f.insert("amount", json!(amount));
        f.insert("channel", json!(channel));
        f.insert("country", Value::Null);
        f
    }

    #[test]
    fn parses_symbolic_operators() {
        let c = Condition::from_json(
            r#"{"kind":"comparison","field":"amount","op":">=","value":500}"#,
        )
        .unwrap();
        assert_eq!(c, Condition::compare("amount", CompareOp::Gte, json!(500)));
    }

    #[test]
    fn and_or_not_short_circuit_and_record_values() {
        let c = Condition::and(vec![
            Condition::compare("amount", CompareOp::Gt, json!(100)),
            Condition::negate(Condition::compare("channel", CompareOp::Eq, json!("pos"))),
        ]);
        let mut seen = ConditionValues::new();
        assert!(c.evaluate(&fields(250.0, "ecommerce"), &mut seen).unwrap());
        assert_eq!(seen.get("amount"), Some(&json!(250.0)));
        assert_eq!(seen.get("channel"), Some(&json!("ecommerce")));

        let mut seen = ConditionValues::new();
        assert!(!c.evaluate(&fields(50.0, "ecommerce"), &mut seen).unwrap());
        assert!(!seen.contains_key("channel"), "and() must stop at the first false");
    }

    #[test]
    fn null_field_fails_ordering_comparison() {
        let c = Condition::compare("country", CompareOp::Gt, json!(1));
        assert!(!c.evaluate(&fields(1.0, "pos"), &mut ConditionValues::new()).unwrap());
    }

    #[test]
    fn ill_typed_comparison_is_an_error() {
        let c = Condition::compare("channel", CompareOp::Gt, json!(3));
        let err = c.evaluate(&fields(1.0, "pos"), &mut ConditionValues::new()).unwrap_err();
        assert!(matches!(err, ConditionError::TypeMismatch { .. }));
    }

    #[test]
    fn validate_rejects_unknown_fields_and_empty_groups() {
        let bad = Condition::compare("balance", CompareOp::Gt, json!(1));
        assert_eq!(bad.validate(), Err(ConditionError::UnknownField("balance".into())));
        assert_eq!(Condition::or(vec![]).validate(), Err(ConditionError::Empty));
    }
}
