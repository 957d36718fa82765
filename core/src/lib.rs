//! Real-time transaction risk decisions.
//!
//! A transaction flows through four independent detectors (velocity,
//! declarative rules, AML patterns, an ML score) and the aggregator fuses
//! their signal bundles into one persisted decision per transaction id.

pub mod aml_detector;
pub mod audit;
pub mod condition;
pub mod config;
pub mod decision_aggregator;
pub mod entity_resolver;
pub mod error;
pub mod event;
pub mod interfaces;
pub mod ml;
pub mod pipeline;
pub mod rule_engine;
pub mod signal;
pub mod store;
pub mod transaction;
pub mod types;
pub mod velocity_engine;
