//! Logic Module - Enforcement Pipeline
//!
//! ## Components (leaf-first)
//! - `ledger/` - append-only chain of accepted rule-set states
//! - `verifier/` - signature + anchor admission checks
//! - `rules/` - rule entries, rule sets, loader and the RuleStore
//! - `engine/` - evaluation of telemetry against a snapshot
//! - `telemetry/` - normalization and fan-out of raw events
//! - `forge/` - synthesis loop proposing candidate rules

pub mod admission;
pub mod audit;
pub mod config;
pub mod digest;
pub mod engine;
pub mod forge;
pub mod ledger;
pub mod rules;
pub mod runtime;
pub mod telemetry;
pub mod verifier;
