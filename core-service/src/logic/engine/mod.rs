//! Evaluation Engine Module
//!
//! Matches telemetry against one RuleSet snapshot per evaluation.
//!
//! ## Structure
//! - `types.rs` - Decision, Verdict
//! - `evaluate.rs` - EvaluationEngine and the matching policy

pub mod evaluate;
pub mod types;

pub use evaluate::{evaluate_snapshot, EngineStats, EvaluationEngine};
pub use types::{Decision, Verdict};
