//! Forge Module
//!
//! Proposes candidate rules from observed telemetry and submits them
//! through the regular admission gate.
//!
//! ## Structure
//! - `window.rs` - bounded (event, verdict) buffer
//! - `synth.rs` - pluggable `Synthesizer` + default heuristic
//! - `forge_loop.rs` - the async state machine

pub mod forge_loop;
pub mod synth;
pub mod window;

pub use forge_loop::{ForgeLoop, ForgeMonitor, ForgeState, ForgeStats};
pub use synth::{CandidateRule, NullSynthesizer, RepeatedTargetSynthesizer, Synthesizer};
pub use window::{ForgeObservation, ForgeWindow, WindowEntry};
