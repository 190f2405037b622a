//! Shield Core - Rule Hot-Patch & Telemetry Enforcement
//!
//! Holds a versioned, content-addressed rule set, evaluates telemetry
//! against it, and admits signed hot patches anchored to a chain ledger.
//!
//! ```text
//! raw events ──► TelemetryPipeline ──┬──► EvaluationEngine ──► Verdict
//!                                    │                           │
//!                                    └──► ForgeLoop ◄────────────┘
//!                                            │ candidates
//! patch bytes ──► Admission ──► Verifier ──► RuleStore.apply ──► ChainLedger
//! ```

pub mod constants;
pub mod logic;

pub use logic::admission::{Admission, SubmitError};
pub use logic::audit::{AdmissionAudit, AdmissionRecord};
pub use logic::config::{ConfigError, PipelineConfig};
pub use logic::engine::{Decision, EvaluationEngine, Verdict};
pub use logic::forge::{CandidateRule, ForgeState, RepeatedTargetSynthesizer, Synthesizer};
pub use logic::ledger::{
    ChainHead, ChainLedger, JsonlJournal, LedgerEntry, LedgerError, LedgerJournal, LedgerRecord,
    MemoryJournal,
};
pub use logic::rules::{
    load_bundle, ApplyError, Provenance, RuleEntry, RuleLanguage, RuleOp, RuleSet, RuleStore,
};
pub use logic::runtime::{CoreStatus, HealthState, RuntimeError, ShieldCore};
pub use logic::telemetry::{
    BatchOutcome, IngestError, MalformedEvent, RawEvent, TelemetryEvent, TelemetryPipeline,
};
pub use logic::verifier::{
    ChainAnchor, PatchEnvelope, PublicKey, SigningKeyPair, TrustPolicy, VerifyError, Verifier,
};
