//! Central Configuration Constants
//!
//! Single source of truth for all pipeline defaults.
//! Every value here can be overridden through a `SHIELD_*` environment
//! variable, see [`crate::logic::config::PipelineConfig::from_env`].

/// Default directory holding the baseline rule bundle
pub const DEFAULT_BASELINE_DIR: &str = "rules";

/// Maximum hot-patch body accepted by the ingress (2 MiB)
pub const DEFAULT_MAX_PATCH_BYTES: usize = 2 << 20;

/// Maximum size of a single rule body (256 KiB)
pub const DEFAULT_MAX_RULE_BYTES: usize = 256 * 1024;

/// Upper bound on one admission round trip (milliseconds)
pub const DEFAULT_ADMISSION_TIMEOUT_MS: u64 = 2_000;

/// Distinct trusted keys that must sign an external patch
pub const DEFAULT_SIGNATURE_THRESHOLD: usize = 1;

/// Forge-signed patches need a human co-signature unless disabled
pub const DEFAULT_FORGE_REQUIRES_COSIGN: bool = true;

/// Events per forge window before a synthesis attempt
pub const DEFAULT_FORGE_WINDOW_EVENTS: usize = 100;

/// Maximum age of a non-empty forge window (seconds)
pub const DEFAULT_FORGE_WINDOW_SECS: u64 = 30;

/// Capacity of the forge observation queue (drop-newest when full)
pub const DEFAULT_FORGE_QUEUE_CAPACITY: usize = 1024;

/// Capacity of the evaluation queue (backpressure when full)
pub const DEFAULT_EVAL_QUEUE_CAPACITY: usize = 4096;

/// Number of evaluation workers
pub const DEFAULT_EVAL_WORKERS: usize = 2;

/// Consecutive ledger failures before health degrades
pub const DEFAULT_LEDGER_FAILURE_THRESHOLD: u32 = 3;

/// Admission outcomes kept in memory
pub const DEFAULT_AUDIT_CAPACITY: usize = 1000;

/// Verdicts on one target before the default synthesizer proposes a rule
pub const DEFAULT_SYNTH_MIN_HITS: usize = 50;

/// Maximum length of a rule identifier
pub const MAX_RULE_ID_LEN: usize = 128;

/// Maximum length of a telemetry field
pub const MAX_EVENT_FIELD_LEN: usize = 4096;

/// Tolerated clock skew for event timestamps in the future (milliseconds)
pub const MAX_EVENT_FUTURE_SKEW_MS: i64 = 5 * 60 * 1000;

/// Domain separation tag for patch signatures
pub const PATCH_SIGNING_DOMAIN: &[u8] = b"shield.patch.v1";

/// Crate version
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");
