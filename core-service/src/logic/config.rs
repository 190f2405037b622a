//! Pipeline Configuration
//!
//! Every knob has a default in `constants.rs` and a `SHIELD_*` override.
//! Unparseable numbers fall back to the default; malformed keys are errors.

use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::constants::*;
use crate::logic::ledger::JsonlJournal;
use crate::logic::verifier::{KeyError, PublicKey, SigningKeyPair, TrustPolicy};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var}: {source}")]
    Key {
        var: &'static str,
        #[source]
        source: KeyError,
    },
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Read-only rule bundle loaded as ledger[0]
    pub baseline_dir: PathBuf,
    /// JSONL journal; `None` keeps the ledger in memory
    pub ledger_path: Option<PathBuf>,
    /// JSONL mirror of the admission audit
    pub audit_path: Option<PathBuf>,
    pub audit_capacity: usize,

    pub max_patch_bytes: usize,
    pub max_rule_bytes: usize,
    pub admission_timeout: Duration,

    pub trusted_keys: Vec<PublicKey>,
    pub signature_threshold: usize,
    /// `None` generates an ephemeral forge key at startup
    pub forge_key: Option<Arc<SigningKeyPair>>,
    pub forge_requires_cosign: bool,

    pub forge_window_events: usize,
    pub forge_window: Duration,
    pub forge_queue_capacity: usize,
    pub synth_min_hits: usize,

    pub eval_queue_capacity: usize,
    pub eval_workers: usize,

    pub ledger_failure_threshold: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            baseline_dir: PathBuf::from(DEFAULT_BASELINE_DIR),
            ledger_path: None,
            audit_path: None,
            audit_capacity: DEFAULT_AUDIT_CAPACITY,
            max_patch_bytes: DEFAULT_MAX_PATCH_BYTES,
            max_rule_bytes: DEFAULT_MAX_RULE_BYTES,
            admission_timeout: Duration::from_millis(DEFAULT_ADMISSION_TIMEOUT_MS),
            trusted_keys: Vec::new(),
            signature_threshold: DEFAULT_SIGNATURE_THRESHOLD,
            forge_key: None,
            forge_requires_cosign: DEFAULT_FORGE_REQUIRES_COSIGN,
            forge_window_events: DEFAULT_FORGE_WINDOW_EVENTS,
            forge_window: Duration::from_secs(DEFAULT_FORGE_WINDOW_SECS),
            forge_queue_capacity: DEFAULT_FORGE_QUEUE_CAPACITY,
            synth_min_hits: DEFAULT_SYNTH_MIN_HITS,
            eval_queue_capacity: DEFAULT_EVAL_QUEUE_CAPACITY,
            eval_workers: DEFAULT_EVAL_WORKERS,
            ledger_failure_threshold: DEFAULT_LEDGER_FAILURE_THRESHOLD,
        }
    }
}

impl PipelineConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let d = Self::default();
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let num = |key: &str| var(key).and_then(|v| v.parse::<u64>().ok());

        let trusted_keys = match var("SHIELD_TRUSTED_KEYS") {
            Some(list) => list
                .split(',')
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(|k| {
                    PublicKey::from_hex(k).map_err(|source| ConfigError::Key {
                        var: "SHIELD_TRUSTED_KEYS",
                        source,
                    })
                })
                .collect::<Result<Vec<_>, _>>()?,
            None => Vec::new(),
        };

        let forge_key = match var("SHIELD_FORGE_KEY_SEED") {
            Some(seed) => Some(Arc::new(SigningKeyPair::from_seed_hex(&seed).map_err(|source| {
                ConfigError::Key {
                    var: "SHIELD_FORGE_KEY_SEED",
                    source,
                }
            })?)),
            None => None,
        };

        // "default" picks the per-user data dir, "memory" or unset stays in memory
        let ledger_path = match var("SHIELD_LEDGER_PATH").as_deref() {
            None | Some("memory") => None,
            Some("default") => Some(JsonlJournal::default_path()),
            Some(path) => Some(PathBuf::from(path)),
        };

        Ok(Self {
            baseline_dir: var("SHIELD_BASELINE_DIR").map(PathBuf::from).unwrap_or(d.baseline_dir),
            ledger_path,
            audit_path: var("SHIELD_AUDIT_PATH").map(PathBuf::from),
            audit_capacity: num("SHIELD_AUDIT_CAPACITY").map(|n| n as usize).unwrap_or(d.audit_capacity),
            max_patch_bytes: num("SHIELD_MAX_PATCH_BYTES").map(|n| n as usize).unwrap_or(d.max_patch_bytes),
            max_rule_bytes: num("SHIELD_MAX_RULE_BYTES").map(|n| n as usize).unwrap_or(d.max_rule_bytes),
            admission_timeout: num("SHIELD_ADMISSION_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(d.admission_timeout),
            trusted_keys,
            signature_threshold: num("SHIELD_SIGNATURE_THRESHOLD")
                .map(|n| n as usize)
                .unwrap_or(d.signature_threshold),
            forge_key,
            forge_requires_cosign: var("SHIELD_FORGE_REQUIRES_COSIGN")
                .and_then(|v| parse_bool(&v))
                .unwrap_or(d.forge_requires_cosign),
            forge_window_events: num("SHIELD_FORGE_WINDOW_EVENTS")
                .map(|n| n as usize)
                .unwrap_or(d.forge_window_events),
            forge_window: num("SHIELD_FORGE_WINDOW_SECS")
                .map(Duration::from_secs)
                .unwrap_or(d.forge_window),
            forge_queue_capacity: num("SHIELD_FORGE_QUEUE_CAPACITY")
                .map(|n| n as usize)
                .unwrap_or(d.forge_queue_capacity),
            synth_min_hits: num("SHIELD_SYNTH_MIN_HITS").map(|n| n as usize).unwrap_or(d.synth_min_hits),
            eval_queue_capacity: num("SHIELD_EVAL_QUEUE_CAPACITY")
                .map(|n| n as usize)
                .unwrap_or(d.eval_queue_capacity),
            eval_workers: num("SHIELD_EVAL_WORKERS").map(|n| n as usize).unwrap_or(d.eval_workers),
            ledger_failure_threshold: num("SHIELD_LEDGER_FAILURE_THRESHOLD")
                .map(|n| n as u32)
                .unwrap_or(d.ledger_failure_threshold),
        })
    }

    /// Trust policy with `forge_key` as the only forge-tier key
    pub fn trust_policy(&self, forge_key: PublicKey) -> TrustPolicy {
        TrustPolicy {
            external_keys: self.trusted_keys.clone(),
            external_threshold: self.signature_threshold,
            forge_keys: vec![forge_key],
            forge_requires_cosign: self.forge_requires_cosign,
        }
    }
}

fn parse_bool(v: &str) -> Option<bool> {
    match v.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
