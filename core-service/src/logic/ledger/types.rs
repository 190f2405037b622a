//! Ledger Types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::logic::digest::ContentDigest;
use crate::logic::rules::{Provenance, RuleOp};

/// Current tip of the chain: the state every new patch must anchor to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChainHead {
    pub version: u64,
    pub digest: ContentDigest,
}

impl std::fmt::Display for ChainHead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}@{}", self.version, self.digest.short())
    }
}

/// One accepted rule-set transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub version: u64,
    pub digest: ContentDigest,
    pub accepted_at: DateTime<Utc>,
    pub provenance: Provenance,
    /// Patch that produced this state (None for the baseline)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch_id: Option<String>,
}

impl LedgerEntry {
    pub fn head(&self) -> ChainHead {
        ChainHead {
            version: self.version,
            digest: self.digest,
        }
    }
}

/// Journal line: the entry plus the ops needed to replay it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerRecord {
    pub entry: LedgerEntry,
    #[serde(default)]
    pub ops: Vec<RuleOp>,
}

#[derive(Debug, Error)]
pub enum LedgerError {
    /// Append did not extend the head by exactly one version
    #[error("ledger conflict: expected version {expected}, got {got}")]
    Conflict { expected: u64, got: u64 },

    /// Durable write failed; nothing was recorded
    #[error("ledger I/O failure: {0}")]
    Io(#[from] std::io::Error),

    /// Journal content does not form a valid chain
    #[error("ledger corrupt at version {version}: {reason}")]
    Corrupt { version: u64, reason: String },

    /// Journal was started from a different baseline bundle
    #[error("baseline mismatch: journal has {journal}, bundle has {bundle}")]
    BaselineMismatch {
        journal: ContentDigest,
        bundle: ContentDigest,
    },
}
