//! Chain Ledger
//!
//! Append is the single mutual-exclusion point for state transitions.
//! The head is published through a `watch` channel so readers never wait
//! on an append in progress.

use chrono::Utc;
use parking_lot::{Mutex, MutexGuard, RwLock};
use tokio::sync::watch;

use super::journal::{LedgerJournal, MemoryJournal};
use super::types::{ChainHead, LedgerEntry, LedgerError, LedgerRecord};
use crate::logic::digest::ContentDigest;
use crate::logic::rules::{Provenance, RuleOp};

pub struct ChainLedger {
    entries: RwLock<Vec<LedgerEntry>>,
    head_tx: watch::Sender<ChainHead>,
    journal: Mutex<Box<dyn LedgerJournal>>,
}

impl ChainLedger {
    /// Start a fresh chain whose `ledger[0]` is the baseline digest.
    /// The baseline record is written to the journal.
    pub fn genesis(
        baseline: ContentDigest,
        mut journal: Box<dyn LedgerJournal>,
    ) -> Result<Self, LedgerError> {
        let entry = LedgerEntry {
            version: 0,
            digest: baseline,
            accepted_at: Utc::now(),
            provenance: Provenance::Baseline,
            patch_id: None,
        };
        journal.append(&LedgerRecord {
            entry: entry.clone(),
            ops: Vec::new(),
        })?;
        Self::restore(vec![entry], journal)
    }

    /// In-memory chain for a baseline digest
    pub fn in_memory(baseline: ContentDigest) -> Result<Self, LedgerError> {
        Self::genesis(baseline, Box::new(MemoryJournal::new()))
    }

    /// Rebuild from already-validated entries (journal replay)
    pub fn restore(
        entries: Vec<LedgerEntry>,
        journal: Box<dyn LedgerJournal>,
    ) -> Result<Self, LedgerError> {
        let Some(last) = entries.last() else {
            return Err(LedgerError::Corrupt {
                version: 0,
                reason: "ledger has no baseline entry".to_string(),
            });
        };
        for (i, entry) in entries.iter().enumerate() {
            if entry.version != i as u64 {
                return Err(LedgerError::Corrupt {
                    version: entry.version,
                    reason: format!("expected version {}", i),
                });
            }
        }
        if entries[0].provenance != Provenance::Baseline {
            return Err(LedgerError::Corrupt {
                version: 0,
                reason: "first entry is not a baseline".to_string(),
            });
        }

        let (head_tx, _) = watch::channel(last.head());
        Ok(Self {
            entries: RwLock::new(entries),
            head_tx,
            journal: Mutex::new(journal),
        })
    }

    pub fn head(&self) -> ChainHead {
        *self.head_tx.borrow()
    }

    /// Receiver notified on every accepted transition
    pub fn subscribe(&self) -> watch::Receiver<ChainHead> {
        self.head_tx.subscribe()
    }

    /// Take the append lock. Everything done while the guard is alive is
    /// serialized against every other admission attempt.
    pub fn begin_append(&self) -> AppendGuard<'_> {
        AppendGuard {
            ledger: self,
            journal: self.journal.lock(),
        }
    }

    /// Append a transition with no replay ops
    pub fn append(
        &self,
        version: u64,
        digest: ContentDigest,
        provenance: Provenance,
    ) -> Result<LedgerEntry, LedgerError> {
        self.begin_append().append(version, digest, provenance, None, &[])
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn entry(&self, version: u64) -> Option<LedgerEntry> {
        self.entries.read().get(version as usize).cloned()
    }

    pub fn history(&self) -> Vec<LedgerEntry> {
        self.entries.read().clone()
    }
}

/// Exclusive right to extend the chain
pub struct AppendGuard<'a> {
    ledger: &'a ChainLedger,
    journal: MutexGuard<'a, Box<dyn LedgerJournal>>,
}

impl AppendGuard<'_> {
    /// Head as seen under the lock; cannot move until the guard drops
    pub fn head(&self) -> ChainHead {
        self.ledger.head()
    }

    pub fn append(
        &mut self,
        version: u64,
        digest: ContentDigest,
        provenance: Provenance,
        patch_id: Option<String>,
        ops: &[RuleOp],
    ) -> Result<LedgerEntry, LedgerError> {
        let head = self.head();
        let expected = head.version + 1;
        if version != expected {
            return Err(LedgerError::Conflict { expected, got: version });
        }

        let entry = LedgerEntry {
            version,
            digest,
            accepted_at: Utc::now(),
            provenance,
            patch_id,
        };
        self.journal.append(&LedgerRecord {
            entry: entry.clone(),
            ops: ops.to_vec(),
        })?;

        self.ledger.entries.write().push(entry.clone());
        self.ledger.head_tx.send_replace(entry.head());
        log::info!(
            "Ledger advanced to v{} ({}) [{}]",
            entry.version,
            entry.digest.short(),
            entry.provenance
        );
        Ok(entry)
    }
}
