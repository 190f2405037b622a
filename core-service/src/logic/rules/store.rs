//! Rule Store
//!
//! Holds the active RuleSet and performs all-or-nothing hot swaps.
//!
//! Snapshots are published through an `ArcSwap<RuleSet>`. Readers load the
//! Arc once without taking any lock and keep it for the whole evaluation; a
//! swap replaces the pointer and never touches a set a reader holds. Old
//! sets are freed when their last reader drops them.
//!
//! `apply` does all of its work under the ledger's append guard, so the
//! ledger append and the snapshot publication commit as a pair.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::Serialize;
use thiserror::Error;

use super::loader::RuleLoader;
use super::set::RuleSet;
use super::types::RuleOp;
use crate::logic::ledger::{ChainHead, ChainLedger, LedgerError, LedgerJournal, MemoryJournal};
use crate::logic::verifier::{ChainAnchor, ValidatedPatch};

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApplyError {
    /// Another patch committed against the same base first
    #[error("superseded: patch extends {anchor}, head is now {head}")]
    Superseded { anchor: ChainAnchor, head: ChainHead },

    /// A rule failed deep validation; nothing was applied
    #[error("malformed patch: {0}")]
    Malformed(String),

    /// Durable ledger write failed; in-memory state untouched
    #[error("ledger failure: {0}")]
    LedgerFailure(String),
}

impl ApplyError {
    pub fn kind(&self) -> &'static str {
        match self {
            ApplyError::Superseded { .. } => "superseded",
            ApplyError::Malformed(_) => "malformed",
            ApplyError::LedgerFailure(_) => "ledger_failure",
        }
    }

    /// Caller may re-admit against the new head
    pub fn is_retryable(&self) -> bool {
        matches!(self, ApplyError::Superseded { .. })
    }
}

// ============================================================================
// STATS
// ============================================================================

#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStats {
    pub applied: u64,
    pub superseded: u64,
    pub malformed: u64,
    pub ledger_failures: u64,
    pub consecutive_ledger_failures: u32,
}

#[derive(Default)]
struct Counters {
    applied: AtomicU64,
    superseded: AtomicU64,
    malformed: AtomicU64,
    ledger_failures: AtomicU64,
    consecutive_ledger_failures: AtomicU32,
}

// ============================================================================
// RULE STORE
// ============================================================================

pub struct RuleStore {
    ledger: Arc<ChainLedger>,
    loader: Arc<dyn RuleLoader>,
    snapshot: Arc<ArcSwap<RuleSet>>,
    max_rule_bytes: usize,
    counters: Counters,
}

impl RuleStore {
    /// Open the store over a journal. An empty journal starts a new chain
    /// at the baseline; otherwise every recorded transition is replayed
    /// onto the baseline and its digest re-checked.
    pub fn bootstrap(
        baseline: RuleSet,
        mut journal: Box<dyn LedgerJournal>,
        loader: Arc<dyn RuleLoader>,
        max_rule_bytes: usize,
    ) -> Result<Self, LedgerError> {
        let records = journal.load()?;

        let Some(first) = records.first() else {
            let ledger = ChainLedger::genesis(baseline.digest(), journal)?;
            log::info!(
                "Started new rule chain at baseline {} ({} rules)",
                baseline.digest().short(),
                baseline.len()
            );
            return Ok(Self::from_parts(Arc::new(ledger), baseline, loader, max_rule_bytes));
        };

        if first.entry.version != 0 || first.entry.provenance != super::Provenance::Baseline {
            return Err(LedgerError::Corrupt {
                version: first.entry.version,
                reason: "journal does not start with a baseline".to_string(),
            });
        }
        if first.entry.digest != baseline.digest() {
            return Err(LedgerError::BaselineMismatch {
                journal: first.entry.digest,
                bundle: baseline.digest(),
            });
        }

        let mut set = baseline;
        let mut entries = vec![first.entry.clone()];
        for record in &records[1..] {
            let version = record.entry.version;
            if version != set.version() + 1 {
                return Err(LedgerError::Corrupt {
                    version,
                    reason: format!("expected version {}", set.version() + 1),
                });
            }
            let next = set
                .with_ops(&record.ops, loader.as_ref(), max_rule_bytes)
                .map_err(|fault| LedgerError::Corrupt {
                    version,
                    reason: fault.to_string(),
                })?;
            if next.digest() != record.entry.digest {
                return Err(LedgerError::Corrupt {
                    version,
                    reason: format!(
                        "replayed digest {} does not match recorded {}",
                        next.digest().short(),
                        record.entry.digest.short()
                    ),
                });
            }
            set = next;
            entries.push(record.entry.clone());
        }

        log::info!(
            "Replayed {} ledger entries, head v{} ({})",
            entries.len(),
            set.version(),
            set.digest().short()
        );
        let ledger = ChainLedger::restore(entries, journal)?;
        Ok(Self::from_parts(Arc::new(ledger), set, loader, max_rule_bytes))
    }

    /// Store backed by an in-memory ledger
    pub fn in_memory(
        baseline: RuleSet,
        loader: Arc<dyn RuleLoader>,
        max_rule_bytes: usize,
    ) -> Result<Self, LedgerError> {
        Self::bootstrap(baseline, Box::new(MemoryJournal::new()), loader, max_rule_bytes)
    }

    fn from_parts(
        ledger: Arc<ChainLedger>,
        set: RuleSet,
        loader: Arc<dyn RuleLoader>,
        max_rule_bytes: usize,
    ) -> Self {
        Self {
            ledger,
            loader,
            snapshot: Arc::new(ArcSwap::from_pointee(set)),
            max_rule_bytes,
            counters: Counters::default(),
        }
    }

    pub fn ledger(&self) -> &Arc<ChainLedger> {
        &self.ledger
    }

    /// Current snapshot. Lock-free; never waits on an apply in progress.
    pub fn current(&self) -> Arc<RuleSet> {
        self.snapshot.load_full()
    }

    /// Shared snapshot cell for evaluators
    pub fn snapshots(&self) -> Arc<ArcSwap<RuleSet>> {
        Arc::clone(&self.snapshot)
    }

    pub fn apply(&self, patch: ValidatedPatch) -> Result<Arc<RuleSet>, ApplyError> {
        let mut guard = self.ledger.begin_append();
        let head = guard.head();
        let anchor = patch.anchor();

        if !anchor.matches(&head) {
            self.counters.superseded.fetch_add(1, Ordering::Relaxed);
            log::warn!(
                "Patch {} superseded: anchored at {}, head is {}",
                patch.patch_id(),
                anchor,
                head
            );
            return Err(ApplyError::Superseded { anchor, head });
        }

        let current = self.current();
        let provenance = patch.provenance();
        let patch_id = patch.patch_id().to_string();
        let ops = stamp_ops(patch.into_ops(), provenance);

        let next = match current.with_ops(&ops, self.loader.as_ref(), self.max_rule_bytes) {
            Ok(next) => next,
            Err(fault) => {
                self.counters.malformed.fetch_add(1, Ordering::Relaxed);
                log::warn!("Patch {} [{}] rejected: {}", patch_id, provenance, fault);
                return Err(ApplyError::Malformed(fault.to_string()));
            }
        };

        if let Err(e) = guard.append(
            next.version(),
            next.digest(),
            provenance,
            Some(patch_id.clone()),
            &ops,
        ) {
            return Err(match e {
                LedgerError::Conflict { .. } => {
                    self.counters.superseded.fetch_add(1, Ordering::Relaxed);
                    ApplyError::Superseded { anchor, head: guard.head() }
                }
                other => {
                    self.counters.ledger_failures.fetch_add(1, Ordering::Relaxed);
                    let streak = self
                        .counters
                        .consecutive_ledger_failures
                        .fetch_add(1, Ordering::SeqCst)
                        + 1;
                    log::error!(
                        "LEDGER FAILURE applying patch {} [{}] ({} in a row): {}",
                        patch_id,
                        provenance,
                        streak,
                        other
                    );
                    ApplyError::LedgerFailure(other.to_string())
                }
            });
        }

        self.counters.consecutive_ledger_failures.store(0, Ordering::SeqCst);
        self.counters.applied.fetch_add(1, Ordering::Relaxed);

        let next = Arc::new(next);
        self.snapshot.store(Arc::clone(&next));
        drop(guard);

        log::info!(
            "Applied patch {} [{}]: v{} -> v{}, {} rules",
            patch_id,
            provenance,
            current.version(),
            next.version(),
            next.len()
        );
        Ok(next)
    }

    pub fn consecutive_ledger_failures(&self) -> u32 {
        self.counters.consecutive_ledger_failures.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            applied: self.counters.applied.load(Ordering::Relaxed),
            superseded: self.counters.superseded.load(Ordering::Relaxed),
            malformed: self.counters.malformed.load(Ordering::Relaxed),
            ledger_failures: self.counters.ledger_failures.load(Ordering::Relaxed),
            consecutive_ledger_failures: self.consecutive_ledger_failures(),
        }
    }
}

/// Accepted rules take the patch's provenance and the acceptance time,
/// whatever the submitter wrote in those fields.
fn stamp_ops(ops: Vec<RuleOp>, provenance: super::Provenance) -> Vec<RuleOp> {
    let now = chrono::Utc::now();
    ops.into_iter()
        .map(|op| match op {
            RuleOp::Upsert { mut rule } => {
                rule.provenance = provenance;
                rule.accepted_at = now;
                RuleOp::Upsert { rule }
            }
            remove => remove,
        })
        .collect()
}
