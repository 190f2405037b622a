//! Chain Ledger Module
//!
//! Append-only record of accepted rule-set states. Each entry extends its
//! predecessor by exactly one version; the head is the root of trust for
//! anchor checks.
//!
//! ## Structure
//! - `types.rs` - ChainHead, LedgerEntry, LedgerRecord, LedgerError
//! - `journal.rs` - durable append targets (memory, JSONL file)
//! - `chain.rs` - ChainLedger and the append guard

pub mod chain;
pub mod journal;
pub mod types;

pub use chain::{AppendGuard, ChainLedger};
pub use journal::{JsonlJournal, LedgerJournal, MemoryJournal};
pub use types::{ChainHead, LedgerEntry, LedgerError, LedgerRecord};
