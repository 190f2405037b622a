//! Ledger Journal
//!
//! Durable append targets for ledger records. The JSONL journal is
//! append-only, one record per line, synced on every append so a record
//! that returned `Ok` survives a crash.
//!
//! A failed append is rolled back to the previous file length, so a record
//! the store reported as a ledger failure never reappears on reload. If the
//! rollback itself fails the journal is poisoned and refuses further
//! appends.

use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use super::types::{LedgerError, LedgerRecord};

/// Default journal file name
const JOURNAL_FILE: &str = "ledger.jsonl";

/// Where accepted transitions are persisted
pub trait LedgerJournal: Send {
    /// Read back every record, oldest first
    fn load(&mut self) -> Result<Vec<LedgerRecord>, LedgerError>;

    /// Durably append one record
    fn append(&mut self, record: &LedgerRecord) -> std::io::Result<()>;
}

// ============================================================================
// MEMORY JOURNAL
// ============================================================================

/// Process-lifetime journal (no durability)
#[derive(Debug, Default)]
pub struct MemoryJournal {
    records: Vec<LedgerRecord>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LedgerJournal for MemoryJournal {
    fn load(&mut self) -> Result<Vec<LedgerRecord>, LedgerError> {
        Ok(self.records.clone())
    }

    fn append(&mut self, record: &LedgerRecord) -> std::io::Result<()> {
        self.records.push(record.clone());
        Ok(())
    }
}

// ============================================================================
// JSONL JOURNAL
// ============================================================================

/// Byte-level operations the journal needs from its backing file
trait JournalFile: Send {
    fn size(&self) -> io::Result<u64>;
    fn append_bytes(&mut self, bytes: &[u8]) -> io::Result<()>;
    fn sync(&self) -> io::Result<()>;
    fn truncate_to(&self, len: u64) -> io::Result<()>;
}

impl JournalFile for File {
    fn size(&self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn append_bytes(&mut self, bytes: &[u8]) -> io::Result<()> {
        Write::write_all(self, bytes)
    }

    fn sync(&self) -> io::Result<()> {
        self.sync_data()
    }

    fn truncate_to(&self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }
}

pub struct JsonlJournal {
    path: PathBuf,
    file: Box<dyn JournalFile>,
    poisoned: bool,
}

impl JsonlJournal {
    /// Open (or create) the journal at `path`
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        log::info!("Opened ledger journal: {:?}", path);
        Ok(Self {
            path,
            file: Box::new(file),
            poisoned: false,
        })
    }

    /// `<local data dir>/shield/ledger.jsonl`
    pub fn default_path() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("shield")
            .join(JOURNAL_FILE)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Undo a partial append. Poisons the journal when that is impossible.
    fn roll_back(&mut self, len: u64, cause: &io::Error) {
        match self.file.truncate_to(len).and_then(|_| self.file.sync()) {
            Ok(()) => log::warn!("Ledger append failed ({}), journal rolled back to {} bytes", cause, len),
            Err(e) => {
                self.poisoned = true;
                log::error!(
                    "Ledger append failed ({}) and rollback to {} bytes failed ({}); journal poisoned",
                    cause,
                    len,
                    e
                );
            }
        }
    }
}

impl LedgerJournal for JsonlJournal {
    fn load(&mut self) -> Result<Vec<LedgerRecord>, LedgerError> {
        let file = File::open(&self.path)?;
        let reader = BufReader::new(file);
        let mut records = Vec::new();

        for (line_no, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record: LedgerRecord =
                serde_json::from_str(&line).map_err(|e| LedgerError::Corrupt {
                    version: records.len() as u64,
                    reason: format!("line {}: {}", line_no + 1, e),
                })?;
            records.push(record);
        }
        Ok(records)
    }

    fn append(&mut self, record: &LedgerRecord) -> std::io::Result<()> {
        if self.poisoned {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "ledger journal poisoned by an earlier failed rollback",
            ));
        }

        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let len = self.file.size()?;
        let written = self.file.append_bytes(&line).and_then(|_| self.file.sync());
        if let Err(e) = written {
            self.roll_back(len, &e);
            return Err(e);
        }
        Ok(())
    }
}
