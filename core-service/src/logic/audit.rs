//! Admission Audit Trail
//!
//! Every admission outcome, accepted or not, lands here with its
//! provenance. Bounded in memory; optionally mirrored to an append-only
//! JSONL file.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::logic::digest::ContentDigest;
use crate::logic::rules::Provenance;
use crate::logic::verifier::PatchEnvelope;

// ============================================================================
// RECORD
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionRecord {
    pub patch_id: String,
    pub provenance: Provenance,
    /// `accepted` or the rejection kind (`stale_anchor`, `malformed`, ...)
    pub outcome: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Version committed, for accepted patches
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    /// Digest of the signed ops
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<ContentDigest>,
    /// Forge patch held back for a co-signature, ready to be co-signed and
    /// resubmitted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub held: Option<PatchEnvelope>,
    pub at: DateTime<Utc>,
}

impl AdmissionRecord {
    pub fn accepted(patch_id: &str, provenance: Provenance, version: u64) -> Self {
        Self {
            patch_id: patch_id.to_string(),
            provenance,
            outcome: "accepted".to_string(),
            detail: None,
            version: Some(version),
            payload: None,
            held: None,
            at: Utc::now(),
        }
    }

    pub fn rejected(patch_id: &str, provenance: Provenance, kind: &str, detail: String) -> Self {
        Self {
            patch_id: patch_id.to_string(),
            provenance,
            outcome: kind.to_string(),
            detail: Some(detail),
            version: None,
            payload: None,
            held: None,
            at: Utc::now(),
        }
    }

    pub fn with_payload(mut self, payload: ContentDigest) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Keep the envelope so an operator can co-sign it later
    pub fn holding(mut self, envelope: PatchEnvelope) -> Self {
        self.payload = Some(envelope.payload_digest());
        self.held = Some(envelope);
        self
    }

    pub fn is_accepted(&self) -> bool {
        self.outcome == "accepted"
    }
}

// ============================================================================
// AUDIT
// ============================================================================

struct JsonlSink {
    writer: BufWriter<File>,
    path: PathBuf,
}

pub struct AdmissionAudit {
    recent: Mutex<VecDeque<AdmissionRecord>>,
    capacity: usize,
    sink: Mutex<Option<JsonlSink>>,
    accepted: AtomicU64,
    rejected: AtomicU64,
}

impl AdmissionAudit {
    pub fn new(capacity: usize) -> Self {
        Self {
            recent: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
            sink: Mutex::new(None),
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Mirror records to `path` (append-only JSON lines)
    pub fn with_sink(self, path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        log::info!("Admission audit log: {:?}", path);
        *self.sink.lock() = Some(JsonlSink {
            writer: BufWriter::new(file),
            path,
        });
        Ok(self)
    }

    pub fn record(&self, record: AdmissionRecord) {
        if record.is_accepted() {
            self.accepted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.rejected.fetch_add(1, Ordering::Relaxed);
        }

        if let Some(sink) = self.sink.lock().as_mut() {
            if let Err(e) = write_line(&mut sink.writer, &record) {
                // audit mirror is best-effort; the in-memory ring still has it
                log::error!("Failed to write audit record to {:?}: {}", sink.path, e);
            }
        }

        let mut recent = self.recent.lock();
        if recent.len() == self.capacity {
            recent.pop_front();
        }
        recent.push_back(record);
    }

    /// Newest last
    pub fn recent(&self, limit: usize) -> Vec<AdmissionRecord> {
        let recent = self.recent.lock();
        let skip = recent.len().saturating_sub(limit);
        recent.iter().skip(skip).cloned().collect()
    }

    pub fn find(&self, patch_id: &str) -> Option<AdmissionRecord> {
        self.recent
            .lock()
            .iter()
            .rev()
            .find(|r| r.patch_id == patch_id)
            .cloned()
    }

    pub fn accepted_count(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    pub fn rejected_count(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

fn write_line(writer: &mut BufWriter<File>, record: &AdmissionRecord) -> std::io::Result<()> {
    serde_json::to_writer(&mut *writer, record)?;
    writer.write_all(b"\n")?;
    writer.flush()
}
