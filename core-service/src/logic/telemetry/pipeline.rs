//! Telemetry Pipeline
//!
//! One ingest path, two consumers:
//! - evaluation queue: bounded, `send().await`, backpressures the producer
//! - forge queue: bounded, `try_send`, drop-newest on overflow
//!
//! A full forge queue never delays evaluation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

use super::event::{self, MalformedEvent, RawEvent, TelemetryEvent};
use crate::logic::engine::EvaluationEngine;
use crate::logic::forge::ForgeObservation;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Malformed(#[from] MalformedEvent),

    #[error("pipeline is shutting down")]
    ShuttingDown,
}

// ============================================================================
// STATS
// ============================================================================

#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineStats {
    pub ingested: u64,
    pub malformed: u64,
    pub forge_dropped: u64,
    pub verdict_dropped: u64,
}

#[derive(Default)]
struct Counters {
    ingested: AtomicU64,
    malformed: AtomicU64,
    forge_dropped: AtomicU64,
    verdict_dropped: AtomicU64,
}

/// Result of a batch ingest
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchOutcome {
    pub accepted: usize,
    pub malformed: usize,
}

// ============================================================================
// PIPELINE
// ============================================================================

pub struct TelemetryPipeline {
    next_seq: AtomicU64,
    engine: EvaluationEngine,
    /// None once `close` has run
    eval_tx: RwLock<Option<mpsc::Sender<TelemetryEvent>>>,
    eval_rx: Mutex<Option<mpsc::Receiver<TelemetryEvent>>>,
    forge_tx: mpsc::Sender<ForgeObservation>,
    counters: Arc<Counters>,
}

impl TelemetryPipeline {
    pub fn new(
        engine: EvaluationEngine,
        eval_capacity: usize,
        forge_tx: mpsc::Sender<ForgeObservation>,
    ) -> Self {
        let (eval_tx, eval_rx) = mpsc::channel(eval_capacity.max(1));
        Self {
            next_seq: AtomicU64::new(1),
            engine,
            eval_tx: RwLock::new(Some(eval_tx)),
            eval_rx: Mutex::new(Some(eval_rx)),
            forge_tx,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Spawn `workers` evaluation tasks sharing the evaluation queue.
    /// Returns nothing on a second call.
    pub fn start(&self, workers: usize) -> Vec<JoinHandle<()>> {
        let Some(rx) = self.eval_rx.lock().take() else {
            log::warn!("Telemetry pipeline already started");
            return Vec::new();
        };
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        (0..workers.max(1))
            .map(|worker| {
                let rx = Arc::clone(&rx);
                let engine = self.engine.clone();
                let forge_tx = self.forge_tx.clone();
                let counters = Arc::clone(&self.counters);
                tokio::spawn(async move {
                    log::debug!("Evaluation worker {} started", worker);
                    loop {
                        let next = rx.lock().await.recv().await;
                        let Some(event) = next else { break };
                        let verdict = engine.evaluate(&event);
                        if forge_tx.try_send(ForgeObservation::Verdict(verdict)).is_err() {
                            counters.verdict_dropped.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    log::debug!("Evaluation worker {} drained", worker);
                })
            })
            .collect()
    }

    /// Normalize one raw record and fan it out
    pub async fn ingest(&self, raw: RawEvent) -> Result<TelemetryEvent, IngestError> {
        let Some(eval_tx) = self.eval_tx.read().clone() else {
            return Err(IngestError::ShuttingDown);
        };

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let event = match event::normalize(raw, seq) {
            Ok(event) => event,
            Err(e) => {
                self.counters.malformed.fetch_add(1, Ordering::Relaxed);
                log::debug!("Dropped malformed event: {}", e);
                return Err(e.into());
            }
        };

        // drop-newest: the forge window never holds up evaluation
        if let Err(TrySendError::Full(_) | TrySendError::Closed(_)) =
            self.forge_tx.try_send(ForgeObservation::Event(event.clone()))
        {
            self.counters.forge_dropped.fetch_add(1, Ordering::Relaxed);
        }

        eval_tx
            .send(event.clone())
            .await
            .map_err(|_| IngestError::ShuttingDown)?;
        self.counters.ingested.fetch_add(1, Ordering::Relaxed);
        Ok(event)
    }

    /// Decode and ingest one JSON record
    pub async fn ingest_json(&self, bytes: &[u8]) -> Result<TelemetryEvent, IngestError> {
        match event::decode(bytes) {
            Ok(raw) => self.ingest(raw).await,
            Err(e) => {
                self.counters.malformed.fetch_add(1, Ordering::Relaxed);
                Err(e.into())
            }
        }
    }

    /// Ingest a batch; malformed records are counted and skipped
    pub async fn ingest_batch(&self, batch: Vec<RawEvent>) -> Result<BatchOutcome, IngestError> {
        let mut outcome = BatchOutcome::default();
        for raw in batch {
            match self.ingest(raw).await {
                Ok(_) => outcome.accepted += 1,
                Err(IngestError::Malformed(_)) => outcome.malformed += 1,
                Err(IngestError::ShuttingDown) => return Err(IngestError::ShuttingDown),
            }
        }
        Ok(outcome)
    }

    /// Stop accepting events. Workers drain what is queued, then exit.
    pub fn close(&self) {
        if self.eval_tx.write().take().is_some() {
            log::info!("Telemetry pipeline closed for ingest");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.eval_tx.read().is_none()
    }

    pub fn engine(&self) -> &EvaluationEngine {
        &self.engine
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            ingested: self.counters.ingested.load(Ordering::Relaxed),
            malformed: self.counters.malformed.load(Ordering::Relaxed),
            forge_dropped: self.counters.forge_dropped.load(Ordering::Relaxed),
            verdict_dropped: self.counters.verdict_dropped.load(Ordering::Relaxed),
        }
    }
}
