//! Telemetry Module
//!
//! Entry point for external events.
//!
//! ## Structure
//! - `event.rs` - RawEvent / TelemetryEvent and normalization
//! - `pipeline.rs` - ingest + fan-out to evaluation and forge queues

pub mod event;
pub mod pipeline;

pub use event::{decode, normalize, normalize_at, MalformedEvent, RawEvent, TelemetryEvent};
pub use pipeline::{BatchOutcome, IngestError, PipelineStats, TelemetryPipeline};
