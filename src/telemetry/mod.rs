//! # Telemetry Module
//!
//! Periodic GET_VALUES polling and sample logging.
//!
//! This module handles:
//! - Requesting telemetry on a fixed tick over the shared serial channel
//! - Reassembling and decoding responses
//! - Writing samples to CSV or JSONL files, one flushed row per sample
//! - Pausing during control sessions and timed capture windows

pub mod poller;
pub mod sink;

pub use poller::{PollerState, PollerStats, TelemetryPoller, TimedSample};
pub use sink::{open_sink, CsvSink, JsonlSink, TelemetrySink};
