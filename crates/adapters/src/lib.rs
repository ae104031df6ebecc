//! Multi-stream ingestion pipeline for smart-city event data.
//!
//! The pipeline reads five streams of JSON events (vehicle, GPS, traffic
//! camera, weather and emergency) from Kafka topics, validates every event
//! against the stream's fixed schema, tracks an event-time watermark per
//! stream, and writes each stream append-only to Parquet files in an object
//! store.  Each stream has its own checkpoint, so streams recover
//! independently.
//!
//! ## Overview
//!
//! Every stream runs as an independent chain:
//!
//! ```text
//!                    ┌─────────────────────────────────────────────────────┐
//!                    │                     coordinator                     │
//!                    └──┬───────────────────────┬───────────────────────┬──┘
//!                       │ start / cancel        │                       │
//!                       ▼                       ▼                       ▼
//!  topic   ┌──────┐  raw   ┌───────┐ records ┌──────┐ parquet  ┌──────────────┐
//! ───────► │source├───────►│decoder├────────►│ sink ├─────────►│ object store │
//!          └──────┘        └───┬───┘         └──┬───┘          └──────────────┘
//!                              │ observe        │ checkpoint          ▲
//!                              ▼                ▼                     │
//!                         ┌─────────┐     ┌────────────┐              │
//!                         │watermark│     │ checkpoint ├──────────────┘
//!                         │ tracker │     │   store    │
//!                         └─────────┘     └────────────┘
//! ```
//!
//! * [`transport`]: message sources.  [`transport::MessageSource`] is
//!   implemented for Kafka and for an in-process queue.
//!
//! * [`format`]: the JSON decoder and the Parquet encoder, both driven by
//!   the schema registry in [`smartcity_types::schema`].
//!
//! * [`controller`]: the watermark tracker, stream reader, checkpoint store,
//!   sink writer, and the [`Coordinator`] that runs one chain per stream.
//!
//! * [`server`]: the command-line entry point used by the
//!   `smartcity-pipeline` binary.

pub mod controller;
pub mod format;
pub mod logging;
#[cfg(feature = "with-kafka")]
pub mod server;
pub mod transport;

#[cfg(test)]
pub mod test;

pub use controller::{
    ChainError, CheckpointError, CheckpointStore, Coordinator, DetailedError, PipelineError,
    PipelineHandle, PipelineStatus, SinkError, WatermarkTracker,
};
pub use format::json::{DecodeError, JsonDecoder};
pub use transport::{MessageSource, RawMessage, SourceError, SourceProvider};
