//! Public types shared by the smart-city ingestion pipeline crates.
//!
//! * [`kind`]: the closed set of event streams the pipeline ingests.
//! * [`schema`]: the fixed field layout of each stream.
//! * [`record`]: decoded, immutable event records.
//! * [`checkpoint`]: source positions, batch identifiers and checkpoint
//!   records persisted by the checkpoint store.
//! * [`config`]: pipeline configuration, deserialized from YAML.

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod kind;
pub mod record;
pub mod schema;

#[cfg(feature = "testing")]
pub mod testing;

pub use kind::StreamKind;
