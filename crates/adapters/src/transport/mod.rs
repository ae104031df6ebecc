//! Message sources.
//!
//! A [`MessageSource`] delivers the raw payloads of one stream, one
//! partitioned topic, in per-partition offset order.  Sources are created by
//! a [`SourceProvider`] once per stream and are owned by that stream's chain;
//! they are never shared between chains.
//!
//! Two providers are available:
//!
//! * [`KafkaSourceProvider`] (requires the `with-kafka` feature) reads from a
//!   Kafka cluster with manual partition assignment.
//!
//! * [`MemoryBroker`] keeps partitioned topics in process memory, for tests
//!   and for embedding the pipeline.

use std::time::Duration;

use anyhow::Error as AnyError;
use async_trait::async_trait;
use bytes::Bytes;
use smartcity_types::checkpoint::SourcePosition;
use smartcity_types::config::ResolvedStream;
use smartcity_types::StreamKind;
use thiserror::Error as ThisError;

#[cfg(feature = "with-kafka")]
pub(crate) mod kafka;
mod memory;

#[cfg(feature = "with-kafka")]
pub use kafka::KafkaSourceProvider;
pub use memory::{MemoryBroker, MemorySource, MemoryTopic};

/// One message as delivered by the source, before decoding.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawMessage {
    pub kind: StreamKind,
    pub partition: i32,
    pub offset: i64,
    pub payload: Bytes,
}

/// Error reported by a message source.
///
/// `fatal` errors stop the stream.  Other errors are logged and the source
/// is polled again.
#[derive(Debug, ThisError)]
#[error("{error}")]
pub struct SourceError {
    pub fatal: bool,
    pub error: AnyError,
}

impl SourceError {
    pub fn fatal(error: impl Into<AnyError>) -> Self {
        Self {
            fatal: true,
            error: error.into(),
        }
    }

    pub fn transient(error: impl Into<AnyError>) -> Self {
        Self {
            fatal: false,
            error: error.into(),
        }
    }
}

/// Reads the messages of a single stream.
#[async_trait]
pub trait MessageSource: Send {
    /// Restarts reading strictly after the offsets recorded in `position`.
    /// Partitions absent from `position` restart from the earliest retained
    /// offset.
    async fn seek(&mut self, position: &SourcePosition) -> Result<(), SourceError>;

    /// Returns up to `max` messages, waiting at most `timeout` for the first
    /// one.  An empty result is normal.
    async fn pull(&mut self, max: usize, timeout: Duration)
        -> Result<Vec<RawMessage>, SourceError>;
}

/// Creates the message source of each stream.
pub trait SourceProvider: Send + Sync {
    fn open(&self, stream: &ResolvedStream) -> Result<Box<dyn MessageSource>, SourceError>;
}
