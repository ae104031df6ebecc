//! Per-stream statistics.
//!
//! All counters are atomics updated by the stream's chain without locking.
//! Updates across multiple counters are not atomic, so a snapshot may be
//! slightly out of sync with the actual state of the stream.  Such
//! discrepancies are bounded and do not accumulate over time.

use chrono::{DateTime, Utc};
use enum_map::EnumMap;
use serde::Serialize;
use smartcity_types::StreamKind;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct StreamMetrics {
    /// Messages received from the source, including duplicates discarded
    /// after a seek.
    pub messages_read: AtomicU64,

    /// Records decoded and accepted for the primary output.
    pub records_accepted: AtomicU64,

    /// Records dropped or routed to the side output because they were late.
    pub late_records: AtomicU64,

    /// Messages that failed to decode.
    pub decode_errors: AtomicU64,

    /// Checkpointed batches, including batches without output records.
    pub batches_flushed: AtomicU64,

    /// Records written to primary Parquet files.
    pub records_written: AtomicU64,

    /// Bytes written to primary Parquet files.
    pub bytes_written: AtomicU64,

    /// Retried storage operations.
    pub storage_retries: AtomicU64,

    /// Checkpoint commits rejected because the stored checkpoint was
    /// already ahead.
    pub checkpoint_conflicts: AtomicU64,

    /// Set when the chain has stopped, successfully or not.
    pub stopped: AtomicBool,
}

impl StreamMetrics {
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::AcqRel);
    }

    pub fn incr(counter: &AtomicU64) {
        Self::add(counter, 1)
    }

    pub fn snapshot(&self) -> StreamCounters {
        let load = |counter: &AtomicU64| counter.load(Ordering::Acquire);
        StreamCounters {
            messages_read: load(&self.messages_read),
            records_accepted: load(&self.records_accepted),
            late_records: load(&self.late_records),
            decode_errors: load(&self.decode_errors),
            batches_flushed: load(&self.batches_flushed),
            records_written: load(&self.records_written),
            bytes_written: load(&self.bytes_written),
            storage_retries: load(&self.storage_retries),
            checkpoint_conflicts: load(&self.checkpoint_conflicts),
        }
    }
}

/// Point-in-time copy of [`StreamMetrics`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StreamCounters {
    pub messages_read: u64,
    pub records_accepted: u64,
    pub late_records: u64,
    pub decode_errors: u64,
    pub batches_flushed: u64,
    pub records_written: u64,
    pub bytes_written: u64,
    pub storage_retries: u64,
    pub checkpoint_conflicts: u64,
}

/// Metrics of all streams, shared between the chains and the coordinator.
#[derive(Debug, Default)]
pub struct PipelineStats {
    streams: EnumMap<StreamKind, StreamMetrics>,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stream(&self, kind: StreamKind) -> &StreamMetrics {
        &self.streams[kind]
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StreamStatus {
    pub stream: StreamKind,
    pub topic: String,
    pub max_event_time: Option<DateTime<Utc>>,
    pub stopped: bool,
    pub metrics: StreamCounters,
}

/// Serializable snapshot of a running pipeline.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PipelineStatus {
    pub name: String,
    pub cancelled: bool,
    pub streams: Vec<StreamStatus>,
}
