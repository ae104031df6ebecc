//! Sink writer: batches decoded records and commits them as immutable
//! Parquet files.
//!
//! # Commit protocol
//!
//! A batch covers a contiguous range of source offsets, from the position
//! of the previous batch to the position after its last message.  Flushing
//! a batch:
//!
//! 1. Encodes the batch.  Encoding errors are fatal.
//!
//! 2. Commits the [`CheckpointRecord`] for the batch (write-ahead).
//!
//! 3. Writes the Parquet file `<output>/part-<sequence>-<batch id>.parquet`
//!    and verifies its size.  A short object is rewritten in full.
//!
//! 4. Writes late records to `<output>/_late/`, if configured.  This step
//!    is best effort.
//!
//! If the process dies between steps 2 and 3, the checkpoint refers to a
//! batch whose file does not exist.  On restart the chain re-derives the
//! batch from the recorded offset range, excluding the messages recorded
//! as late, and writes it under the same name
//! (see [`SinkWriter::rewrite`]).  Batch ids are a function of the offset
//! range, so re-deriving a batch never creates a second file.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use smartcity_storage::error::StorageError;
use smartcity_storage::{join_path, storage_path, BlobStore, StoragePath};
use smartcity_types::checkpoint::{BatchId, BatchRecord, CheckpointRecord, SourcePosition};
use smartcity_types::config::{BatchConfig, LateDataPolicy, ResolvedStream, RetryConfig};
use smartcity_types::record::EventRecord;
use smartcity_types::schema::{SchemaRegistry, StreamSchema};
use smartcity_types::StreamKind;
use std::borrow::Cow;
use std::fmt::{Display, Error as FmtError, Formatter};
use std::sync::Arc;
use thiserror::Error as ThisError;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::checkpoint::{CheckpointError, CheckpointStore};
use super::error::DetailedError;
use super::reader::LateRecord;
use super::retry::{retry_with_backoff, BackoffError};
use super::stats::{PipelineStats, StreamMetrics};
use crate::format::parquet::{encode, EncodeError};

/// Prefix, relative to the stream output path, of late-record files.
pub const LATE_PREFIX: &str = "_late";

#[derive(Debug, ThisError)]
pub enum SinkError {
    #[error("output storage unavailable: {0}")]
    StorageUnavailable(#[from] StorageError),

    #[error("partial write of '{path}': expected {expected} bytes, found {actual:?}")]
    PartialWrite {
        path: String,
        expected: u64,
        actual: Option<u64>,
    },

    #[error("error encoding batch: {0}")]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

impl SinkError {
    fn backoff(self) -> BackoffError<Self> {
        let transient = match &self {
            Self::StorageUnavailable(error) => error.is_transient(),
            Self::PartialWrite { .. } => true,
            _ => false,
        };
        if transient {
            BackoffError::Temporary(self)
        } else {
            BackoffError::Permanent(self)
        }
    }
}

impl DetailedError for SinkError {
    fn error_code(&self) -> Cow<'static, str> {
        match self {
            Self::StorageUnavailable(_) => Cow::from("StorageUnavailable"),
            Self::PartialWrite { .. } => Cow::from("PartialWrite"),
            Self::Encode(_) => Cow::from("EncodeError"),
            Self::Checkpoint(error) => error.error_code(),
        }
    }
}

/// Why a batch was flushed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlushReason {
    /// The batch reached `max_records`.
    Size,

    /// The oldest message in the batch reached `max_age`.
    Age,

    /// The watermark cutoff moved past the event time at which the batch
    /// was opened, i.e. event time advanced by more than the allowed
    /// lateness while the batch was open.
    ///
    /// The cutoff never moves past every buffered record: it only advances
    /// when a new maximum arrives, and that record is buffered.
    Watermark,

    /// Final flush on shutdown.
    Shutdown,
}

impl Display for FlushReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        f.write_str(match self {
            Self::Size => "size",
            Self::Age => "age",
            Self::Watermark => "watermark",
            Self::Shutdown => "shutdown",
        })
    }
}

/// Records accumulated since the last flush.
#[derive(Debug, Default)]
struct OutputBatch {
    records: Vec<EventRecord>,

    /// Late records kept for the side output.
    late: Vec<EventRecord>,

    /// Offsets of every late message, whatever the late-data policy.
    late_offsets: Vec<(i32, i64)>,

    /// Position after the last consumed message.
    end: SourcePosition,

    /// Watermark before the first message of the batch was observed.
    watermark_before: Option<DateTime<Utc>>,

    /// When the first message of the batch was consumed.
    opened_at: Option<Instant>,

    /// Messages consumed into the batch, including late and malformed ones.
    consumed: u64,
}

pub struct SinkWriter {
    kind: StreamKind,
    schema: &'static StreamSchema,
    store: Arc<dyn BlobStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    output_path: StoragePath,
    late_data: LateDataPolicy,
    batch_config: BatchConfig,
    retry: RetryConfig,
    stats: Arc<PipelineStats>,

    /// Sequence number of the next batch.
    sequence: u64,

    /// Position of the last committed batch; start of the current one.
    position: SourcePosition,

    batch: OutputBatch,
}

impl SinkWriter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stream: &ResolvedStream,
        store: Arc<dyn BlobStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        late_data: LateDataPolicy,
        batch_config: BatchConfig,
        retry: RetryConfig,
        stats: Arc<PipelineStats>,
    ) -> Result<Self, StorageError> {
        Ok(Self {
            kind: stream.kind,
            schema: SchemaRegistry::new().schema_for(stream.kind),
            store,
            checkpoints,
            output_path: storage_path(&stream.output_path)?,
            late_data,
            batch_config,
            retry,
            stats,
            sequence: 0,
            position: SourcePosition::new(),
            batch: OutputBatch::default(),
        })
    }

    fn metrics(&self) -> &StreamMetrics {
        self.stats.stream(self.kind)
    }

    /// Sequence number of the next batch.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Position of the last committed batch.
    pub fn position(&self) -> &SourcePosition {
        &self.position
    }

    /// Number of buffered records.
    pub fn len(&self) -> usize {
        self.batch.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.consumed == 0
    }

    /// Records that can still be appended before the batch is full.
    pub fn capacity_left(&self) -> usize {
        self.batch_config
            .max_records
            .saturating_sub(self.batch.records.len())
    }

    /// Continues after the batch recorded in `checkpoint`.
    pub fn resume_from(&mut self, checkpoint: &CheckpointRecord) {
        self.position = checkpoint.position.clone();
        self.sequence = checkpoint.batch.sequence + 1;
        self.batch = OutputBatch::default();
    }

    /// Object key of the primary output of `batch`.
    pub fn output_file(&self, batch: &BatchRecord) -> StoragePath {
        self.output_path
            .child(format!("part-{:08}-{}.parquet", batch.sequence, batch.id))
    }

    fn late_file(&self, batch: &BatchRecord) -> StoragePath {
        join_path(
            &self.output_path,
            &format!("{LATE_PREFIX}/part-{:08}-{}.parquet", batch.sequence, batch.id),
        )
    }

    pub fn append(&mut self, record: EventRecord) {
        self.batch.records.push(record);
    }

    /// Records the offset of a late message and buffers the record for the
    /// side output, or discards it.
    pub fn append_late(&mut self, late: LateRecord) {
        self.batch.late_offsets.push((late.partition, late.offset));
        if self.late_data == LateDataPolicy::SideOutput {
            self.batch.late.push(late.record);
        }
    }

    /// Extends the batch to `position`, after `consumed` more messages.
    /// `watermark_before` is the watermark before these messages were
    /// observed; it is recorded if they are the first of the batch.
    pub fn advance(
        &mut self,
        position: &SourcePosition,
        consumed: u64,
        watermark_before: Option<DateTime<Utc>>,
    ) {
        if consumed == 0 {
            return;
        }
        if self.batch.consumed == 0 {
            self.batch.watermark_before = watermark_before;
            self.batch.opened_at = Some(Instant::now());
        }
        self.batch.consumed += consumed;
        self.batch.end = position.clone();
    }

    /// Returns the reason the current batch must be flushed, if any.
    pub fn flush_due(&self, now: Instant, cutoff: Option<DateTime<Utc>>) -> Option<FlushReason> {
        if self.batch.consumed == 0 {
            return None;
        }
        if self.batch.records.len() >= self.batch_config.max_records {
            return Some(FlushReason::Size);
        }
        let max_age = self.batch_config.max_age();
        if self
            .batch
            .opened_at
            .is_some_and(|opened_at| now.duration_since(opened_at) >= max_age)
        {
            return Some(FlushReason::Age);
        }
        if cutoff
            .zip(self.opening_event_time())
            .is_some_and(|(cutoff, opened)| opened < cutoff)
        {
            return Some(FlushReason::Watermark);
        }
        None
    }

    /// Event time at which the current batch was opened: the watermark
    /// before its first message, or its earliest record on a stream with no
    /// watermark yet.
    fn opening_event_time(&self) -> Option<DateTime<Utc>> {
        self.batch.watermark_before.or_else(|| {
            self.batch
                .records
                .iter()
                .map(EventRecord::timestamp)
                .min()
        })
    }

    /// Commits the current batch.  `max_event_time` is the watermark of the
    /// stream at the end of the batch.
    ///
    /// Returns the id of the committed batch, or `None` if the batch was
    /// empty.
    pub async fn flush(
        &mut self,
        max_event_time: Option<DateTime<Utc>>,
        reason: FlushReason,
    ) -> Result<Option<BatchId>, SinkError> {
        if self.batch.consumed == 0 {
            return Ok(None);
        }
        let batch = std::mem::take(&mut self.batch);
        let start = self.position.clone();
        let record = BatchRecord {
            id: BatchId::for_range(self.kind, &start, &batch.end),
            sequence: self.sequence,
            start,
            end: batch.end.clone(),
            records: batch.records.len() as u64,
            watermark_before: batch.watermark_before,
            late: batch.late_offsets,
        };

        let data = if batch.records.is_empty() {
            None
        } else {
            Some(encode(self.schema, &batch.records)?)
        };
        let late = if batch.late.is_empty() {
            None
        } else {
            Some(encode(self.schema, &batch.late)?)
        };

        let checkpoint = CheckpointRecord {
            stream: self.kind,
            position: batch.end.clone(),
            max_event_time,
            batch: record.clone(),
            committed_at: Utc::now(),
        };
        self.commit_checkpoint(&checkpoint).await?;

        if let Some(data) = data {
            let size = data.len() as u64;
            let path = self.output_file(&record);
            self.write_file(&path, data).await?;
            StreamMetrics::add(&self.metrics().records_written, record.records);
            StreamMetrics::add(&self.metrics().bytes_written, size);
        }
        if let Some(late) = late {
            let path = self.late_file(&record);
            if let Err(error) = self.write_file(&path, late).await {
                warn!(
                    "failed to write {} late records of batch {} to '{path}': {error}",
                    batch.late.len(),
                    record.id
                );
            }
        }

        StreamMetrics::incr(&self.metrics().batches_flushed);
        info!(
            "flushed batch {} (#{}, {reason}): {} records, {} late, offsets {}..{}",
            record.id,
            record.sequence,
            record.records,
            record.late.len(),
            record.start,
            record.end
        );
        self.position = record.end;
        self.sequence += 1;
        Ok(Some(record.id))
    }

    /// True if the primary output of `batch` exists.
    pub async fn output_exists(&self, batch: &BatchRecord) -> Result<bool, SinkError> {
        let path = self.output_file(batch);
        let size = retry_with_backoff(
            &format!("checking '{path}'"),
            &self.retry,
            self.metrics(),
            || {
                let (store, path) = (&self.store, &path);
                async move {
                    store
                        .size(path)
                        .await
                        .map_err(|e| SinkError::from(e).backoff())
                }
            },
        )
        .await?;
        Ok(size.is_some())
    }

    /// Writes the primary output of a checkpointed `batch` whose file is
    /// missing, from `records` re-derived from the batch's offset range.
    pub async fn rewrite(
        &self,
        batch: &BatchRecord,
        records: &[EventRecord],
    ) -> Result<(), SinkError> {
        if records.len() as u64 != batch.records {
            warn!(
                "batch {} re-derived with {} records, {} were committed",
                batch.id,
                records.len(),
                batch.records
            );
        }
        if records.is_empty() {
            return Ok(());
        }
        let data = encode(self.schema, records)?;
        let size = data.len() as u64;
        self.write_file(&self.output_file(batch), data).await?;
        StreamMetrics::add(&self.metrics().records_written, records.len() as u64);
        StreamMetrics::add(&self.metrics().bytes_written, size);
        info!(
            "re-derived batch {} (#{}): {} records",
            batch.id,
            batch.sequence,
            records.len()
        );
        Ok(())
    }

    async fn commit_checkpoint(&self, checkpoint: &CheckpointRecord) -> Result<(), SinkError> {
        let kind = self.kind;
        let result = retry_with_backoff(
            &format!("committing checkpoint of batch {}", checkpoint.batch.id),
            &self.retry,
            self.metrics(),
            || {
                let checkpoints = &self.checkpoints;
                async move {
                    checkpoints.commit(kind, checkpoint).await.map_err(|e| {
                        if e.is_transient() {
                            BackoffError::Temporary(e)
                        } else {
                            BackoffError::Permanent(e)
                        }
                    })
                }
            },
        )
        .await;
        match result {
            Ok(()) => Ok(()),
            Err(error @ CheckpointError::ConflictingOffset { .. }) => {
                // The stored checkpoint is already ahead of this batch.
                warn!("{error}");
                StreamMetrics::incr(&self.metrics().checkpoint_conflicts);
                Ok(())
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Writes `data` to `path` and verifies the size of the stored object.
    async fn write_file(&self, path: &StoragePath, data: Bytes) -> Result<(), SinkError> {
        retry_with_backoff(
            &format!("writing '{path}'"),
            &self.retry,
            self.metrics(),
            || {
                let (store, data) = (&self.store, data.clone());
                async move {
                    let expected = data.len() as u64;
                    store
                        .put(path, data)
                        .await
                        .map_err(|e| SinkError::from(e).backoff())?;
                    let actual = store
                        .size(path)
                        .await
                        .map_err(|e| SinkError::from(e).backoff())?;
                    if actual != Some(expected) {
                        return Err(SinkError::PartialWrite {
                            path: path.to_string(),
                            expected,
                            actual,
                        }
                        .backoff());
                    }
                    debug!("wrote '{path}' ({expected} bytes)");
                    Ok(())
                }
            },
        )
        .await
    }
}
