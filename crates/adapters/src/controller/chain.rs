//! One Reader → Decoder → Sink chain per stream.

use smartcity_storage::error::StorageError;
use smartcity_storage::BlobStore;
use smartcity_types::checkpoint::SourcePosition;
use smartcity_types::config::{PipelineConfig, ResolvedStream};
use smartcity_types::StreamKind;
use std::any::Any;
use std::borrow::Cow;
use std::sync::Arc;
use thiserror::Error as ThisError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::checkpoint::{CheckpointError, CheckpointStore};
use super::error::DetailedError;
use super::reader::StreamReader;
use super::retry::{retry_with_backoff, BackoffError};
use super::sink::{FlushReason, SinkError, SinkWriter};
use super::stats::PipelineStats;
use super::watermark::WatermarkTracker;
use crate::transport::{SourceError, SourceProvider};

/// Error that stops a chain.
#[derive(Debug, ThisError)]
pub enum ChainError {
    #[error("source error: {0}")]
    Source(#[from] SourceError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Sink(#[from] SinkError),

    #[error("invalid storage location: {0}")]
    Storage(#[from] StorageError),

    #[error("stream task panicked: {message}")]
    Panic { message: String },
}

impl ChainError {
    pub fn panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(message) = payload.downcast_ref::<&str>() {
            message.to_string()
        } else if let Some(message) = payload.downcast_ref::<String>() {
            message.clone()
        } else {
            "unknown panic payload".to_string()
        };
        Self::Panic { message }
    }
}

impl DetailedError for ChainError {
    fn error_code(&self) -> Cow<'static, str> {
        match self {
            Self::Source(error) if error.fatal => Cow::from("SourceFatal"),
            Self::Source(_) => Cow::from("SourceError"),
            Self::Checkpoint(error) => error.error_code(),
            Self::Sink(error) => error.error_code(),
            Self::Storage(error) => error.error_code(),
            Self::Panic { .. } => Cow::from("StreamPanic"),
        }
    }
}

/// Shared state handed to every chain.
#[derive(Clone)]
pub(crate) struct ChainContext {
    pub config: Arc<PipelineConfig>,
    pub store: Arc<dyn BlobStore>,
    pub sources: Arc<dyn SourceProvider>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub watermarks: Arc<WatermarkTracker>,
    pub stats: Arc<PipelineStats>,
}

pub struct StreamChain {
    stream: ResolvedStream,
    config: Arc<PipelineConfig>,
    checkpoints: Arc<dyn CheckpointStore>,
    watermarks: Arc<WatermarkTracker>,
    stats: Arc<PipelineStats>,
    reader: StreamReader,
    sink: SinkWriter,
}

impl StreamChain {
    pub(crate) fn new(stream: ResolvedStream, context: &ChainContext) -> Result<Self, ChainError> {
        let source = context.sources.open(&stream)?;
        let reader = StreamReader::new(
            stream.kind,
            source,
            context.watermarks.clone(),
            context.stats.clone(),
            context.config.poll_timeout(),
        );
        let sink = SinkWriter::new(
            &stream,
            context.store.clone(),
            context.checkpoints.clone(),
            context.config.late_data,
            context.config.batch.clone(),
            context.config.retry.clone(),
            context.stats.clone(),
        )?;
        Ok(Self {
            stream,
            config: context.config.clone(),
            checkpoints: context.checkpoints.clone(),
            watermarks: context.watermarks.clone(),
            stats: context.stats.clone(),
            reader,
            sink,
        })
    }

    pub fn kind(&self) -> StreamKind {
        self.stream.kind
    }

    /// Restores the chain from its last checkpoint.
    ///
    /// If the checkpointed batch has records but its output file is
    /// missing, the batch is re-derived from its offset range and written
    /// under its original name first.
    pub async fn recover(&mut self) -> Result<(), ChainError> {
        let kind = self.kind();
        let checkpoints = &self.checkpoints;
        let checkpoint = retry_with_backoff(
            &format!("reading checkpoint of stream '{kind}'"),
            &self.config.retry,
            self.stats.stream(kind),
            || async move {
                checkpoints.last_committed(kind).await.map_err(|e| {
                    if e.is_transient() {
                        BackoffError::Temporary(e)
                    } else {
                        BackoffError::Permanent(e)
                    }
                })
            },
        )
        .await?;

        let Some(checkpoint) = checkpoint else {
            info!("no checkpoint found; reading from the earliest offsets");
            self.reader.seek(&SourcePosition::new()).await?;
            self.watermarks.restore(kind, None);
            return Ok(());
        };

        let batch = &checkpoint.batch;
        if batch.records > 0 && !self.sink.output_exists(batch).await? {
            warn!(
                "output of batch {} (#{}) is missing; re-deriving offsets {}..{}",
                batch.id, batch.sequence, batch.start, batch.end
            );
            self.reader.seek(&batch.start).await?;
            self.watermarks.restore(kind, batch.watermark_before);
            let replayed = self.reader.replay(&batch.end, &batch.late).await?;
            self.sink.rewrite(batch, &replayed.accepted).await?;
        }

        self.reader.seek(&checkpoint.position).await?;
        self.watermarks.restore(kind, checkpoint.max_event_time);
        self.sink.resume_from(&checkpoint);
        info!(
            "resuming after batch {} (#{}) at {}, watermark {:?}",
            batch.id, batch.sequence, checkpoint.position, checkpoint.max_event_time
        );
        Ok(())
    }

    /// One pull → decode → append → flush cycle.
    async fn step(&mut self) -> Result<(), ChainError> {
        let kind = self.kind();
        let watermark_before = self.watermarks.max_event_time(kind);
        let max = self
            .config
            .batch
            .pull_size
            .min(self.sink.capacity_left())
            .max(1);
        let pulled = self.reader.pull(max).await?;

        for record in pulled.accepted {
            self.sink.append(record);
        }
        for late in pulled.late {
            self.sink.append_late(late);
        }
        self.sink
            .advance(&pulled.position, pulled.consumed, watermark_before);

        if let Some(reason) = self
            .sink
            .flush_due(Instant::now(), self.watermarks.cutoff(kind))
        {
            self.sink
                .flush(self.watermarks.max_event_time(kind), reason)
                .await?;
        }
        Ok(())
    }

    /// Runs the chain until `token` is cancelled, then drains the buffered
    /// batch.
    pub async fn run(mut self, token: CancellationToken) -> Result<(), ChainError> {
        self.recover().await?;
        info!(
            "reading topic '{}' into '{}'",
            self.stream.topic, self.stream.output_path
        );
        while !token.is_cancelled() {
            self.step().await?;
        }
        let kind = self.kind();
        self.sink
            .flush(self.watermarks.max_event_time(kind), FlushReason::Shutdown)
            .await?;
        info!("stopped at {}", self.sink.position());
        Ok(())
    }
}
