//! Pipeline coordinator.
//!
//! # Design
//!
//! The [`Coordinator`] runs one [`StreamChain`] per enabled stream, each as
//! its own tokio task.  Chains share nothing but the object store, the
//! [`WatermarkTracker`], the statistics, and one [`CancellationToken`]:
//!
//! * A shutdown request cancels the token.  Every chain notices the
//!   cancellation between pull cycles, drains its buffered batch with a
//!   final flush, and stops.  The coordinator waits for all of them, up to
//!   the configured shutdown timeout.
//!
//! * A chain that fails stops the pipeline: the coordinator cancels the
//!   token, aborts the remaining chains and reports the failed stream.
//!
//! Within a chain, pull, decode, flush and checkpoint commit happen
//! strictly in sequence.

use futures::FutureExt;
use smartcity_storage::BlobStore;
use smartcity_types::config::{PipelineConfig, ResolvedStream};
use smartcity_types::StreamKind;
use std::future::pending;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, Instrument};

mod chain;
mod checkpoint;
mod error;
mod reader;
mod retry;
mod sink;
mod stats;
mod watermark;

#[cfg(test)]
mod test;

pub use chain::{ChainError, StreamChain};
pub use checkpoint::{BlobCheckpointStore, CheckpointError, CheckpointStore, CHECKPOINT_FILE};
pub use error::{DetailedError, PipelineError};
pub use reader::{LateRecord, PulledBatch, StreamReader, REPLAY_IDLE_POLLS};
pub use retry::{retry_with_backoff, BackoffError};
pub use sink::{FlushReason, SinkError, SinkWriter, LATE_PREFIX};
pub use stats::{PipelineStats, PipelineStatus, StreamCounters, StreamMetrics, StreamStatus};
pub use watermark::WatermarkTracker;

use crate::transport::SourceProvider;
use chain::ChainContext;

/// Wires and runs one chain per enabled stream.
pub struct Coordinator {
    streams: Vec<ResolvedStream>,
    context: ChainContext,
}

impl Coordinator {
    /// Validates `config` and prepares a pipeline that reads from `sources`
    /// and writes output and checkpoints to `store`.
    pub fn new(
        config: PipelineConfig,
        store: Arc<dyn BlobStore>,
        sources: Arc<dyn SourceProvider>,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        let streams = config.resolved_streams();
        let checkpoints = Arc::new(BlobCheckpointStore::new(store.clone(), &streams)?);
        let watermarks = Arc::new(WatermarkTracker::new(config.allowed_lateness()));
        Ok(Self {
            streams,
            context: ChainContext {
                config: Arc::new(config),
                store,
                sources,
                checkpoints,
                watermarks,
                stats: Arc::new(PipelineStats::new()),
            },
        })
    }

    /// Replaces the checkpoint store.
    pub fn with_checkpoint_store(mut self, checkpoints: Arc<dyn CheckpointStore>) -> Self {
        self.context.checkpoints = checkpoints;
        self
    }

    pub fn streams(&self) -> &[ResolvedStream] {
        &self.streams
    }

    pub fn watermarks(&self) -> &Arc<WatermarkTracker> {
        &self.context.watermarks
    }

    pub fn stats(&self) -> &Arc<PipelineStats> {
        &self.context.stats
    }

    /// Starts all chains on the current tokio runtime.
    pub fn start(self) -> PipelineHandle {
        let token = CancellationToken::new();
        let supervisor = Supervisor {
            streams: self.streams.clone(),
            context: self.context.clone(),
            token: token.clone(),
        };
        PipelineHandle {
            streams: self.streams,
            context: self.context,
            token,
            task: tokio::spawn(supervisor.run()),
        }
    }

    /// Runs the pipeline until it is cancelled through `token` or a stream
    /// fails.
    pub async fn run(self, token: CancellationToken) -> Result<(), PipelineError> {
        let handle = self.start();
        let pipeline_token = handle.cancellation_token();
        tokio::select! {
            _ = token.cancelled() => pipeline_token.cancel(),
            _ = pipeline_token.cancelled() => (),
        }
        handle.join().await
    }
}

/// Handle of a running pipeline.
pub struct PipelineHandle {
    streams: Vec<ResolvedStream>,
    context: ChainContext,
    token: CancellationToken,
    task: JoinHandle<Result<(), PipelineError>>,
}

impl PipelineHandle {
    /// Requests a graceful shutdown.  Use [`join`](Self::join) to wait for
    /// it to complete.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Token cancelled on shutdown or when a stream fails.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn watermarks(&self) -> &Arc<WatermarkTracker> {
        &self.context.watermarks
    }

    pub fn stats(&self) -> &Arc<PipelineStats> {
        &self.context.stats
    }

    /// Snapshot of the watermark and counters of every stream.
    pub fn status(&self) -> PipelineStatus {
        PipelineStatus {
            name: self.context.config.name.clone(),
            cancelled: self.token.is_cancelled(),
            streams: self
                .streams
                .iter()
                .map(|stream| {
                    let metrics = self.context.stats.stream(stream.kind);
                    StreamStatus {
                        stream: stream.kind,
                        topic: stream.topic.clone(),
                        max_event_time: self.context.watermarks.max_event_time(stream.kind),
                        stopped: metrics.stopped.load(Ordering::Acquire),
                        metrics: metrics.snapshot(),
                    }
                })
                .collect(),
        }
    }

    /// Waits for the pipeline to stop.
    pub async fn join(self) -> Result<(), PipelineError> {
        match self.task.await {
            Ok(result) => result,
            Err(error) => Err(PipelineError::SupervisorPanic {
                error: error.to_string(),
            }),
        }
    }
}

struct Supervisor {
    streams: Vec<ResolvedStream>,
    context: ChainContext,
    token: CancellationToken,
}

impl Supervisor {
    fn spawn_chain(
        &self,
        tasks: &mut JoinSet<(StreamKind, Result<(), ChainError>)>,
        stream: ResolvedStream,
    ) {
        let kind = stream.kind;
        let context = self.context.clone();
        let token = self.token.clone();
        let stats = self.context.stats.clone();
        let task = async move {
            let result = AssertUnwindSafe(async move {
                StreamChain::new(stream, &context)?.run(token).await
            })
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(ChainError::panic(panic)));
            stats.stream(kind).stopped.store(true, Ordering::Release);
            (kind, result)
        };
        tasks.spawn(task.instrument(info_span!("stream", kind = %kind)));
    }

    async fn run(self) -> Result<(), PipelineError> {
        let mut tasks = JoinSet::new();
        for stream in self.streams.iter().cloned() {
            self.spawn_chain(&mut tasks, stream);
        }
        info!(
            "pipeline '{}' started with {} streams",
            self.context.config.name,
            self.streams.len()
        );

        let shutdown_timeout = self.context.config.shutdown_timeout();
        let mut deadline: Option<Instant> = None;
        let result = loop {
            tokio::select! {
                joined = tasks.join_next() => match joined {
                    None => break Ok(()),
                    Some(Ok((kind, Ok(())))) => info!("stream '{kind}' stopped"),
                    Some(Ok((kind, Err(error)))) => {
                        let error = PipelineError::stream(kind, error);
                        error!("{error}; stopping the pipeline");
                        self.token.cancel();
                        tasks.abort_all();
                        break Err(error);
                    }
                    Some(Err(error)) => error!("stream task failed: {error}"),
                },
                _ = self.token.cancelled(), if deadline.is_none() => {
                    info!("shutdown requested; draining {} streams", tasks.len());
                    deadline = Some(Instant::now() + shutdown_timeout);
                }
                _ = wait_until(deadline) => {
                    let pending = self.pending_streams();
                    tasks.abort_all();
                    break Err(PipelineError::ShutdownTimeout {
                        timeout: shutdown_timeout,
                        pending,
                    });
                }
            }
        };
        self.log_summary();
        result
    }

    fn pending_streams(&self) -> Vec<StreamKind> {
        self.streams
            .iter()
            .map(|stream| stream.kind)
            .filter(|kind| !self.context.stats.stream(*kind).stopped.load(Ordering::Acquire))
            .collect()
    }

    fn log_summary(&self) {
        for stream in self.streams.iter() {
            let counters = self.context.stats.stream(stream.kind).snapshot();
            info!(
                "stream '{}': {} messages read, {} records accepted, {} late, {} malformed, {} batches, {} records written ({} bytes), {} storage retries, watermark {:?}",
                stream.kind,
                counters.messages_read,
                counters.records_accepted,
                counters.late_records,
                counters.decode_errors,
                counters.batches_flushed,
                counters.records_written,
                counters.bytes_written,
                counters.storage_retries,
                self.context.watermarks.max_event_time(stream.kind),
            );
        }
    }
}

/// Completes at `deadline`, or never if there is none.
async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}
