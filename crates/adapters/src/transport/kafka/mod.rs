//! Kafka message source.
//!
//! Each stream gets its own consumer with a unique group id.  The consumer
//! does not join a consumer group: partitions are assigned manually with
//! explicit start offsets taken from the stream's checkpoint, and offsets
//! are never committed to Kafka.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Error as AnyError};
use async_trait::async_trait;
use bytes::Bytes;
use crossbeam::queue::ArrayQueue;
use rdkafka::{
    client::{Client as KafkaClient, ClientContext},
    config::{FromClientConfigAndContext, RDKafkaLogLevel},
    consumer::{BaseConsumer, Consumer, ConsumerContext},
    error::KafkaError,
    types::RDKafkaErrorCode,
    ClientConfig, Message, Offset, TopicPartitionList,
};
use smartcity_types::checkpoint::SourcePosition;
use smartcity_types::config::{KafkaConfig, KafkaLogLevel, ResolvedStream};
use smartcity_types::StreamKind;
use tokio::task::spawn_blocking;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{MessageSource, RawMessage, SourceError, SourceProvider};


const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

// Size of the circular buffer used to pass errors from ClientContext
// to the polling task.
const ERROR_BUFFER_SIZE: usize = 1000;

fn rdkafka_loglevel_from(level: KafkaLogLevel) -> RDKafkaLogLevel {
    match level {
        KafkaLogLevel::Emerg => RDKafkaLogLevel::Emerg,
        KafkaLogLevel::Alert => RDKafkaLogLevel::Alert,
        KafkaLogLevel::Critical => RDKafkaLogLevel::Critical,
        KafkaLogLevel::Error => RDKafkaLogLevel::Error,
        KafkaLogLevel::Warning => RDKafkaLogLevel::Warning,
        KafkaLogLevel::Notice => RDKafkaLogLevel::Notice,
        KafkaLogLevel::Info => RDKafkaLogLevel::Info,
        KafkaLogLevel::Debug => RDKafkaLogLevel::Debug,
    }
}

/// If `e` is an error of type `RDKafkaErrorCode::Fatal`, replace
/// it with the result of calling `client.fatal_error()` (which
/// should return the actual cause of the failure).  Otherwise,
/// returns `e`.  The first element of the returned tuple is
/// `true` if `e` is a fatal error.
fn refine_kafka_error<C>(client: &KafkaClient<C>, e: KafkaError) -> (bool, AnyError)
where
    C: ClientContext,
{
    match e.rdkafka_error_code() {
        None => (false, AnyError::from(e)),
        Some(RDKafkaErrorCode::Fatal) => {
            if let Some((_errcode, errstr)) = client.fatal_error() {
                (true, AnyError::msg(errstr))
            } else {
                (true, AnyError::from(e))
            }
        }
        _ => (false, AnyError::from(e)),
    }
}

/// librdkafka client configuration for the consumer of `stream`.
///
/// User-supplied `options` are applied last and override the defaults.
fn client_config(config: &KafkaConfig, stream: &ResolvedStream) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", &config.bootstrap_servers)
        .set(
            "group.id",
            format!("smartcity-{}-{}", stream.kind, Uuid::new_v4()),
        )
        .set("enable.auto.commit", "false")
        .set("enable.auto.offset.store", "false")
        .set("auto.offset.reset", "earliest");
    for (key, value) in config.options.iter() {
        client_config.set(key, value);
    }
    if let Some(log_level) = config.log_level {
        client_config.set_log_level(rdkafka_loglevel_from(log_level));
    }
    client_config
}

/// Opens a [`KafkaSource`] for each stream.
pub struct KafkaSourceProvider {
    config: KafkaConfig,
}

impl KafkaSourceProvider {
    pub fn new(config: &KafkaConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }
}

impl SourceProvider for KafkaSourceProvider {
    fn open(&self, stream: &ResolvedStream) -> Result<Box<dyn MessageSource>, SourceError> {
        Ok(Box::new(KafkaSource::new(&self.config, stream)?))
    }
}

/// Client context that forwards librdkafka logs to `tracing` and collects
/// errors reported outside of `poll`.
struct KafkaSourceContext {
    kind: StreamKind,
    errors: Arc<ArrayQueue<(KafkaError, String)>>,
}

impl ClientContext for KafkaSourceContext {
    fn log(&self, level: RDKafkaLogLevel, fac: &str, log_message: &str) {
        let kind = self.kind;
        match level {
            RDKafkaLogLevel::Emerg
            | RDKafkaLogLevel::Alert
            | RDKafkaLogLevel::Critical
            | RDKafkaLogLevel::Error => error!("[{kind}] librdkafka {fac}: {log_message}"),
            RDKafkaLogLevel::Warning => warn!("[{kind}] librdkafka {fac}: {log_message}"),
            RDKafkaLogLevel::Notice | RDKafkaLogLevel::Info => {
                info!("[{kind}] librdkafka {fac}: {log_message}")
            }
            RDKafkaLogLevel::Debug => debug!("[{kind}] librdkafka {fac}: {log_message}"),
        }
    }

    fn error(&self, error: KafkaError, reason: &str) {
        // `force_push` makes the queue operate as a circular buffer.
        self.errors.force_push((error, reason.to_string()));
    }
}

impl ConsumerContext for KafkaSourceContext {}

struct KafkaSourceInner {
    kind: StreamKind,
    topic: String,
    kafka_consumer: BaseConsumer<KafkaSourceContext>,
    errors: Arc<ArrayQueue<(KafkaError, String)>>,
}

impl KafkaSourceInner {
    fn refine_error(&self, e: KafkaError) -> (bool, AnyError) {
        refine_kafka_error(self.kafka_consumer.client(), e)
    }

    /// Reports the first fatal error queued by the client context.  Other
    /// errors are logged and discarded.
    fn check_errors(&self) -> Result<(), SourceError> {
        while let Some((error, reason)) = self.errors.pop() {
            let (fatal, _e) = self.refine_error(error);
            // `reason` contains a human-readable description of the
            // error.
            if fatal {
                return Err(SourceError::fatal(anyhow!(reason)));
            }
            warn!("Kafka error on topic '{}': {reason}", self.topic);
        }
        Ok(())
    }

    /// Assigns every partition of the topic, starting after the offsets
    /// recorded in `position`.
    fn assign(&self, position: &SourcePosition) -> Result<(), SourceError> {
        let metadata = self
            .kafka_consumer
            .fetch_metadata(Some(self.topic.as_str()), METADATA_TIMEOUT)
            .map_err(|e| {
                let (_fatal, e) = self.refine_error(e);
                SourceError::fatal(anyhow!(
                    "error fetching metadata for topic '{}': {e}",
                    self.topic
                ))
            })?;
        let topic = metadata
            .topics()
            .first()
            .filter(|topic| topic.error().is_none() && !topic.partitions().is_empty())
            .ok_or_else(|| {
                SourceError::fatal(anyhow!(
                    "failed to assign topic '{}': topic doesn't exist",
                    self.topic
                ))
            })?;

        let mut assignment = TopicPartitionList::new();
        for partition in topic.partitions() {
            let offset = match position.get(partition.id()) {
                Some(offset) => Offset::Offset(offset + 1),
                None => Offset::Beginning,
            };
            debug!(
                "starting to read from topic: '{}', partition: '{}', offset: '{offset:?}'",
                self.topic,
                partition.id()
            );
            assignment
                .add_partition_offset(&self.topic, partition.id(), offset)
                .map_err(|error| SourceError::fatal(self.refine_error(error).1))?;
        }
        self.kafka_consumer
            .assign(&assignment)
            .map_err(|e| SourceError::fatal(anyhow!("error assigning partitions: {e}")))?;
        self.check_errors()
    }

    fn poll_batch(&self, max: usize, timeout: Duration) -> Result<Vec<RawMessage>, SourceError> {
        let deadline = Instant::now() + timeout;
        let mut messages = Vec::new();
        while messages.len() < max {
            // Wait for the first message only; afterwards take whatever is
            // already buffered.
            let wait = if messages.is_empty() {
                deadline.saturating_duration_since(Instant::now())
            } else {
                Duration::ZERO
            };
            match self.kafka_consumer.poll(wait) {
                None => break,
                Some(Err(e)) => {
                    let (fatal, e) = self.refine_error(e);
                    if fatal {
                        return Err(SourceError::fatal(e));
                    }
                    warn!("error polling topic '{}': {e}", self.topic);
                    if Instant::now() >= deadline {
                        break;
                    }
                }
                Some(Ok(message)) => messages.push(RawMessage {
                    kind: self.kind,
                    partition: message.partition(),
                    offset: message.offset(),
                    payload: Bytes::copy_from_slice(message.payload().unwrap_or_default()),
                }),
            }
        }
        self.check_errors()?;
        Ok(messages)
    }
}

/// [`MessageSource`] reading one Kafka topic.
///
/// librdkafka calls block, so they run on the blocking thread pool.
pub struct KafkaSource {
    inner: Arc<KafkaSourceInner>,
}

impl KafkaSource {
    pub fn new(config: &KafkaConfig, stream: &ResolvedStream) -> Result<Self, SourceError> {
        debug!(
            "Creating Kafka consumer for stream '{}', topic '{}'",
            stream.kind, stream.topic
        );
        let errors = Arc::new(ArrayQueue::new(ERROR_BUFFER_SIZE));
        let context = KafkaSourceContext {
            kind: stream.kind,
            errors: errors.clone(),
        };
        let kafka_consumer =
            BaseConsumer::from_config_and_context(&client_config(config, stream), context)
                .map_err(|e| SourceError::fatal(anyhow!("error creating Kafka consumer: {e}")))?;
        Ok(Self {
            inner: Arc::new(KafkaSourceInner {
                kind: stream.kind,
                topic: stream.topic.clone(),
                kafka_consumer,
                errors,
            }),
        })
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, SourceError>
    where
        T: Send + 'static,
        F: FnOnce(&KafkaSourceInner) -> Result<T, SourceError> + Send + 'static,
    {
        let inner = self.inner.clone();
        spawn_blocking(move || f(&inner))
            .await
            .map_err(|e| SourceError::fatal(anyhow!("Kafka polling task failed: {e}")))?
    }
}

#[async_trait]
impl MessageSource for KafkaSource {
    async fn seek(&mut self, position: &SourcePosition) -> Result<(), SourceError> {
        let position = position.clone();
        self.blocking(move |inner| inner.assign(&position)).await
    }

    async fn pull(
        &mut self,
        max: usize,
        timeout: Duration,
    ) -> Result<Vec<RawMessage>, SourceError> {
        self.blocking(move |inner| inner.poll_batch(max, timeout))
            .await
    }
}
