//! Pipeline configuration.
//!
//! The configuration is a YAML document.  Every section has defaults, so
//! an empty document describes a pipeline that ingests all five streams
//! from `broker:29092` into an in-memory object store.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use crate::error::ConfigError;
use crate::StreamKind;

/// Default value of [`PipelineConfig::allowed_lateness_secs`].
pub const fn default_allowed_lateness_secs() -> u64 {
    120
}

/// Default value of [`BatchConfig::max_records`].
pub const fn default_max_records() -> usize {
    10_000
}

/// Default value of [`BatchConfig::max_age_ms`].
pub const fn default_max_age_ms() -> u64 {
    10_000
}

/// Default value of [`BatchConfig::pull_size`].
pub const fn default_pull_size() -> usize {
    1_000
}

pub const fn default_poll_timeout_ms() -> u64 {
    1_000
}

pub const fn default_storage_timeout_ms() -> u64 {
    30_000
}

pub const fn default_shutdown_timeout_ms() -> u64 {
    60_000
}

fn default_bootstrap_servers() -> String {
    "broker:29092".to_string()
}

fn default_storage_url() -> String {
    "memory://".to_string()
}

fn default_name() -> String {
    "smartcity".to_string()
}

fn default_true() -> bool {
    true
}

/// Top-level pipeline configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    /// Pipeline name, used as the log line prefix.
    #[serde(default = "default_name")]
    pub name: String,

    /// `tracing` filter directives.  `RUST_LOG` takes precedence.
    #[serde(default)]
    pub logging: Option<String>,

    #[serde(default)]
    pub kafka: KafkaConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    /// Per-stream overrides.  Streams not listed here are enabled with
    /// their default topic and paths.
    #[serde(default)]
    pub streams: BTreeMap<StreamKind, StreamConfig>,

    /// How far behind the stream's maximum event time a record may arrive
    /// before it is considered late.
    #[serde(default = "default_allowed_lateness_secs")]
    pub allowed_lateness_secs: u64,

    #[serde(default)]
    pub late_data: LateDataPolicy,

    #[serde(default)]
    pub batch: BatchConfig,

    /// Upper bound on a single pull from the message source.
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,

    /// Upper bound on a single object store call.  A call that exceeds it
    /// is retried like any other storage outage.
    #[serde(default = "default_storage_timeout_ms")]
    pub storage_timeout_ms: u64,

    #[serde(default)]
    pub retry: RetryConfig,

    /// How long a shutdown request waits for the streams to drain before
    /// they are aborted.
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            logging: None,
            kafka: KafkaConfig::default(),
            storage: StorageConfig::default(),
            streams: BTreeMap::new(),
            allowed_lateness_secs: default_allowed_lateness_secs(),
            late_data: LateDataPolicy::default(),
            batch: BatchConfig::default(),
            poll_timeout_ms: default_poll_timeout_ms(),
            storage_timeout_ms: default_storage_timeout_ms(),
            retry: RetryConfig::default(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }
}

/// Kafka logging levels.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum KafkaLogLevel {
    Emerg,
    Alert,
    Critical,
    Error,
    Warning,
    Notice,
    Info,
    Debug,
}

/// Kafka consumer settings shared by all streams.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KafkaConfig {
    #[serde(default = "default_bootstrap_servers")]
    pub bootstrap_servers: String,

    /// Additional librdkafka options, e.g. `security.protocol`.  Values of
    /// the form `${env:NAME}` are read from the environment.
    #[serde(default)]
    pub options: BTreeMap<String, String>,

    /// Maximum severity of librdkafka log messages forwarded to the log.
    #[serde(default)]
    pub log_level: Option<KafkaLogLevel>,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: default_bootstrap_servers(),
            options: BTreeMap::new(),
            log_level: None,
        }
    }
}

/// Object store the streams are written to.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    /// `s3://bucket[/prefix]`, `file:///dir` or `memory://`.
    #[serde(default = "default_storage_url")]
    pub url: String,

    /// Options passed to the `object_store` builder, e.g.
    /// `aws_access_key_id`.  Values of the form `${env:NAME}` are read from
    /// the environment.
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            url: default_storage_url(),
            options: BTreeMap::new(),
        }
    }
}

/// Per-stream overrides.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StreamConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub topic: Option<String>,
    pub output_path: Option<String>,
    pub checkpoint_path: Option<String>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            topic: None,
            output_path: None,
            checkpoint_path: None,
        }
    }
}

/// What happens to records that arrive behind the watermark cutoff.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LateDataPolicy {
    /// Count and discard.
    #[default]
    Drop,

    /// Write to a separate `_late/` prefix next to the stream output.
    SideOutput,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BatchConfig {
    /// Flush once the batch holds this many records.
    #[serde(default = "default_max_records")]
    pub max_records: usize,

    /// Flush once the oldest buffered record is this old.
    #[serde(default = "default_max_age_ms")]
    pub max_age_ms: u64,

    /// Maximum number of messages requested from the source per pull.
    #[serde(default = "default_pull_size")]
    pub pull_size: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_records: default_max_records(),
            max_age_ms: default_max_age_ms(),
            pull_size: default_pull_size(),
        }
    }
}

impl BatchConfig {
    pub fn max_age(&self) -> Duration {
        Duration::from_millis(self.max_age_ms)
    }
}

/// Bounded exponential backoff for object store calls.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    #[serde(default = "RetryConfig::default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "RetryConfig::default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "RetryConfig::default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Number of consecutive failures after which each retry is logged as
    /// a warning rather than at debug level.
    #[serde(default = "RetryConfig::default_warn_after")]
    pub warn_after: u32,
}

impl RetryConfig {
    const fn default_max_retries() -> u32 {
        10
    }

    const fn default_initial_backoff_ms() -> u64 {
        100
    }

    const fn default_max_backoff_ms() -> u64 {
        30_000
    }

    const fn default_warn_after() -> u32 {
        3
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(32);
        Duration::from_millis(
            self.initial_backoff_ms
                .saturating_mul(factor)
                .min(self.max_backoff_ms),
        )
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: Self::default_max_retries(),
            initial_backoff_ms: Self::default_initial_backoff_ms(),
            max_backoff_ms: Self::default_max_backoff_ms(),
            warn_after: Self::default_warn_after(),
        }
    }
}

/// Topic and object-store locations of one enabled stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedStream {
    pub kind: StreamKind,
    pub topic: String,
    pub output_path: String,
    pub checkpoint_path: String,
}

impl ResolvedStream {
    /// Locations that must be unique across enabled streams.
    fn locations(&self) -> [(&'static str, &str); 3] {
        [
            ("topic", &self.topic),
            ("output path", &self.output_path),
            ("checkpoint path", &self.checkpoint_path),
        ]
    }
}

impl PipelineConfig {
    /// Parses a YAML configuration document.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        // An empty file is a valid configuration with all defaults.
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(yaml).map_err(|e| ConfigError::Parse {
            error: e.to_string(),
        })
    }

    pub fn allowed_lateness(&self) -> Duration {
        Duration::from_secs(self.allowed_lateness_secs)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn storage_timeout(&self) -> Duration {
        Duration::from_millis(self.storage_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Enabled streams, in [`StreamKind::ALL`] order, with defaults filled
    /// in.
    pub fn resolved_streams(&self) -> Vec<ResolvedStream> {
        StreamKind::ALL
            .into_iter()
            .filter_map(|kind| {
                let overrides = self.streams.get(&kind).cloned().unwrap_or_default();
                overrides.enabled.then(|| ResolvedStream {
                    kind,
                    topic: overrides.topic.unwrap_or_else(|| kind.default_topic()),
                    output_path: overrides
                        .output_path
                        .unwrap_or_else(|| kind.default_output_path()),
                    checkpoint_path: overrides
                        .checkpoint_path
                        .unwrap_or_else(|| kind.default_checkpoint_path()),
                })
            })
            .collect()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("batch.max_records", self.batch.max_records as u64),
            ("batch.max_age_ms", self.batch.max_age_ms),
            ("batch.pull_size", self.batch.pull_size as u64),
            ("poll_timeout_ms", self.poll_timeout_ms),
            ("storage_timeout_ms", self.storage_timeout_ms),
            ("retry.initial_backoff_ms", self.retry.initial_backoff_ms),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::invalid_value(field, "must be greater than 0"));
            }
        }
        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            return Err(ConfigError::invalid_value(
                "retry.max_backoff_ms",
                format!(
                    "must not be less than retry.initial_backoff_ms ({})",
                    self.retry.initial_backoff_ms
                ),
            ));
        }
        if self.kafka.bootstrap_servers.trim().is_empty() {
            return Err(ConfigError::invalid_value(
                "kafka.bootstrap_servers",
                "must not be empty",
            ));
        }

        let streams = self.resolved_streams();
        if streams.is_empty() {
            return Err(ConfigError::NoStreams);
        }
        for stream in &streams {
            if stream.topic.trim().is_empty() {
                return Err(ConfigError::invalid_value(
                    &format!("streams.{}.topic", stream.kind),
                    "must not be empty",
                ));
            }
        }

        for index in 0..3 {
            let mut seen: HashMap<&str, StreamKind> = HashMap::new();
            for stream in &streams {
                let (what, value) = stream.locations()[index];
                if let Some(first) = seen.insert(value, stream.kind) {
                    return Err(ConfigError::DuplicateLocation {
                        what,
                        value: value.to_string(),
                        first: first.to_string(),
                        second: stream.kind.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Replaces `${env:NAME}` references in Kafka and storage options with
    /// the values of the corresponding environment variables.
    pub fn resolve_env_references(&mut self) -> Result<(), ConfigError> {
        self.resolve_references_with(|name| std::env::var(name).ok())
    }

    /// Like [`Self::resolve_env_references`], with a custom variable lookup.
    pub fn resolve_references_with<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let sections = [
            ("kafka.options", &mut self.kafka.options),
            ("storage.options", &mut self.storage.options),
        ];
        for (section, options) in sections {
            for (key, value) in options.iter_mut() {
                if let Some(resolved) =
                    resolve_env_reference(&format!("{section}.{key}"), value, &lookup)?
                {
                    *value = resolved;
                }
            }
        }
        Ok(())
    }
}

/// Resolves `value` if it has the form `${env:NAME}`.
///
/// Returns `Ok(None)` for plain values.
pub fn resolve_env_reference<F>(
    option: &str,
    value: &str,
    lookup: F,
) -> Result<Option<String>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(variable) = value
        .strip_prefix("${env:")
        .and_then(|rest| rest.strip_suffix('}'))
    else {
        return Ok(None);
    };
    lookup(variable)
        .map(Some)
        .ok_or_else(|| ConfigError::UnresolvedEnvReference {
            option: option.to_string(),
            variable: variable.to_string(),
        })
}
