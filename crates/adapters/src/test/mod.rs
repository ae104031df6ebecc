//! Test framework for the `adapters` crate.
//!
//! Helpers to build event payloads, run pipelines against a
//! [`MemoryBroker`](crate::transport::MemoryBroker) and an in-memory object
//! store, inject storage failures, and inspect the output.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use serde_json::json;
use smartcity_storage::error::StorageError;
use smartcity_storage::{storage_path, BlobStore, ObjectStoreBackend, StoragePath};
use smartcity_types::config::{PipelineConfig, StreamConfig};
use smartcity_types::StreamKind;
use std::io::ErrorKind;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use arrow::array::{Array, StringArray};

pub static DEFAULT_TIMEOUT_MS: u128 = 600_000;

/// Wait for `predicate` to become `true`.
///
/// Returns the number of milliseconds elapsed or `Err(())` on timeout.
#[allow(clippy::result_unit_err)]
pub async fn async_wait<P>(mut predicate: P, timeout_ms: u128) -> Result<u128, ()>
where
    P: FnMut() -> bool,
{
    let start = Instant::now();

    while !predicate() {
        if start.elapsed().as_millis() >= timeout_ms {
            return Err(());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    Ok(start.elapsed().as_millis())
}

pub(crate) fn init_test_logger() {
    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .with(
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new("info"))
                .unwrap(),
        )
        .try_init();
}

fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
}

pub fn vehicle_payload(id: &str, ts: DateTime<Utc>) -> String {
    json!({
        "id": id,
        "device_id": "Vehicle-CodeWithYu-123",
        "timestamp": format_timestamp(ts),
        "location": {"latitude": 51.5074, "longitude": -0.1278},
        "speed": 42.0,
        "direction": "North-East",
        "make": "BMW",
        "model": "C500",
        "year": 2024,
        "fuel_type": "Hybrid"
    })
    .to_string()
}

pub fn traffic_payload(id: &str, ts: DateTime<Utc>) -> String {
    json!({
        "id": id,
        "device_id": "Vehicle-CodeWithYu-123",
        "cameraId": "Nikon-Cam123",
        "location": "51.5074,-0.1278",
        "timestamp": format_timestamp(ts),
        "snapshot": "Base64EncodedString"
    })
    .to_string()
}

/// Configuration with only `streams` enabled, short timeouts and fast
/// retries.
pub fn test_config(streams: &[StreamKind]) -> PipelineConfig {
    let mut config = PipelineConfig {
        name: "test".to_string(),
        poll_timeout_ms: 100,
        storage_timeout_ms: 5_000,
        shutdown_timeout_ms: 10_000,
        ..PipelineConfig::default()
    };
    config.retry.initial_backoff_ms = 100;
    config.retry.max_backoff_ms = 1_000;
    config.retry.max_retries = 5;
    for kind in StreamKind::ALL {
        if !streams.contains(&kind) {
            config.streams.insert(
                kind,
                StreamConfig {
                    enabled: false,
                    ..StreamConfig::default()
                },
            );
        }
    }
    config
}

pub fn memory_store() -> Arc<ObjectStoreBackend> {
    Arc::new(ObjectStoreBackend::in_memory(Duration::from_secs(5)))
}

/// Ids of the records in the data files under `prefix`, in file order.
/// Late-record files are not included.
pub async fn output_ids(store: &dyn BlobStore, prefix: &str) -> Vec<String> {
    let mut ids = Vec::new();
    for path in output_files(store, prefix).await {
        ids.extend(parquet_ids(store, &path).await);
    }
    ids
}

/// Data files under `prefix`, excluding late-record files.
pub async fn output_files(store: &dyn BlobStore, prefix: &str) -> Vec<StoragePath> {
    store
        .list(&storage_path(prefix).unwrap())
        .await
        .unwrap()
        .into_iter()
        .filter(|path| !path.parts().any(|part| part.as_ref() == "_late"))
        .collect()
}

/// Values of the `id` column of the Parquet file at `path`.
pub async fn parquet_ids(store: &dyn BlobStore, path: &StoragePath) -> Vec<String> {
    let data = store.get(path).await.unwrap().unwrap();
    let reader = ParquetRecordBatchReaderBuilder::try_new(data)
        .unwrap()
        .build()
        .unwrap();
    let mut ids = Vec::new();
    for batch in reader {
        let batch = batch.unwrap();
        let column = batch
            .column_by_name("id")
            .unwrap()
            .as_any()
            .downcast_ref::<StringArray>()
            .unwrap()
            .clone();
        ids.extend((0..column.len()).map(|i| column.value(i).to_string()));
    }
    ids
}

/// How [`FlakyBlobStore`] fails a `put`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PutFailure {
    /// Fails with a retryable error.
    Transient,

    /// Fails with a permission error, which is not retried.
    Permanent,

    /// Stores only the first half of the object and reports success.
    Truncate,
}

/// [`BlobStore`] wrapper that fails the next `n` writes to paths under a
/// given prefix.
#[derive(Debug)]
pub struct FlakyBlobStore {
    inner: Arc<dyn BlobStore>,
    failure: Mutex<Option<(String, PutFailure)>>,
    remaining: AtomicUsize,
    puts: AtomicUsize,
}

impl FlakyBlobStore {
    pub fn new(inner: Arc<dyn BlobStore>) -> Self {
        Self {
            inner,
            failure: Mutex::new(None),
            remaining: AtomicUsize::new(0),
            puts: AtomicUsize::new(0),
        }
    }

    /// Fails the next `n` puts under `prefix` with `failure`.
    pub fn fail_puts(&self, prefix: &str, failure: PutFailure, n: usize) {
        *self.failure.lock().unwrap() = Some((prefix.to_string(), failure));
        self.remaining.store(n, Ordering::Release);
    }

    /// Number of put attempts, including failed ones.
    pub fn puts(&self) -> usize {
        self.puts.load(Ordering::Acquire)
    }

    fn failure_for(&self, path: &StoragePath) -> Option<PutFailure> {
        let failure = self.failure.lock().unwrap();
        let (prefix, failure) = failure.as_ref()?;
        if !path.as_ref().starts_with(prefix.as_str()) {
            return None;
        }
        self.remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .ok()
            .map(|_| *failure)
    }
}

#[async_trait]
impl BlobStore for FlakyBlobStore {
    async fn put(&self, path: &StoragePath, data: Bytes) -> Result<(), StorageError> {
        self.puts.fetch_add(1, Ordering::AcqRel);
        match self.failure_for(path) {
            None => self.inner.put(path, data).await,
            Some(PutFailure::Transient) => Err(StorageError::ObjectStore {
                kind: ErrorKind::Other,
                message: format!("injected failure writing '{path}'"),
            }),
            Some(PutFailure::Permanent) => Err(StorageError::ObjectStore {
                kind: ErrorKind::PermissionDenied,
                message: format!("injected permission error writing '{path}'"),
            }),
            Some(PutFailure::Truncate) => {
                let half = data.slice(..data.len() / 2);
                self.inner.put(path, half).await
            }
        }
    }

    async fn get(&self, path: &StoragePath) -> Result<Option<Bytes>, StorageError> {
        self.inner.get(path).await
    }

    async fn size(&self, path: &StoragePath) -> Result<Option<u64>, StorageError> {
        self.inner.size(path).await
    }

    async fn list(&self, prefix: &StoragePath) -> Result<Vec<StoragePath>, StorageError> {
        self.inner.list(prefix).await
    }
}
