//! Object store access for the smart-city pipeline.
//!
//! All output files and checkpoints go through the [`BlobStore`] trait, which
//! is implemented on top of the `object_store` crate for S3, GCS, Azure,
//! local files and memory.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Future, TryStreamExt};
use object_store::memory::InMemory;
use object_store::{ObjectStore, PutPayload};
use tracing::{debug, trace};
use url::Url;

pub use object_store::path::Path as StoragePath;

use crate::error::StorageError;

pub mod error;
pub mod tokio;

/// Parses a `/`-separated relative path into a [`StoragePath`].
pub fn storage_path(path: &str) -> Result<StoragePath, StorageError> {
    StoragePath::parse(path.trim_matches('/'))
        .map_err(|_| StorageError::InvalidPath(path.to_string()))
}

/// Appends the `/`-separated `suffix` to `base`.
pub fn join_path(base: &StoragePath, suffix: &str) -> StoragePath {
    suffix
        .split('/')
        .filter(|part| !part.is_empty())
        .fold(base.clone(), |path, part| path.child(part))
}

/// A flat namespace of immutable objects.
///
/// Implementations must be safe for concurrent use by all pipeline streams.
#[async_trait]
pub trait BlobStore: Send + Sync + Debug {
    /// Writes `data` to `path`, replacing any existing object.  The write is
    /// atomic: readers observe either the old object or the new one.
    async fn put(&self, path: &StoragePath, data: Bytes) -> Result<(), StorageError>;

    /// Reads the object at `path`, or `None` if it does not exist.
    async fn get(&self, path: &StoragePath) -> Result<Option<Bytes>, StorageError>;

    /// Returns the size of the object at `path`, or `None` if it does not
    /// exist.
    async fn size(&self, path: &StoragePath) -> Result<Option<u64>, StorageError>;

    /// Lists the objects under `prefix`, in lexicographic order.
    async fn list(&self, prefix: &StoragePath) -> Result<Vec<StoragePath>, StorageError>;
}

/// [`BlobStore`] backed by an [`ObjectStore`], rooted at a prefix.
#[derive(Debug)]
pub struct ObjectStoreBackend {
    store: Arc<dyn ObjectStore>,
    prefix: StoragePath,
    timeout: Duration,
}

impl ObjectStoreBackend {
    pub fn new(store: Arc<dyn ObjectStore>, prefix: StoragePath, timeout: Duration) -> Self {
        Self {
            store,
            prefix,
            timeout,
        }
    }

    /// In-memory backend, used by tests and by the `memory://` URL.
    pub fn in_memory(timeout: Duration) -> Self {
        Self::new(Arc::new(InMemory::new()), StoragePath::default(), timeout)
    }

    /// Opens the object store identified by `url`.
    ///
    /// `options` are passed to the store builder, e.g. `aws_region` for
    /// `s3://` URLs.  Every call to the returned store is bounded by
    /// `timeout`.
    pub fn open<I, K, V>(url: &str, options: I, timeout: Duration) -> Result<Self, StorageError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let parsed = Url::parse(url).map_err(|_| StorageError::InvalidURL(url.to_string()))?;
        if parsed.scheme() == "memory" {
            return Ok(Self::in_memory(timeout));
        }
        let (store, prefix) = object_store::parse_url_opts(&parsed, options)?;
        debug!("opened object store {url}");
        Ok(Self::new(Arc::from(store), prefix, timeout))
    }

    fn full_path(&self, path: &StoragePath) -> StoragePath {
        self.prefix.parts().chain(path.parts()).collect()
    }

    async fn bounded<T, F>(&self, operation: F) -> Result<T, StorageError>
    where
        F: Future<Output = Result<T, object_store::Error>>,
    {
        match ::tokio::time::timeout(self.timeout, operation).await {
            Ok(result) => result.map_err(StorageError::from),
            Err(_elapsed) => Err(StorageError::Timeout(self.timeout)),
        }
    }
}

#[async_trait]
impl BlobStore for ObjectStoreBackend {
    async fn put(&self, path: &StoragePath, data: Bytes) -> Result<(), StorageError> {
        let full_path = self.full_path(path);
        trace!("put {full_path} ({} bytes)", data.len());
        self.bounded(self.store.put(&full_path, PutPayload::from(data)))
            .await?;
        Ok(())
    }

    async fn get(&self, path: &StoragePath) -> Result<Option<Bytes>, StorageError> {
        let full_path = self.full_path(path);
        let result = self
            .bounded(async { self.store.get(&full_path).await?.bytes().await })
            .await;
        match result {
            Ok(bytes) => Ok(Some(bytes)),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error),
        }
    }

    async fn size(&self, path: &StoragePath) -> Result<Option<u64>, StorageError> {
        let full_path = self.full_path(path);
        match self.bounded(self.store.head(&full_path)).await {
            Ok(meta) => Ok(Some(meta.size as u64)),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error),
        }
    }

    async fn list(&self, prefix: &StoragePath) -> Result<Vec<StoragePath>, StorageError> {
        let full_prefix = self.full_path(prefix);
        let objects: Vec<_> = self
            .bounded(self.store.list(Some(&full_prefix)).try_collect())
            .await?;
        let mut paths: Vec<StoragePath> = objects
            .into_iter()
            .filter_map(|meta| {
                meta.location
                    .prefix_match(&self.prefix)
                    .map(|parts| parts.collect())
            })
            .collect();
        paths.sort();
        Ok(paths)
    }
}
