//! Durable per-stream checkpoints.
//!
//! The checkpoint of a stream is one JSON document,
//! `<checkpoint_path>/checkpoint.json`, replaced atomically by every commit.
//! Checkpoints only move forward: a commit whose position is behind the
//! stored one, or that claims the stored position for a different batch, is
//! rejected with [`CheckpointError::ConflictingOffset`].

use async_trait::async_trait;
use enum_map::EnumMap;
use smartcity_storage::error::StorageError;
use smartcity_storage::{join_path, storage_path, BlobStore, StoragePath};
use smartcity_types::checkpoint::CheckpointRecord;
use smartcity_types::config::ResolvedStream;
use smartcity_types::StreamKind;
use std::borrow::Cow;
use std::sync::Arc;
use thiserror::Error as ThisError;
use tracing::debug;

use super::error::DetailedError;

/// Name of the checkpoint object under a stream's checkpoint path.
pub const CHECKPOINT_FILE: &str = "checkpoint.json";

#[derive(Debug, ThisError)]
pub enum CheckpointError {
    #[error("checkpoint storage unavailable: {0}")]
    StorageUnavailable(#[from] StorageError),

    #[error("conflicting checkpoint for stream '{kind}': {message}")]
    ConflictingOffset { kind: StreamKind, message: String },

    #[error("corrupted checkpoint for stream '{kind}' at '{path}': {error}")]
    Corrupted {
        kind: StreamKind,
        path: String,
        error: String,
    },

    #[error("no checkpoint location configured for stream '{0}'")]
    NotConfigured(StreamKind),
}

impl CheckpointError {
    /// True if the operation may succeed when retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::StorageUnavailable(error) if error.is_transient())
    }
}

impl DetailedError for CheckpointError {
    fn error_code(&self) -> Cow<'static, str> {
        match self {
            Self::StorageUnavailable(_) => Cow::from("CheckpointStorageUnavailable"),
            Self::ConflictingOffset { .. } => Cow::from("ConflictingOffset"),
            Self::Corrupted { .. } => Cow::from("CorruptedCheckpoint"),
            Self::NotConfigured(_) => Cow::from("CheckpointNotConfigured"),
        }
    }
}

/// Durable store of the last committed [`CheckpointRecord`] of each stream.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Atomically replaces the checkpoint of `kind` with `record`.
    /// Re-committing the stored record is a no-op.
    async fn commit(&self, kind: StreamKind, record: &CheckpointRecord)
        -> Result<(), CheckpointError>;

    /// Returns the last committed checkpoint of `kind`, or `None` if the
    /// stream has never committed one.
    async fn last_committed(
        &self,
        kind: StreamKind,
    ) -> Result<Option<CheckpointRecord>, CheckpointError>;
}

/// [`CheckpointStore`] that keeps checkpoints in a [`BlobStore`].
#[derive(Debug)]
pub struct BlobCheckpointStore {
    store: Arc<dyn BlobStore>,
    paths: EnumMap<StreamKind, Option<StoragePath>>,
}

impl BlobCheckpointStore {
    pub fn new(store: Arc<dyn BlobStore>, streams: &[ResolvedStream]) -> Result<Self, StorageError> {
        let mut paths = EnumMap::default();
        for stream in streams {
            paths[stream.kind] = Some(join_path(
                &storage_path(&stream.checkpoint_path)?,
                CHECKPOINT_FILE,
            ));
        }
        Ok(Self { store, paths })
    }

    fn path(&self, kind: StreamKind) -> Result<&StoragePath, CheckpointError> {
        self.paths[kind]
            .as_ref()
            .ok_or(CheckpointError::NotConfigured(kind))
    }
}

#[async_trait]
impl CheckpointStore for BlobCheckpointStore {
    async fn commit(
        &self,
        kind: StreamKind,
        record: &CheckpointRecord,
    ) -> Result<(), CheckpointError> {
        let path = self.path(kind)?;
        if let Some(previous) = self.last_committed(kind).await? {
            match record.supersedes(&previous) {
                Ok(true) => (),
                Ok(false) => {
                    debug!("checkpoint of stream '{kind}' at {} is unchanged", record.position);
                    return Ok(());
                }
                Err(message) => return Err(CheckpointError::ConflictingOffset { kind, message }),
            }
        }
        let content = serde_json::to_vec_pretty(record).map_err(|e| CheckpointError::Corrupted {
            kind,
            path: path.to_string(),
            error: e.to_string(),
        })?;
        self.store.put(path, content.into()).await?;
        debug!(
            "committed checkpoint of stream '{kind}': batch {} at {}",
            record.batch.id, record.position
        );
        Ok(())
    }

    async fn last_committed(
        &self,
        kind: StreamKind,
    ) -> Result<Option<CheckpointRecord>, CheckpointError> {
        let path = self.path(kind)?;
        let Some(data) = self.store.get(path).await? else {
            return Ok(None);
        };
        let record = serde_json::from_slice::<CheckpointRecord>(&data).map_err(|e| {
            CheckpointError::Corrupted {
                kind,
                path: path.to_string(),
                error: e.to_string(),
            }
        })?;
        if record.stream != kind {
            return Err(CheckpointError::Corrupted {
                kind,
                path: path.to_string(),
                error: format!("checkpoint belongs to stream '{}'", record.stream),
            });
        }
        Ok(Some(record))
    }
}
