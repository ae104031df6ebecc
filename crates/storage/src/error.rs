use object_store::Error as ObjectStoreError;
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use std::io::ErrorKind;
use std::time::Duration;
use thiserror::Error;

/// An error that can occur when accessing the object store.
#[derive(Clone, Error, Debug, Serialize)]
pub enum StorageError {
    /// Path is not valid in the object store.
    ///
    /// Paths may not contain empty, `.` or `..` components.
    #[error("Path is not valid in storage: {0:?}")]
    InvalidPath(String),

    /// Unable to parse URL.
    #[error("Unable to parse URL {0:?}")]
    InvalidURL(String),

    /// Error accessing object store.
    #[error("Error accessing object store: {message}")]
    #[serde(serialize_with = "serialize_object_store_error")]
    ObjectStore { kind: ErrorKind, message: String },

    /// The object store did not answer within the configured timeout.
    #[error("Object store operation timed out after {0:?}")]
    Timeout(Duration),
}

impl From<ObjectStoreError> for StorageError {
    fn from(value: ObjectStoreError) -> Self {
        let kind = match value {
            ObjectStoreError::NotFound { .. } => ErrorKind::NotFound,
            ObjectStoreError::NotSupported { .. } => ErrorKind::Unsupported,
            ObjectStoreError::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            ObjectStoreError::NotImplemented => ErrorKind::Unsupported,
            ObjectStoreError::PermissionDenied { .. }
            | ObjectStoreError::Unauthenticated { .. } => ErrorKind::PermissionDenied,
            ObjectStoreError::InvalidPath { .. } => ErrorKind::InvalidInput,
            ObjectStoreError::UnknownConfigurationKey { .. } => ErrorKind::InvalidInput,
            ObjectStoreError::Generic { .. }
            | ObjectStoreError::JoinError { .. }
            | ObjectStoreError::Precondition { .. }
            | ObjectStoreError::NotModified { .. }
            | _ => ErrorKind::Other,
        };
        Self::ObjectStore {
            kind,
            message: value.to_string(),
        }
    }
}

fn serialize_object_store_error<S>(
    kind: &ErrorKind,
    message: &String,
    serializer: S,
) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let mut ser = serializer.serialize_struct("ObjectStoreError", 2)?;
    ser.serialize_field("kind", &kind.to_string())?;
    ser.serialize_field("message", message)?;
    ser.end()
}

impl StorageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StorageError::InvalidPath(_) => ErrorKind::InvalidInput,
            StorageError::InvalidURL(_) => ErrorKind::InvalidInput,
            StorageError::ObjectStore { kind, .. } => *kind,
            StorageError::Timeout(_) => ErrorKind::TimedOut,
        }
    }

    /// True for failures that may go away if the operation is retried:
    /// timeouts, network and service errors.  Configuration problems such as
    /// bad paths or missing permissions are not transient.
    pub fn is_transient(&self) -> bool {
        !matches!(
            self.kind(),
            ErrorKind::InvalidInput
                | ErrorKind::PermissionDenied
                | ErrorKind::Unsupported
                | ErrorKind::NotFound
        )
    }
}
