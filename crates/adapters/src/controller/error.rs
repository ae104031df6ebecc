//! Top-level pipeline errors.
//!
//! Every error type in the pipeline implements [`DetailedError`], which
//! assigns it a stable error code.  Codes of nested errors are propagated
//! unchanged, so the code reported at the top level identifies the
//! component that failed (e.g. `CheckpointStorageUnavailable`,
//! `SourceFatal`).

use smartcity_storage::error::StorageError;
use smartcity_types::error::ConfigError;
use smartcity_types::StreamKind;
use std::{
    backtrace::Backtrace,
    borrow::Cow,
    error::Error as StdError,
    fmt::{Display, Error as FmtError, Formatter},
    io::Error as IOError,
    time::Duration,
};

use super::chain::ChainError;

/// An error with a stable, machine-readable error code.
pub trait DetailedError: StdError {
    fn error_code(&self) -> Cow<'static, str>;
}

impl DetailedError for ConfigError {
    fn error_code(&self) -> Cow<'static, str> {
        match self {
            Self::Parse { .. } => Cow::from("ConfigParseError"),
            Self::InvalidValue { .. } => Cow::from("InvalidConfigValue"),
            Self::DuplicateLocation { .. } => Cow::from("DuplicateLocation"),
            Self::NoStreams => Cow::from("NoStreams"),
            Self::UnresolvedEnvReference { .. } => Cow::from("UnresolvedEnvReference"),
        }
    }
}

impl DetailedError for StorageError {
    fn error_code(&self) -> Cow<'static, str> {
        match self {
            Self::InvalidPath(_) => Cow::from("InvalidStoragePath"),
            Self::InvalidURL(_) => Cow::from("InvalidStorageURL"),
            Self::ObjectStore { .. } => Cow::from("ObjectStoreError"),
            Self::Timeout(_) => Cow::from("StorageTimeout"),
        }
    }
}

/// Error that stops the pipeline.
#[derive(Debug)]
pub enum PipelineError {
    /// Invalid pipeline configuration.
    Config { config_error: ConfigError },

    /// The object store could not be opened.
    Storage { error: StorageError },

    /// A stream failed; the pipeline was stopped.
    Stream { kind: StreamKind, error: ChainError },

    /// Streams that did not stop within the shutdown timeout.
    ShutdownTimeout {
        timeout: Duration,
        pending: Vec<StreamKind>,
    },

    IoError {
        context: String,
        io_error: IOError,
        backtrace: Backtrace,
    },

    CliArgsError { error: String },

    /// The task supervising the streams panicked or was cancelled.
    SupervisorPanic { error: String },
}

impl PipelineError {
    pub fn io_error(context: String, io_error: IOError) -> Self {
        Self::IoError {
            context,
            io_error,
            backtrace: Backtrace::capture(),
        }
    }

    pub fn cli_args_error<E>(error: &E) -> Self
    where
        E: ToString,
    {
        Self::CliArgsError {
            error: error.to_string(),
        }
    }

    pub fn stream(kind: StreamKind, error: ChainError) -> Self {
        Self::Stream { kind, error }
    }

    /// The failed stream, if the error is specific to one stream.
    pub fn kind(&self) -> Option<StreamKind> {
        match self {
            Self::Stream { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

impl From<ConfigError> for PipelineError {
    fn from(config_error: ConfigError) -> Self {
        Self::Config { config_error }
    }
}

impl From<StorageError> for PipelineError {
    fn from(error: StorageError) -> Self {
        Self::Storage { error }
    }
}

impl DetailedError for PipelineError {
    fn error_code(&self) -> Cow<'static, str> {
        match self {
            Self::Config { config_error } => {
                Cow::from(format!("ConfigError.{}", config_error.error_code()))
            }
            Self::Storage { error } => error.error_code(),
            Self::Stream { error, .. } => error.error_code(),
            Self::ShutdownTimeout { .. } => Cow::from("ShutdownTimeout"),
            Self::IoError { .. } => Cow::from("PipelineIOError"),
            Self::CliArgsError { .. } => Cow::from("PipelineCliArgsError"),
            Self::SupervisorPanic { .. } => Cow::from("SupervisorPanic"),
        }
    }
}

impl StdError for PipelineError {}

impl Display for PipelineError {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        match self {
            Self::Config { config_error } => {
                write!(f, "invalid pipeline configuration: {config_error}")
            }
            Self::Storage { error } => {
                write!(f, "error opening object store: {error}")
            }
            Self::Stream { kind, error } => {
                write!(f, "stream '{kind}' failed ({}): {error}", error.error_code())
            }
            Self::ShutdownTimeout { timeout, pending } => {
                let pending = pending
                    .iter()
                    .map(|kind| kind.name())
                    .collect::<Vec<_>>()
                    .join(", ");
                write!(
                    f,
                    "streams [{pending}] did not stop within {}s of the shutdown request",
                    timeout.as_secs_f64()
                )
            }
            Self::IoError {
                context, io_error, ..
            } => {
                write!(f, "I/O error {context}: {io_error}")
            }
            Self::CliArgsError { error } => {
                write!(f, "Error parsing command line arguments: {error}")
            }
            Self::SupervisorPanic { error } => {
                write!(f, "pipeline supervisor failed: {error}")
            }
        }
    }
}
