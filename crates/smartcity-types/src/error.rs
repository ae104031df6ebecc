use thiserror::Error as ThisError;

/// Schema registry lookup error.
#[derive(Clone, Debug, PartialEq, Eq, ThisError)]
pub enum SchemaError {
    #[error("unknown event kind '{0}'")]
    UnknownKind(String),
}

/// Pipeline configuration error.
#[derive(Clone, Debug, PartialEq, Eq, ThisError)]
pub enum ConfigError {
    /// Failed to parse the configuration document.
    #[error("failed to parse pipeline configuration: {error}")]
    Parse { error: String },

    /// A configuration value is out of range or inconsistent.
    #[error("invalid value for '{field}': {error}")]
    InvalidValue { field: String, error: String },

    /// Two enabled streams share a topic, output or checkpoint location.
    #[error("streams '{first}' and '{second}' both use {what} '{value}'")]
    DuplicateLocation {
        what: &'static str,
        value: String,
        first: String,
        second: String,
    },

    /// No stream is enabled.
    #[error("configuration does not enable any stream")]
    NoStreams,

    /// An `${env:NAME}` reference names an unset variable.
    #[error("option '{option}' references environment variable '{variable}', which is not set")]
    UnresolvedEnvReference { option: String, variable: String },
}

impl ConfigError {
    pub fn invalid_value(field: &str, error: impl ToString) -> Self {
        Self::InvalidValue {
            field: field.to_string(),
            error: error.to_string(),
        }
    }
}
