use enum_map::Enum;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Error as FmtError, Formatter};
use std::str::FromStr;

use crate::error::SchemaError;

/// One of the event streams ingested by the pipeline.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Enum,
)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Vehicle,
    Gps,
    Traffic,
    Weather,
    Emergency,
}

impl StreamKind {
    pub const ALL: [StreamKind; 5] = [
        StreamKind::Vehicle,
        StreamKind::Gps,
        StreamKind::Traffic,
        StreamKind::Weather,
        StreamKind::Emergency,
    ];

    /// Canonical lower-case name, used in configuration, logs and paths.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Vehicle => "vehicle",
            Self::Gps => "gps",
            Self::Traffic => "traffic",
            Self::Weather => "weather",
            Self::Emergency => "emergency",
        }
    }

    /// Topic the stream is read from unless configured otherwise.
    pub fn default_topic(&self) -> String {
        format!("{}_data", self.name())
    }

    /// Object-store prefix for the stream's data files unless configured
    /// otherwise.
    pub fn default_output_path(&self) -> String {
        format!("data/{}_data", self.name())
    }

    /// Object-store prefix for the stream's checkpoint unless configured
    /// otherwise.
    pub fn default_checkpoint_path(&self) -> String {
        format!("checkpoints/{}_data", self.name())
    }
}

impl Display for StreamKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        f.write_str(self.name())
    }
}

impl FromStr for StreamKind {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| SchemaError::UnknownKind(s.to_string()))
    }
}
