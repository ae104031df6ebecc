//! Source positions, batch identifiers and checkpoint records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{Display, Error as FmtError, Formatter};
use xxhash_rust::xxh3::Xxh3;

use crate::StreamKind;

/// Per-partition read position of a stream: partition → last consumed
/// offset, inclusive.
///
/// Resuming from a position starts strictly after each recorded offset.
/// Partitions absent from the map start from the earliest retained offset.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourcePosition(BTreeMap<i32, i64>);

impl SourcePosition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, partition: i32) -> Option<i64> {
        self.0.get(&partition).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (i32, i64)> + '_ {
        self.0.iter().map(|(p, o)| (*p, *o))
    }

    /// Records `offset` as consumed on `partition`.  Never moves a
    /// partition backwards.
    pub fn advance(&mut self, partition: i32, offset: i64) {
        self.0
            .entry(partition)
            .and_modify(|current| *current = (*current).max(offset))
            .or_insert(offset);
    }

    /// True if the message at `partition`/`offset` was already consumed.
    pub fn covers(&self, partition: i32, offset: i64) -> bool {
        self.get(partition).is_some_and(|consumed| offset <= consumed)
    }

    /// True if every offset recorded in `other` was already consumed here.
    pub fn covers_all(&self, other: &SourcePosition) -> bool {
        other.iter().all(|(p, o)| self.covers(p, o))
    }

    /// Per-partition maximum of the two positions.
    pub fn merged(&self, other: &SourcePosition) -> SourcePosition {
        let mut result = self.clone();
        for (p, o) in other.iter() {
            result.advance(p, o);
        }
        result
    }

    /// Returns the first partition whose offset in `self` is lower than in
    /// `previous`, along with both offsets.
    pub fn first_regression(&self, previous: &SourcePosition) -> Option<(i32, i64, i64)> {
        previous.iter().find_map(|(p, prev)| match self.get(p) {
            Some(o) if o < prev => Some((p, o, prev)),
            None => Some((p, -1, prev)),
            _ => None,
        })
    }
}

impl Display for SourcePosition {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        f.write_str("{")?;
        for (i, (p, o)) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{p}:{o}")?;
        }
        f.write_str("}")
    }
}

impl<const N: usize> From<[(i32, i64); N]> for SourcePosition {
    fn from(entries: [(i32, i64); N]) -> Self {
        Self(BTreeMap::from(entries))
    }
}

/// Deterministic identifier of an output batch.
///
/// Derived from the stream kind and the offset range the batch was read
/// from, so that re-deriving a batch after a crash produces the same id and
/// therefore the same output object.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(String);

impl BatchId {
    pub fn for_range(kind: StreamKind, start: &SourcePosition, end: &SourcePosition) -> Self {
        let mut hasher = Xxh3::new();
        hasher.update(kind.name().as_bytes());
        for position in [start, end] {
            // Separator keeps `start` and `end` from being concatenated into
            // an ambiguous byte string.
            hasher.update(&[0xff]);
            for (p, o) in position.iter() {
                hasher.update(&p.to_le_bytes());
                hasher.update(&o.to_le_bytes());
            }
        }
        Self(format!("{:016x}", hasher.digest()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for BatchId {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        f.write_str(&self.0)
    }
}

/// The last output batch committed for a stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BatchRecord {
    pub id: BatchId,

    /// Monotonically increasing per stream, starting at 0.
    pub sequence: u64,

    /// Position before the first message of the batch.
    pub start: SourcePosition,

    /// Position after the last message of the batch.
    pub end: SourcePosition,

    /// Number of records written to the primary output.  Zero when every
    /// message in the range was late or malformed, in which case no file
    /// is written.
    pub records: u64,

    /// Watermark of the stream before the first message of the batch was
    /// observed.  Restored when the batch is re-derived on recovery.
    pub watermark_before: Option<DateTime<Utc>>,

    /// `(partition, offset)` of every message in the range that was
    /// classified late.  Re-deriving the batch excludes exactly these
    /// messages, whatever order the source replays the partitions in.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub late: Vec<(i32, i64)>,
}

/// Durable recovery state of one stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub stream: StreamKind,

    /// Last committed read position.
    pub position: SourcePosition,

    /// Watermark of the stream at `position`.
    pub max_event_time: Option<DateTime<Utc>>,

    pub batch: BatchRecord,

    pub committed_at: DateTime<Utc>,
}

impl CheckpointRecord {
    /// Checks whether this record may replace `previous`.
    ///
    /// Returns `Ok(true)` if it moves the stream forward, `Ok(false)` if it
    /// is an identical re-commit, and an error message describing the
    /// conflict otherwise.
    pub fn supersedes(&self, previous: &CheckpointRecord) -> Result<bool, String> {
        if let Some((partition, offset, prev)) = self.position.first_regression(&previous.position)
        {
            return Err(format!(
                "partition {partition} would move back from offset {prev} to {offset}"
            ));
        }
        if self.position == previous.position {
            if self.batch.id == previous.batch.id {
                Ok(false)
            } else {
                Err(format!(
                    "position {} already committed by batch {}, cannot commit batch {}",
                    self.position, previous.batch.id, self.batch.id
                ))
            }
        } else {
            Ok(true)
        }
    }
}
