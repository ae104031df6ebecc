//! Event-time watermarks.
//!
//! The watermark of a stream is the maximum event timestamp observed on
//! that stream.  A record whose timestamp is earlier than the watermark
//! minus the allowed lateness (the *cutoff*) is late.
//!
//! State is kept in one atomic per stream kind.  Each atomic is written only
//! by the reader of its stream and read by that stream's sink writer and by
//! status queries, so no locking is needed.

use chrono::{DateTime, TimeDelta, Utc};
use enum_map::EnumMap;
use smartcity_types::StreamKind;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

/// Marks a stream that has not observed any event yet.
const NO_EVENT: i64 = i64::MIN;

#[derive(Debug)]
pub struct WatermarkTracker {
    allowed_lateness: TimeDelta,

    /// Microseconds since the Unix epoch, or [`NO_EVENT`].
    max_event_time: EnumMap<StreamKind, AtomicI64>,
}

impl WatermarkTracker {
    pub fn new(allowed_lateness: Duration) -> Self {
        Self {
            allowed_lateness: TimeDelta::from_std(allowed_lateness).unwrap_or(TimeDelta::MAX),
            max_event_time: EnumMap::from_fn(|_| AtomicI64::new(NO_EVENT)),
        }
    }

    pub fn allowed_lateness(&self) -> TimeDelta {
        self.allowed_lateness
    }

    /// Advances the watermark of `kind` to `event_time` if it is later than
    /// the current one.  Never moves the watermark backwards.
    pub fn observe(&self, kind: StreamKind, event_time: DateTime<Utc>) {
        self.max_event_time[kind].fetch_max(event_time.timestamp_micros(), Ordering::AcqRel);
    }

    /// Maximum event time observed on `kind`, or `None` before the first
    /// observation.
    pub fn max_event_time(&self, kind: StreamKind) -> Option<DateTime<Utc>> {
        match self.max_event_time[kind].load(Ordering::Acquire) {
            NO_EVENT => None,
            micros => DateTime::from_timestamp_micros(micros),
        }
    }

    /// Timestamps strictly earlier than the cutoff are late.
    pub fn cutoff(&self, kind: StreamKind) -> Option<DateTime<Utc>> {
        self.max_event_time(kind)?
            .checked_sub_signed(self.allowed_lateness)
    }

    /// True if a record of `kind` with timestamp `t` arriving now is late.
    /// A record exactly at the cutoff is not late.
    pub fn is_late(&self, kind: StreamKind, t: DateTime<Utc>) -> bool {
        self.cutoff(kind).is_some_and(|cutoff| t < cutoff)
    }

    /// Resets the watermark of `kind` from a checkpoint.  Unlike
    /// [`observe`](Self::observe), this may move the watermark backwards.
    pub fn restore(&self, kind: StreamKind, max_event_time: Option<DateTime<Utc>>) {
        self.max_event_time[kind].store(
            max_event_time.map_or(NO_EVENT, |t| t.timestamp_micros()),
            Ordering::Release,
        );
    }
}
