//! Stream reader: pulls raw messages, decodes them and classifies the
//! results against the stream's watermark.

use smartcity_types::checkpoint::SourcePosition;
use smartcity_types::record::EventRecord;
use smartcity_types::StreamKind;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::stats::{PipelineStats, StreamMetrics};
use super::watermark::WatermarkTracker;
use crate::format::json::JsonDecoder;
use crate::transport::{MessageSource, RawMessage, SourceError};

/// Number of consecutive pulls that return nothing useful before replaying
/// a range gives up.
pub const REPLAY_IDLE_POLLS: usize = 3;

/// Result of one or more pulls.
#[derive(Debug, Default)]
pub struct PulledBatch {
    /// Decoded records at or after the cutoff, in arrival order.
    pub accepted: Vec<EventRecord>,

    /// Decoded records behind the cutoff.
    pub late: Vec<LateRecord>,

    /// Messages that failed to decode.
    pub malformed: u64,

    /// Messages consumed, excluding duplicates.
    pub consumed: u64,

    /// Read position after the batch.
    pub position: SourcePosition,
}

/// A record classified late, with the offset it was read from.
#[derive(Debug)]
pub struct LateRecord {
    pub partition: i32,
    pub offset: i64,
    pub record: EventRecord,
}

/// How [`StreamReader::process`] decides lateness.
enum Lateness<'a> {
    /// Against the current watermark cutoff.
    Watermark,

    /// Late iff the message's `(partition, offset)` is in the set.
    Recorded(&'a BTreeSet<(i32, i64)>),
}

impl PulledBatch {
    pub fn is_empty(&self) -> bool {
        self.consumed == 0
    }
}

pub struct StreamReader {
    kind: StreamKind,
    source: Box<dyn MessageSource>,
    decoder: JsonDecoder,
    watermarks: Arc<WatermarkTracker>,
    stats: Arc<PipelineStats>,
    poll_timeout: Duration,

    /// Last consumed offset of each partition.
    position: SourcePosition,
}

impl StreamReader {
    pub fn new(
        kind: StreamKind,
        source: Box<dyn MessageSource>,
        watermarks: Arc<WatermarkTracker>,
        stats: Arc<PipelineStats>,
        poll_timeout: Duration,
    ) -> Self {
        Self {
            kind,
            source,
            decoder: JsonDecoder::default(),
            watermarks,
            stats,
            poll_timeout,
            position: SourcePosition::new(),
        }
    }

    pub fn position(&self) -> &SourcePosition {
        &self.position
    }

    fn metrics(&self) -> &StreamMetrics {
        self.stats.stream(self.kind)
    }

    /// Restarts reading strictly after `position`.
    pub async fn seek(&mut self, position: &SourcePosition) -> Result<(), SourceError> {
        debug!("seeking stream '{}' to {position}", self.kind);
        self.source.seek(position).await?;
        self.position = position.clone();
        Ok(())
    }

    /// Pulls up to `max` messages.
    ///
    /// Non-fatal source errors are logged and reported as an empty batch.
    pub async fn pull(&mut self, max: usize) -> Result<PulledBatch, SourceError> {
        let mut batch = PulledBatch::default();
        match self.source.pull(max, self.poll_timeout).await {
            Ok(messages) => {
                for message in messages {
                    self.process(message, &Lateness::Watermark, &mut batch);
                }
            }
            Err(error) if error.fatal => return Err(error),
            Err(error) => warn!("error reading stream '{}': {error}", self.kind),
        }
        batch.position = self.position.clone();
        Ok(batch)
    }

    /// Re-reads the messages after the current position up to and including
    /// `end`, e.g. to re-derive a checkpointed batch whose output is
    /// missing.  Messages beyond `end` are left unconsumed.
    ///
    /// The messages at the offsets in `late` are classified late and all
    /// others are accepted, so the original classification is reproduced
    /// even if the source interleaves partitions differently than it did
    /// the first time.
    ///
    /// Gives up after [`REPLAY_IDLE_POLLS`] consecutive pulls make no
    /// progress, which happens when the source no longer retains part of
    /// the range.
    pub async fn replay(
        &mut self,
        end: &SourcePosition,
        late: &[(i32, i64)],
    ) -> Result<PulledBatch, SourceError> {
        let late = late.iter().copied().collect::<BTreeSet<_>>();
        let lateness = Lateness::Recorded(&late);
        let mut batch = PulledBatch::default();
        let mut idle = 0;
        while !self.position.covers_all(end) && idle < REPLAY_IDLE_POLLS {
            let messages = match self.source.pull(usize::MAX, self.poll_timeout).await {
                Ok(messages) => messages,
                Err(error) if error.fatal => return Err(error),
                Err(error) => {
                    warn!("error replaying stream '{}': {error}", self.kind);
                    Vec::new()
                }
            };
            let consumed = batch.consumed;
            for message in messages {
                if end.covers(message.partition, message.offset) {
                    self.process(message, &lateness, &mut batch);
                }
            }
            if batch.consumed == consumed {
                idle += 1;
            } else {
                idle = 0;
            }
        }
        if !self.position.covers_all(end) {
            warn!(
                "stream '{}': replay stopped at {} before reaching {end}",
                self.kind, self.position
            );
        }
        batch.position = self.position.clone();
        Ok(batch)
    }

    fn is_late(&self, message: &RawMessage, record: &EventRecord, lateness: &Lateness) -> bool {
        match lateness {
            Lateness::Watermark => self.watermarks.is_late(self.kind, record.timestamp()),
            Lateness::Recorded(late) => late.contains(&(message.partition, message.offset)),
        }
    }

    fn process(&mut self, message: RawMessage, lateness: &Lateness, batch: &mut PulledBatch) {
        StreamMetrics::incr(&self.metrics().messages_read);
        if self.position.covers(message.partition, message.offset) {
            // Redelivered after a seek.
            return;
        }
        self.position.advance(message.partition, message.offset);
        batch.consumed += 1;

        match self.decoder.decode(&message.payload, self.kind) {
            Err(error) => {
                debug!(
                    "stream '{}': skipping malformed message at partition {}, offset {}: {error}",
                    self.kind, message.partition, message.offset
                );
                StreamMetrics::incr(&self.metrics().decode_errors);
                batch.malformed += 1;
            }
            Ok(record) if self.is_late(&message, &record, lateness) => {
                debug!(
                    "stream '{}': late record '{}' at {} (cutoff {:?})",
                    self.kind,
                    record.id(),
                    record.timestamp(),
                    self.watermarks.cutoff(self.kind)
                );
                StreamMetrics::incr(&self.metrics().late_records);
                batch.late.push(LateRecord {
                    partition: message.partition,
                    offset: message.offset,
                    record,
                });
            }
            Ok(record) => {
                self.watermarks.observe(self.kind, record.timestamp());
                StreamMetrics::incr(&self.metrics().records_accepted);
                batch.accepted.push(record);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::StreamReader;
    use crate::controller::stats::PipelineStats;
    use crate::controller::watermark::WatermarkTracker;
    use crate::test::vehicle_payload;
    use crate::transport::{MemoryBroker, MemorySource};
    use chrono::{TimeDelta, TimeZone, Utc};
    use smartcity_types::checkpoint::SourcePosition;
    use smartcity_types::StreamKind;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn classify_and_dedup() {
        let broker = MemoryBroker::default();
        let topic = broker.topic("vehicle_data");
        let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();
        topic.send(0, vehicle_payload("a", t0));
        topic.send(0, vehicle_payload("b", t0 + TimeDelta::seconds(300)));
        topic.send(0, "{not json");
        topic.send(0, vehicle_payload("c", t0));

        let watermarks = Arc::new(WatermarkTracker::new(Duration::from_secs(120)));
        let stats = Arc::new(PipelineStats::new());
        let mut reader = StreamReader::new(
            StreamKind::Vehicle,
            Box::new(MemorySource::new(StreamKind::Vehicle, topic.clone())),
            watermarks.clone(),
            stats.clone(),
            Duration::from_millis(100),
        );
        reader.seek(&SourcePosition::new()).await.unwrap();

        let batch = reader.pull(10).await.unwrap();
        assert_eq!(
            batch.accepted.iter().map(|r| r.id()).collect::<Vec<_>>(),
            vec!["a", "b"]
        );
        assert_eq!(batch.late.len(), 1);
        assert_eq!((batch.late[0].partition, batch.late[0].offset), (0, 3));
        assert_eq!(batch.late[0].record.id(), "c");
        assert_eq!(batch.malformed, 1);
        assert_eq!(batch.consumed, 4);
        assert_eq!(batch.position, SourcePosition::from([(0, 3)]));
        assert_eq!(
            watermarks.max_event_time(StreamKind::Vehicle),
            Some(t0 + TimeDelta::seconds(300))
        );

        let metrics = stats.stream(StreamKind::Vehicle);
        assert_eq!(metrics.records_accepted.load(Ordering::Acquire), 2);
        assert_eq!(metrics.late_records.load(Ordering::Acquire), 1);
        assert_eq!(metrics.decode_errors.load(Ordering::Acquire), 1);

        // Nothing new.
        assert!(reader.pull(10).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn replay_stops_at_end() {
        let broker = MemoryBroker::new(2);
        let topic = broker.topic("vehicle_data");
        let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();
        for i in 0..4 {
            topic.send(0, vehicle_payload(&format!("p0-{i}"), t0));
            topic.send(1, vehicle_payload(&format!("p1-{i}"), t0));
        }
        let mut reader = StreamReader::new(
            StreamKind::Vehicle,
            Box::new(MemorySource::new(StreamKind::Vehicle, topic)),
            Arc::new(WatermarkTracker::new(Duration::from_secs(120))),
            Arc::new(PipelineStats::new()),
            Duration::from_millis(100),
        );
        reader
            .seek(&SourcePosition::from([(0, 0)]))
            .await
            .unwrap();
        let end = SourcePosition::from([(0, 2), (1, 1)]);
        let batch = reader.replay(&end, &[]).await.unwrap();
        assert_eq!(
            batch.accepted.iter().map(|r| r.id()).collect::<Vec<_>>(),
            vec!["p0-1", "p0-2", "p1-0", "p1-1"]
        );
        assert_eq!(batch.position, end);

        // A range the source no longer has: replay gives up.
        reader.seek(&end).await.unwrap();
        let batch = reader
            .replay(&SourcePosition::from([(0, 10)]), &[])
            .await
            .unwrap();
        assert_eq!(
            batch.accepted.iter().map(|r| r.id()).collect::<Vec<_>>(),
            vec!["p0-3"]
        );
        assert_eq!(batch.position, SourcePosition::from([(0, 3), (1, 1)]));
    }

    #[tokio::test(start_paused = true)]
    async fn replay_reproduces_recorded_lateness() {
        let broker = MemoryBroker::new(2);
        let topic = broker.topic("vehicle_data");
        let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();
        topic.send(0, vehicle_payload("new", t0 + TimeDelta::minutes(10)));
        topic.send(1, vehicle_payload("old", t0));
        topic.send(1, vehicle_payload("straggler", t0));

        let watermarks = Arc::new(WatermarkTracker::new(Duration::from_secs(120)));
        let mut reader = StreamReader::new(
            StreamKind::Vehicle,
            Box::new(MemorySource::new(StreamKind::Vehicle, topic)),
            watermarks.clone(),
            Arc::new(PipelineStats::new()),
            Duration::from_millis(100),
        );
        reader.seek(&SourcePosition::new()).await.unwrap();

        // Partition 0 is read first, so judged against the watermark both
        // records on partition 1 would be late.  Only the recorded offset
        // is.
        let end = SourcePosition::from([(0, 0), (1, 1)]);
        let batch = reader.replay(&end, &[(1, 1)]).await.unwrap();
        assert_eq!(
            batch.accepted.iter().map(|r| r.id()).collect::<Vec<_>>(),
            vec!["new", "old"]
        );
        assert_eq!(
            batch
                .late
                .iter()
                .map(|l| (l.partition, l.offset, l.record.id()))
                .collect::<Vec<_>>(),
            vec![(1, 1, "straggler")]
        );
        assert_eq!(batch.position, end);
    }
}
