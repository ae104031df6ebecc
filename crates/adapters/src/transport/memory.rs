//! In-process partitioned topics.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use smartcity_types::checkpoint::SourcePosition;
use smartcity_types::config::ResolvedStream;
use smartcity_types::StreamKind;
use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};

use super::{MessageSource, RawMessage, SourceError, SourceProvider};

/// A set of named in-memory topics.
///
/// Topics are created on first use with the broker's default number of
/// partitions.  Messages are retained for the lifetime of the broker, so a
/// source can seek back to any offset.
#[derive(Debug)]
pub struct MemoryBroker {
    partitions: usize,
    topics: Mutex<HashMap<String, Arc<MemoryTopic>>>,
}

impl MemoryBroker {
    pub fn new(partitions: usize) -> Self {
        Self {
            partitions: partitions.max(1),
            topics: Mutex::new(HashMap::new()),
        }
    }

    /// Returns topic `name`, creating it if necessary.
    pub fn topic(&self, name: &str) -> Arc<MemoryTopic> {
        self.topics
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryTopic::new(self.partitions)))
            .clone()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(1)
    }
}

impl SourceProvider for MemoryBroker {
    fn open(&self, stream: &ResolvedStream) -> Result<Box<dyn MessageSource>, SourceError> {
        Ok(Box::new(MemorySource::new(
            stream.kind,
            self.topic(&stream.topic),
        )))
    }
}

/// A partitioned, append-only log.
#[derive(Debug)]
pub struct MemoryTopic {
    partitions: Mutex<Vec<Vec<Bytes>>>,
    notify: Notify,
}

impl MemoryTopic {
    fn new(partitions: usize) -> Self {
        Self {
            partitions: Mutex::new(vec![Vec::new(); partitions]),
            notify: Notify::new(),
        }
    }

    pub fn partitions(&self) -> usize {
        self.partitions.lock().unwrap().len()
    }

    /// Appends `payload` to `partition` and returns its offset.
    ///
    /// # Panics
    ///
    /// If `partition` does not exist.
    pub fn send(&self, partition: i32, payload: impl Into<Bytes>) -> i64 {
        let offset = {
            let mut partitions = self.partitions.lock().unwrap();
            let log = &mut partitions[partition as usize];
            log.push(payload.into());
            log.len() as i64 - 1
        };
        self.notify.notify_waiters();
        offset
    }

    /// Number of messages appended to `partition`.
    pub fn len(&self, partition: i32) -> usize {
        self.partitions
            .lock()
            .unwrap()
            .get(partition as usize)
            .map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.lock().unwrap().iter().all(Vec::is_empty)
    }

    /// Copies up to `max` messages starting at `next`, advancing `next`
    /// past the messages returned.
    fn read(&self, kind: StreamKind, next: &mut [i64], max: usize) -> Vec<RawMessage> {
        let partitions = self.partitions.lock().unwrap();
        let mut messages = Vec::new();
        for (partition, log) in partitions.iter().enumerate() {
            let start = next[partition] as usize;
            let n = log.len().saturating_sub(start).min(max - messages.len());
            messages.extend(log[start..start + n].iter().enumerate().map(|(i, payload)| {
                RawMessage {
                    kind,
                    partition: partition as i32,
                    offset: (start + i) as i64,
                    payload: payload.clone(),
                }
            }));
            next[partition] += n as i64;
            if messages.len() >= max {
                break;
            }
        }
        messages
    }
}

/// [`MessageSource`] reading a [`MemoryTopic`].
pub struct MemorySource {
    kind: StreamKind,
    topic: Arc<MemoryTopic>,

    /// Next offset to read, per partition.
    next: Vec<i64>,
}

impl MemorySource {
    pub fn new(kind: StreamKind, topic: Arc<MemoryTopic>) -> Self {
        let next = vec![0; topic.partitions()];
        Self { kind, topic, next }
    }
}

#[async_trait]
impl MessageSource for MemorySource {
    async fn seek(&mut self, position: &SourcePosition) -> Result<(), SourceError> {
        for (partition, next) in self.next.iter_mut().enumerate() {
            *next = position
                .get(partition as i32)
                .map_or(0, |offset| offset + 1);
        }
        Ok(())
    }

    async fn pull(
        &mut self,
        max: usize,
        timeout: Duration,
    ) -> Result<Vec<RawMessage>, SourceError> {
        if max == 0 {
            return Ok(Vec::new());
        }
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.topic.notify.notified();
            tokio::pin!(notified);
            // Register for wakeups before looking at the log so that a
            // concurrent `send` cannot be missed.
            notified.as_mut().enable();

            let messages = self.topic.read(self.kind, &mut self.next, max);
            if !messages.is_empty() {
                return Ok(messages);
            }
            if timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }
}
