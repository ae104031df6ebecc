use crate::controller::{
    BlobCheckpointStore, CheckpointStore, Coordinator, DetailedError, PipelineError,
    PipelineHandle,
};
use crate::test::{
    async_wait, init_test_logger, memory_store, output_files, output_ids, parquet_ids,
    test_config, traffic_payload, vehicle_payload, FlakyBlobStore, PutFailure,
    DEFAULT_TIMEOUT_MS,
};
use crate::transport::{MemoryBroker, MessageSource, RawMessage, SourceError, SourceProvider};
use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use pretty_assertions::assert_eq;
use smartcity_storage::{storage_path, BlobStore};
use smartcity_types::checkpoint::{CheckpointRecord, SourcePosition};
use smartcity_types::config::{LateDataPolicy, PipelineConfig, ResolvedStream};
use smartcity_types::StreamKind;
use std::future::pending;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap()
}

fn start(
    config: PipelineConfig,
    store: Arc<dyn BlobStore>,
    sources: Arc<dyn SourceProvider>,
) -> PipelineHandle {
    init_test_logger();
    Coordinator::new(config, store, sources).unwrap().start()
}

async fn last_checkpoint(
    store: Arc<dyn BlobStore>,
    config: &PipelineConfig,
    kind: StreamKind,
) -> Option<CheckpointRecord> {
    BlobCheckpointStore::new(store, &config.resolved_streams())
        .unwrap()
        .last_committed(kind)
        .await
        .unwrap()
}

/// Waits until `counter` of stream `kind` reaches `value`.
macro_rules! wait_for_counter {
    ($handle:expr, $kind:expr, $counter:ident, $value:expr) => {{
        let stats = $handle.stats().clone();
        async_wait(
            || stats.stream($kind).$counter.load(Ordering::Acquire) >= $value,
            DEFAULT_TIMEOUT_MS,
        )
        .await
        .unwrap_or_else(|()| panic!("timeout waiting for {}", stringify!($counter)));
    }};
}

#[tokio::test(start_paused = true)]
async fn out_of_order_and_late_records() {
    let broker = Arc::new(MemoryBroker::default());
    let store = memory_store();
    let config = test_config(&[StreamKind::Vehicle]);
    let topic = broker.topic("vehicle_data");
    let t = t0();

    topic.send(0, vehicle_payload("t", t));
    topic.send(0, vehicle_payload("t+30s", t + TimeDelta::seconds(30)));
    topic.send(0, vehicle_payload("t+10s", t + TimeDelta::seconds(10)));

    let handle = start(config.clone(), store.clone(), broker.clone());
    wait_for_counter!(handle, StreamKind::Vehicle, records_accepted, 3);
    assert_eq!(
        handle.watermarks().max_event_time(StreamKind::Vehicle),
        Some(t + TimeDelta::seconds(30))
    );

    // Five minutes behind the watermark, with two minutes of allowed
    // lateness.
    topic.send(
        0,
        vehicle_payload("late", t + TimeDelta::seconds(30) - TimeDelta::minutes(5)),
    );
    wait_for_counter!(handle, StreamKind::Vehicle, late_records, 1);
    assert_eq!(
        handle.watermarks().max_event_time(StreamKind::Vehicle),
        Some(t + TimeDelta::seconds(30))
    );

    let stats = handle.stats().clone();
    handle.shutdown();
    handle.join().await.unwrap();

    assert_eq!(
        output_ids(store.as_ref(), "data/vehicle_data").await,
        vec!["t", "t+30s", "t+10s"]
    );
    let metrics = stats.stream(StreamKind::Vehicle).snapshot();
    assert_eq!(metrics.records_written, 3);
    assert_eq!(metrics.late_records, 1);
    assert!(stats.stream(StreamKind::Vehicle).stopped.load(Ordering::Acquire));

    let checkpoint = last_checkpoint(store, &config, StreamKind::Vehicle)
        .await
        .unwrap();
    assert_eq!(checkpoint.position, SourcePosition::from([(0, 3)]));
    assert_eq!(
        checkpoint.max_event_time,
        Some(t + TimeDelta::seconds(30))
    );
}

#[tokio::test(start_paused = true)]
async fn malformed_payload_is_skipped() {
    let broker = Arc::new(MemoryBroker::default());
    let store = memory_store();
    let topic = broker.topic("traffic_data");
    let t = t0();

    let handle = start(
        test_config(&[StreamKind::Traffic]),
        store.clone(),
        broker.clone(),
    );
    topic.send(0, traffic_payload("a", t));
    wait_for_counter!(handle, StreamKind::Traffic, records_accepted, 1);

    topic.send(0, r#"{"id": "broken", "timestamp": "#);
    wait_for_counter!(handle, StreamKind::Traffic, decode_errors, 1);
    assert_eq!(
        handle.watermarks().max_event_time(StreamKind::Traffic),
        Some(t)
    );

    topic.send(0, traffic_payload("b", t + TimeDelta::seconds(5)));
    wait_for_counter!(handle, StreamKind::Traffic, records_accepted, 2);
    assert!(!handle.status().streams[0].stopped);

    handle.shutdown();
    handle.join().await.unwrap();
    assert_eq!(
        output_ids(store.as_ref(), "data/traffic_data").await,
        vec!["a", "b"]
    );
}

#[tokio::test(start_paused = true)]
async fn storage_outage_is_retried() {
    let broker = Arc::new(MemoryBroker::default());
    let memory = memory_store();
    let store = Arc::new(FlakyBlobStore::new(memory.clone()));
    let mut config = test_config(&[StreamKind::Vehicle]);
    config.batch.max_records = 3;
    let topic = broker.topic("vehicle_data");
    for i in 0..3 {
        topic.send(0, vehicle_payload(&format!("v{i}"), t0()));
    }

    store.fail_puts("data/vehicle_data", PutFailure::Transient, 3);
    let handle = start(config.clone(), store.clone(), broker.clone());
    wait_for_counter!(handle, StreamKind::Vehicle, batches_flushed, 1);
    let metrics = handle.stats().stream(StreamKind::Vehicle).snapshot();
    assert_eq!(metrics.storage_retries, 3);
    assert_eq!(metrics.records_written, 3);

    handle.shutdown();
    handle.join().await.unwrap();
    // One checkpoint, three failed attempts and one successful write.
    assert_eq!(store.puts(), 5);

    let checkpoint = last_checkpoint(memory.clone(), &config, StreamKind::Vehicle)
        .await
        .unwrap();
    assert_eq!(checkpoint.position, SourcePosition::from([(0, 2)]));
    assert_eq!(checkpoint.batch.sequence, 0);
    assert_eq!(checkpoint.batch.records, 3);

    let files = output_files(memory.as_ref(), "data/vehicle_data").await;
    assert_eq!(
        files,
        vec![storage_path(&format!(
            "data/vehicle_data/part-00000000-{}.parquet",
            checkpoint.batch.id
        ))
        .unwrap()]
    );
    assert_eq!(
        parquet_ids(memory.as_ref(), &files[0]).await,
        vec!["v0", "v1", "v2"]
    );
}

#[tokio::test(start_paused = true)]
async fn partial_write_is_rewritten() {
    let broker = Arc::new(MemoryBroker::default());
    let memory = memory_store();
    let store = Arc::new(FlakyBlobStore::new(memory.clone()));
    let mut config = test_config(&[StreamKind::Vehicle]);
    config.batch.max_records = 2;
    let topic = broker.topic("vehicle_data");
    topic.send(0, vehicle_payload("a", t0()));
    topic.send(0, vehicle_payload("b", t0()));

    store.fail_puts("data/vehicle_data", PutFailure::Truncate, 1);
    let handle = start(config, store.clone(), broker.clone());
    wait_for_counter!(handle, StreamKind::Vehicle, batches_flushed, 1);
    assert_eq!(
        handle
            .stats()
            .stream(StreamKind::Vehicle)
            .storage_retries
            .load(Ordering::Acquire),
        1
    );

    handle.shutdown();
    handle.join().await.unwrap();
    assert_eq!(
        output_ids(memory.as_ref(), "data/vehicle_data").await,
        vec!["a", "b"]
    );
}

#[tokio::test(start_paused = true)]
async fn crash_between_checkpoint_and_output() {
    let broker = Arc::new(MemoryBroker::default());
    let memory = memory_store();
    let store = Arc::new(FlakyBlobStore::new(memory.clone()));
    let mut config = test_config(&[StreamKind::Vehicle]);
    config.batch.max_records = 3;
    let topic = broker.topic("vehicle_data");
    let t = t0();
    for (i, id) in ["a", "b", "c"].into_iter().enumerate() {
        topic.send(0, vehicle_payload(id, t + TimeDelta::seconds(i as i64)));
    }

    // The checkpoint is committed, then the data file cannot be written.
    store.fail_puts("data/vehicle_data", PutFailure::Permanent, 1);
    let error = start(config.clone(), store.clone(), broker.clone())
        .join()
        .await
        .unwrap_err();
    assert_eq!(error.kind(), Some(StreamKind::Vehicle));
    assert_eq!(error.error_code(), "StorageUnavailable");
    assert!(error
        .to_string()
        .starts_with("stream 'vehicle' failed (StorageUnavailable): "));

    let committed = last_checkpoint(memory.clone(), &config, StreamKind::Vehicle)
        .await
        .unwrap();
    assert_eq!(committed.batch.records, 3);
    assert!(output_files(memory.as_ref(), "data/vehicle_data")
        .await
        .is_empty());

    // Restart: the batch is re-derived from its offset range and written
    // under its original name.
    let handle = start(config.clone(), memory.clone(), broker.clone());
    wait_for_counter!(handle, StreamKind::Vehicle, records_written, 3);
    assert_eq!(
        output_files(memory.as_ref(), "data/vehicle_data").await,
        vec![storage_path(&format!(
            "data/vehicle_data/part-00000000-{}.parquet",
            committed.batch.id
        ))
        .unwrap()]
    );
    assert_eq!(
        last_checkpoint(memory.clone(), &config, StreamKind::Vehicle).await,
        Some(committed.clone())
    );
    assert_eq!(
        handle.watermarks().max_event_time(StreamKind::Vehicle),
        committed.max_event_time
    );

    topic.send(0, vehicle_payload("d", t + TimeDelta::seconds(3)));
    wait_for_counter!(handle, StreamKind::Vehicle, records_accepted, 4);
    handle.shutdown();
    handle.join().await.unwrap();

    assert_eq!(
        output_ids(memory.as_ref(), "data/vehicle_data").await,
        vec!["a", "b", "c", "d"]
    );
    let last = last_checkpoint(memory, &config, StreamKind::Vehicle)
        .await
        .unwrap();
    assert_eq!(last.batch.sequence, 1);
    assert_eq!(last.batch.start, committed.position);
    assert_eq!(last.position, SourcePosition::from([(0, 3)]));
}

#[tokio::test(start_paused = true)]
async fn recovery_across_partitions_keeps_accepted_records() {
    let broker = Arc::new(MemoryBroker::new(2));
    let memory = memory_store();
    let store = Arc::new(FlakyBlobStore::new(memory.clone()));
    let mut config = test_config(&[StreamKind::Vehicle]);
    config.batch.max_records = 10;
    let topic = broker.topic("vehicle_data");
    let t = t0();

    store.fail_puts("data/vehicle_data", PutFailure::Permanent, 1);
    let handle = start(config.clone(), store.clone(), broker.clone());
    topic.send(1, vehicle_payload("x", t));
    wait_for_counter!(handle, StreamKind::Vehicle, records_accepted, 1);

    // Both arrive in one pull: `y` moves the watermark ten minutes ahead,
    // so `z` is late.  The cutoff is now past the batch's opening event
    // time, which flushes it.
    topic.send(0, vehicle_payload("y", t + TimeDelta::minutes(10)));
    topic.send(1, vehicle_payload("z", t));
    let error = handle.join().await.unwrap_err();
    assert_eq!(error.error_code(), "StorageUnavailable");

    let committed = last_checkpoint(memory.clone(), &config, StreamKind::Vehicle)
        .await
        .unwrap();
    assert_eq!(committed.batch.records, 2);
    assert_eq!(committed.batch.late, vec![(1, 1)]);
    assert_eq!(committed.position, SourcePosition::from([(0, 0), (1, 1)]));

    // Replay reads partition 0 first, so `x` now arrives after `y`.  It was
    // accepted the first time and must be written again.
    let handle = start(config.clone(), memory.clone(), broker.clone());
    wait_for_counter!(handle, StreamKind::Vehicle, records_written, 2);
    handle.shutdown();
    handle.join().await.unwrap();

    let files = output_files(memory.as_ref(), "data/vehicle_data").await;
    assert_eq!(
        files,
        vec![storage_path(&format!(
            "data/vehicle_data/part-00000000-{}.parquet",
            committed.batch.id
        ))
        .unwrap()]
    );
    let mut ids = parquet_ids(memory.as_ref(), &files[0]).await;
    ids.sort();
    assert_eq!(ids, vec!["x", "y"]);
    assert_eq!(
        last_checkpoint(memory, &config, StreamKind::Vehicle).await,
        Some(committed)
    );
}

#[tokio::test(start_paused = true)]
async fn shutdown_drains_buffered_records() {
    let broker = Arc::new(MemoryBroker::default());
    let store = memory_store();
    let mut config = test_config(&[StreamKind::Vehicle]);
    config.batch.max_age_ms = 3_600_000;
    let topic = broker.topic("vehicle_data");
    let t = t0();

    let handle = start(config.clone(), store.clone(), broker.clone());
    topic.send(0, vehicle_payload("a", t));
    topic.send(0, vehicle_payload("b", t + TimeDelta::seconds(1)));
    wait_for_counter!(handle, StreamKind::Vehicle, records_accepted, 2);
    assert!(output_files(store.as_ref(), "data/vehicle_data")
        .await
        .is_empty());

    let status = handle.status();
    assert_eq!(status.name, "test");
    assert!(!status.cancelled);
    assert_eq!(status.streams.len(), 1);
    assert_eq!(status.streams[0].stream, StreamKind::Vehicle);
    assert_eq!(status.streams[0].topic, "vehicle_data");
    assert_eq!(
        status.streams[0].max_event_time,
        Some(t + TimeDelta::seconds(1))
    );
    assert_eq!(status.streams[0].metrics.records_accepted, 2);
    let json = serde_json::to_value(&status).unwrap();
    assert_eq!(json["streams"][0]["stream"], "vehicle");
    assert_eq!(json["streams"][0]["metrics"]["messages_read"], 2);

    handle.shutdown();
    handle.join().await.unwrap();
    assert_eq!(
        output_ids(store.as_ref(), "data/vehicle_data").await,
        vec!["a", "b"]
    );

    // Restart after the drained batch.
    let handle = start(config.clone(), store.clone(), broker.clone());
    topic.send(0, vehicle_payload("c", t + TimeDelta::seconds(2)));
    wait_for_counter!(handle, StreamKind::Vehicle, records_accepted, 1);
    assert_eq!(
        handle.watermarks().max_event_time(StreamKind::Vehicle),
        Some(t + TimeDelta::seconds(2))
    );
    handle.shutdown();
    handle.join().await.unwrap();

    assert_eq!(
        output_ids(store.as_ref(), "data/vehicle_data").await,
        vec!["a", "b", "c"]
    );
    let checkpoint = last_checkpoint(store, &config, StreamKind::Vehicle)
        .await
        .unwrap();
    assert_eq!(checkpoint.batch.sequence, 1);
    assert_eq!(checkpoint.position, SourcePosition::from([(0, 2)]));
}

#[tokio::test(start_paused = true)]
async fn late_records_side_output() {
    let broker = Arc::new(MemoryBroker::default());
    let store = memory_store();
    let mut config = test_config(&[StreamKind::Vehicle]);
    config.late_data = LateDataPolicy::SideOutput;
    let topic = broker.topic("vehicle_data");
    let t = t0();
    topic.send(0, vehicle_payload("on-time", t + TimeDelta::minutes(10)));
    topic.send(0, vehicle_payload("late", t));

    let handle = start(config, store.clone(), broker.clone());
    wait_for_counter!(handle, StreamKind::Vehicle, late_records, 1);
    handle.shutdown();
    handle.join().await.unwrap();

    assert_eq!(
        output_ids(store.as_ref(), "data/vehicle_data").await,
        vec!["on-time"]
    );
    let late = store
        .list(&storage_path("data/vehicle_data/_late").unwrap())
        .await
        .unwrap();
    assert_eq!(late.len(), 1);
    assert_eq!(parquet_ids(store.as_ref(), &late[0]).await, vec!["late"]);
}

#[tokio::test(start_paused = true)]
async fn malformed_batch_commits_checkpoint_only() {
    let broker = Arc::new(MemoryBroker::default());
    let store = memory_store();
    let mut config = test_config(&[StreamKind::Traffic]);
    config.batch.max_age_ms = 1_000;
    let topic = broker.topic("traffic_data");
    topic.send(0, "not json");
    topic.send(0, r#"{"id": "no-timestamp"}"#);

    let handle = start(config.clone(), store.clone(), broker.clone());
    wait_for_counter!(handle, StreamKind::Traffic, batches_flushed, 1);
    handle.shutdown();
    handle.join().await.unwrap();

    let checkpoint = last_checkpoint(store.clone(), &config, StreamKind::Traffic)
        .await
        .unwrap();
    assert_eq!(checkpoint.position, SourcePosition::from([(0, 1)]));
    assert_eq!(checkpoint.batch.records, 0);
    assert_eq!(checkpoint.max_event_time, None);
    assert!(output_files(store.as_ref(), "data/traffic_data")
        .await
        .is_empty());
}

/// Opens memory sources, except for `failing`, whose topic does not exist.
struct MissingTopic {
    broker: MemoryBroker,
    failing: StreamKind,
}

impl SourceProvider for MissingTopic {
    fn open(&self, stream: &ResolvedStream) -> Result<Box<dyn MessageSource>, SourceError> {
        if stream.kind == self.failing {
            Err(SourceError::fatal(anyhow!(
                "topic '{}' does not exist",
                stream.topic
            )))
        } else {
            self.broker.open(stream)
        }
    }
}

#[tokio::test(start_paused = true)]
async fn fatal_error_stops_pipeline() {
    let sources = Arc::new(MissingTopic {
        broker: MemoryBroker::default(),
        failing: StreamKind::Gps,
    });
    let handle = start(
        test_config(&[StreamKind::Vehicle, StreamKind::Gps]),
        memory_store(),
        sources,
    );
    let token = handle.cancellation_token();
    let error = handle.join().await.unwrap_err();
    assert_eq!(error.kind(), Some(StreamKind::Gps));
    assert_eq!(error.error_code(), "SourceFatal");
    assert_eq!(
        error.to_string(),
        "stream 'gps' failed (SourceFatal): source error: topic 'gps_data' does not exist"
    );
    assert!(token.is_cancelled());
}

/// A source whose pulls never return.
struct StuckSource;

#[async_trait]
impl MessageSource for StuckSource {
    async fn seek(&mut self, _position: &SourcePosition) -> Result<(), SourceError> {
        Ok(())
    }

    async fn pull(
        &mut self,
        _max: usize,
        _timeout: Duration,
    ) -> Result<Vec<RawMessage>, SourceError> {
        pending().await
    }
}

struct StuckProvider;

impl SourceProvider for StuckProvider {
    fn open(&self, _stream: &ResolvedStream) -> Result<Box<dyn MessageSource>, SourceError> {
        Ok(Box::new(StuckSource))
    }
}

#[tokio::test(start_paused = true)]
async fn shutdown_timeout() {
    let mut config = test_config(&[StreamKind::Weather]);
    config.shutdown_timeout_ms = 1_000;
    let handle = start(config, memory_store(), Arc::new(StuckProvider));
    tokio::time::sleep(Duration::from_secs(1)).await;
    handle.shutdown();
    match handle.join().await {
        Err(PipelineError::ShutdownTimeout { timeout, pending }) => {
            assert_eq!(timeout, Duration::from_secs(1));
            assert_eq!(pending, vec![StreamKind::Weather]);
        }
        result => panic!("unexpected result: {result:?}"),
    }
}

/// Opens memory sources, except for `stuck`, whose pulls never return.
struct StuckStream {
    broker: MemoryBroker,
    stuck: StreamKind,
}

impl SourceProvider for StuckStream {
    fn open(&self, stream: &ResolvedStream) -> Result<Box<dyn MessageSource>, SourceError> {
        if stream.kind == self.stuck {
            Ok(Box::new(StuckSource))
        } else {
            self.broker.open(stream)
        }
    }
}

#[tokio::test(start_paused = true)]
async fn stalled_stream_does_not_block_others() {
    let broker = MemoryBroker::default();
    let topic = broker.topic("vehicle_data");
    let store = memory_store();
    let mut config = test_config(&[StreamKind::Vehicle, StreamKind::Weather]);
    config.batch.max_records = 2;
    config.shutdown_timeout_ms = 1_000;
    let handle = start(
        config,
        store.clone(),
        Arc::new(StuckStream {
            broker,
            stuck: StreamKind::Weather,
        }),
    );

    let t = t0();
    for i in 0..4 {
        topic.send(0, vehicle_payload(&format!("v{i}"), t + TimeDelta::seconds(i)));
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    wait_for_counter!(handle, StreamKind::Vehicle, batches_flushed, 2);

    let status = handle.status();
    let weather = status
        .streams
        .iter()
        .find(|s| s.stream == StreamKind::Weather)
        .unwrap();
    assert!(!weather.stopped);
    assert_eq!(weather.metrics.messages_read, 0);
    assert_eq!(weather.max_event_time, None);

    handle.shutdown();
    match handle.join().await {
        Err(PipelineError::ShutdownTimeout { pending, .. }) => {
            assert_eq!(pending, vec![StreamKind::Weather]);
        }
        result => panic!("unexpected result: {result:?}"),
    }
    assert_eq!(
        output_ids(store.as_ref(), "data/vehicle_data").await,
        vec!["v0", "v1", "v2", "v3"]
    );
}

#[tokio::test(start_paused = true)]
async fn run_until_cancelled() {
    init_test_logger();
    let broker = Arc::new(MemoryBroker::default());
    let store = memory_store();
    let topic = broker.topic("emergency_data");
    topic.send(
        0,
        serde_json::json!({
            "id": "e1",
            "timestamp": "2024-03-01T08:00:00",
            "incidentId": "i1",
            "type": "Fire",
            "status": "Active"
        })
        .to_string(),
    );

    let coordinator = Coordinator::new(
        test_config(&[StreamKind::Emergency]),
        store.clone(),
        broker.clone(),
    )
    .unwrap();
    assert_eq!(coordinator.streams().len(), 1);
    let token = CancellationToken::new();
    let pipeline = tokio::spawn(coordinator.run(token.clone()));
    tokio::time::sleep(Duration::from_secs(1)).await;
    token.cancel();
    pipeline.await.unwrap().unwrap();

    assert_eq!(
        output_ids(store.as_ref(), "data/emergency_data").await,
        vec!["e1"]
    );
}

#[test]
fn invalid_config() {
    let mut config = test_config(&[StreamKind::Vehicle, StreamKind::Gps]);
    config.streams.insert(
        StreamKind::Gps,
        smartcity_types::config::StreamConfig {
            topic: Some("vehicle_data".to_string()),
            ..Default::default()
        },
    );
    let error = match Coordinator::new(
        config,
        memory_store(),
        Arc::new(MemoryBroker::default()),
    ) {
        Err(error) => error,
        Ok(_) => panic!("duplicate topics were accepted"),
    };
    assert_eq!(error.error_code(), "ConfigError.DuplicateLocation");
}
