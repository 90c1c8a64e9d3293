use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use futures::StreamExt;
use kafka_partition_multiplexer::testing::{make_record, FakeConsumerActor, SeekBehavior};
use kafka_partition_multiplexer::{
    ConsumerRecord, Multiplexer, MultiplexerConfig, OffsetMap, Partition, SubscriptionMode,
};

static TRACING_INIT: Once = Once::new();

fn setup_tracing() {
    TRACING_INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_writer(tracing_subscriber::fmt::TestWriter::new())
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .init()
    });
}

fn string_builder() -> Arc<impl Fn(ConsumerRecord) -> String + Send + Sync + 'static> {
    Arc::new(|record: ConsumerRecord| {
        String::from_utf8(record.payload.unwrap_or_default()).unwrap()
    })
}

fn test_kafka_config() -> kafka_partition_multiplexer::config::KafkaConfig {
    kafka_partition_multiplexer::config::KafkaConfig {
        kafka_tls: false,
        kafka_hosts: "localhost:9092".into(),
        kafka_topic_metadata_refresh_interval_ms: None,
        kafka_socket_timeout_ms: None,
        kafka_metadata_max_age_ms: None,
    }
}

fn test_consumer_config() -> kafka_partition_multiplexer::config::ConsumerConfig {
    kafka_partition_multiplexer::config::ConsumerConfig {
        kafka_consumer_group: "test-group".into(),
        kafka_consumer_topic: "topic-a".into(),
        kafka_consumer_offset_reset: "earliest".into(),
        kafka_consumer_auto_commit: false,
        kafka_consumer_auto_commit_interval_ms: 5000,
    }
}

fn base_config(wait_close_partition: Duration) -> MultiplexerConfig {
    MultiplexerConfig {
        subscription: SubscriptionMode::Topics(vec!["topic-a".into()]),
        get_offsets_on_assign: None,
        on_revoke: None,
        wait_close_partition,
        consumer: test_kafka_config(),
        consumer_group: test_consumer_config(),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn consume_from_beginning() {
    setup_tracing();
    let fake = FakeConsumerActor::new();
    let tp = Partition::new("topic-a", 0);
    let records: Vec<ConsumerRecord> = (1..=100)
        .map(|i| make_record(&tp, i - 1, &i.to_string()))
        .collect();

    let config = base_config(Duration::from_millis(200));
    let (_mux, mut stream) =
        Multiplexer::start(config, fake.clone(), string_builder());

    fake.emit_assigned(vec![tp.clone()]).await;
    fake.push_records(&tp, records).await;

    let (got_tp, mut sub) = tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("timed out waiting for subsource")
        .expect("stream ended early");
    assert_eq!(got_tp, tp);

    let mut seen = Vec::new();
    for _ in 0..100 {
        let msg = tokio::time::timeout(Duration::from_secs(5), sub.next())
            .await
            .expect("timed out waiting for message")
            .expect("substream ended early")
            .expect("message was an error");
        seen.push(msg);
    }

    let expected: Vec<String> = (1..=100).map(|i| i.to_string()).collect();
    assert_eq!(seen, expected);
}

#[tokio::test(flavor = "multi_thread")]
async fn seek_to_middle() {
    setup_tracing();
    let fake = FakeConsumerActor::new();
    let tp = Partition::new("topic-a", 0);

    let mut config = base_config(Duration::from_millis(200));
    config.get_offsets_on_assign = Some(Arc::new(move |partitions: HashSet<Partition>| {
        Box::pin(async move {
            let mut offsets = OffsetMap::new();
            for tp in partitions {
                offsets.insert(tp, 50);
            }
            Ok(offsets)
        })
    }));

    let (_mux, mut stream) =
        Multiplexer::start(config, fake.clone(), string_builder());

    fake.emit_assigned(vec![tp.clone()]).await;

    // Only offsets 51..=100 are ever produced by the broker once it has
    // honored the seek — offsets 1..=50 are never delivered by this fake.
    let records: Vec<ConsumerRecord> = (51..=100)
        .map(|i| make_record(&tp, i - 1, &i.to_string()))
        .collect();
    fake.push_records(&tp, records).await;

    let (_, mut sub) = tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .unwrap()
        .unwrap();

    let mut seen = Vec::new();
    for _ in 0..50 {
        let msg = tokio::time::timeout(Duration::from_secs(5), sub.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        seen.push(msg);
    }

    let expected: Vec<String> = (51..=100).map(|i| i.to_string()).collect();
    assert_eq!(seen, expected);

    let seeks = fake.seek_calls().await;
    assert_eq!(seeks.len(), 1);
    assert_eq!(seeks[0].get(&tp), Some(&50));
}

#[tokio::test(flavor = "multi_thread")]
async fn on_revoke_fires_after_grace_window() {
    setup_tracing();
    let fake = FakeConsumerActor::new();
    let tp = Partition::new("topic-a", 0);

    let revoked_seen: Arc<Mutex<Option<HashSet<Partition>>>> = Arc::new(Mutex::new(None));
    let revoked_seen_clone = Arc::clone(&revoked_seen);

    let mut config = base_config(Duration::from_millis(150));
    config.on_revoke = Some(Arc::new(move |partitions: HashSet<Partition>| {
        *revoked_seen_clone.lock().unwrap() = Some(partitions);
    }));

    let (mux, mut stream) = Multiplexer::start(config, fake.clone(), string_builder());

    fake.emit_assigned(vec![tp.clone()]).await;
    let (_, mut sub) = tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .unwrap()
        .unwrap();

    fake.push_records(&tp, vec![make_record(&tp, 0, "1")]).await;
    let first = tokio::time::timeout(Duration::from_secs(5), sub.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(first, "1");

    fake.emit_revoked(vec![tp.clone()]).await;
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert_eq!(revoked_seen.lock().unwrap().as_ref(), Some(&HashSet::from([tp.clone()])));

    // the substream is now dead: its owning SubSource has been shut down.
    let next = tokio::time::timeout(Duration::from_secs(2), sub.next()).await;
    match next {
        Ok(None) => {}
        Ok(Some(Err(_))) => {}
        other => panic!("expected the substream to have ended, got {other:?}"),
    }

    mux.shutdown();
    tokio::time::timeout(Duration::from_secs(5), mux.joined())
        .await
        .expect("shutdown did not complete in time");
}

#[tokio::test(flavor = "multi_thread")]
async fn revoke_then_reassign_within_grace_window_keeps_subsource() {
    setup_tracing();
    let fake = FakeConsumerActor::new();
    let tp = Partition::new("topic-a", 0);

    let revoked_called = Arc::new(AtomicUsize::new(0));
    let revoked_called_clone = Arc::clone(&revoked_called);

    let mut config = base_config(Duration::from_millis(300));
    config.on_revoke = Some(Arc::new(move |_partitions: HashSet<Partition>| {
        revoked_called_clone.fetch_add(1, Ordering::SeqCst);
    }));

    let (_mux, mut stream) =
        Multiplexer::start(config, fake.clone(), string_builder());

    fake.emit_assigned(vec![tp.clone()]).await;
    let (_, mut sub) = tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .unwrap()
        .unwrap();

    fake.emit_revoked(vec![tp.clone()]).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    fake.emit_assigned(vec![tp.clone()]).await;

    // Wait past the original grace window: revoke must not have fired.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(revoked_called.load(Ordering::SeqCst), 0);

    // No duplicate emission: a second pull should not immediately produce
    // another (tp, subsource) pair for the same partition.
    let second = tokio::time::timeout(Duration::from_millis(300), stream.next()).await;
    assert!(second.is_err(), "partition was re-emitted while still running");

    // The original substream is still alive and usable.
    fake.push_records(&tp, vec![make_record(&tp, 0, "hello")]).await;
    let msg = tokio::time::timeout(Duration::from_secs(5), sub.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(msg, "hello");
}

#[tokio::test(flavor = "multi_thread")]
async fn subsource_cancel_returns_partition_for_fresh_emission() {
    setup_tracing();
    let fake = FakeConsumerActor::new();
    let tp = Partition::new("topic-a", 0);
    let tp2 = Partition::new("topic-a", 1);

    let config = base_config(Duration::from_millis(200));
    let (_mux, mut stream) =
        Multiplexer::start(config, fake.clone(), string_builder());

    fake.emit_assigned(vec![tp.clone(), tp2.clone()]).await;

    let first = tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .unwrap()
        .unwrap();
    let second = tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .unwrap()
        .unwrap();

    let (p2_tp, p2_sub) = if first.0 == tp2 { first } else { second };
    assert_eq!(p2_tp, tp2);

    // Downstream cancels the substream for p2 while it is still assigned.
    drop(p2_sub);

    let (re_tp, mut re_sub) = tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("timed out waiting for re-emission")
        .expect("stream ended");
    assert_eq!(re_tp, tp2);

    fake.push_records(&tp2, vec![make_record(&tp2, 0, "again")]).await;
    let msg = tokio::time::timeout(Duration::from_secs(5), re_sub.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(msg, "again");
}

#[tokio::test]
async fn seek_timeout_fails_the_stage() {
    setup_tracing();
    let fake = FakeConsumerActor::new();
    let tp = Partition::new("topic-a", 0);
    fake.set_seek_behavior(SeekBehavior::Hang).await;

    let mut config = base_config(Duration::from_millis(200));
    config.get_offsets_on_assign = Some(Arc::new(move |partitions: HashSet<Partition>| {
        Box::pin(async move {
            let mut offsets = OffsetMap::new();
            for tp in partitions {
                offsets.insert(tp, 0);
            }
            Ok(offsets)
        })
    }));

    let (mux, mut stream) = Multiplexer::start(config, fake.clone(), string_builder());
    fake.emit_assigned(vec![tp.clone()]).await;

    // Let the seek task actually spawn and register its timeout before the
    // clock is frozen, otherwise advancing has nothing to advance past.
    tokio::time::sleep(Duration::from_millis(50)).await;

    tokio::time::pause();
    tokio::time::advance(Duration::from_secs(11)).await;
    tokio::time::resume();

    // No subsource is ever emitted for the stuck partition, and the stage
    // eventually terminates with a ConsumerFailed/SeekFailed error.
    let emitted = tokio::time::timeout(Duration::from_millis(200), stream.next()).await;
    assert!(emitted.is_err() || emitted.unwrap().is_none());

    let mut err = None;
    for _ in 0..50 {
        if let Some(e) = mux.last_error() {
            err = Some(e);
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let err = err.expect("expected a recorded failure");
    assert!(err.is_consumer_failed());

    tokio::time::timeout(Duration::from_secs(5), mux.joined())
        .await
        .expect("stage did not terminate after seek timeout");
}
