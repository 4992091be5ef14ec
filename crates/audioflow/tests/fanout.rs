mod common;

use std::sync::Arc;

use common::{breaker, create_job, executor, memory_store, start_job, temp_audio_file, MockEngine,
    RecordingConnection};
use serde_json::json;
use uuid::Uuid;

use audioflow::jobs::executor::Outcome;
use audioflow::notify::{spawn_keepalive, JobEvent, StatusNotifier};

#[tokio::test]
async fn three_connections_all_receive_a_broadcast() {
    let notifier = StatusNotifier::new();
    let owner = Uuid::new_v4();

    let conns = [
        RecordingConnection::new(),
        RecordingConnection::new(),
        RecordingConnection::new(),
    ];
    for conn in &conns {
        notifier.register(owner, conn.clone(), json!({})).await;
    }

    let delivered = notifier.broadcast(&JobEvent::ping()).await;
    assert_eq!(delivered, 3);
    for conn in &conns {
        let events = conn.received();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["type"], "ping");
    }
}

#[tokio::test]
async fn one_failing_connection_does_not_block_the_others() {
    let notifier = StatusNotifier::new();
    let owner = Uuid::new_v4();

    let good_a = RecordingConnection::new();
    let bad = RecordingConnection::failing();
    let good_b = RecordingConnection::new();
    notifier.register(owner, good_a.clone(), json!({})).await;
    notifier.register(owner, bad.clone(), json!({})).await;
    notifier.register(owner, good_b.clone(), json!({})).await;

    let delivered = notifier.send_to_owner(owner, &JobEvent::ping()).await;
    assert_eq!(delivered, 2);
    assert_eq!(good_a.received().len(), 1);
    assert_eq!(good_b.received().len(), 1);
    assert!(bad.received().is_empty());
    assert_eq!(notifier.connection_count().await, 2);
}

#[tokio::test]
async fn job_events_arrive_in_non_decreasing_progress_order() {
    let store = memory_store();
    let notifier = Arc::new(StatusNotifier::new());
    let engine = MockEngine::new();

    let owner = Uuid::new_v4();
    let conn = RecordingConnection::new();
    notifier.register(owner, conn.clone(), json!({})).await;

    let exec = executor(store.clone(), engine, notifier.clone(), breaker());
    let path = temp_audio_file("ordering");
    let job = create_job(&store, owner, &path, 0).await;

    let running = start_job(&store, job.id).await;
    assert_eq!(exec.run(running).await, Outcome::Completed);

    let events = conn.received();
    let progress: Vec<i64> = events
        .iter()
        .filter(|e| e["type"] == "job_status")
        .filter_map(|e| e["progress"].as_i64())
        .collect();

    assert!(!progress.is_empty());
    assert!(
        progress.windows(2).all(|w| w[0] <= w[1]),
        "progress regressed: {progress:?}"
    );
    assert_eq!(*progress.last().unwrap(), 100);

    // completion side effects
    assert!(events.iter().any(|e| e["type"] == "transcript_ready"));
    let final_status = events
        .iter()
        .filter(|e| e["type"] == "job_status")
        .last()
        .unwrap();
    assert_eq!(final_status["status"], "completed");
}

#[tokio::test]
async fn keepalive_probe_evicts_only_on_failed_write() {
    let notifier = Arc::new(StatusNotifier::new());
    let owner = Uuid::new_v4();

    let good = RecordingConnection::new();
    let bad = RecordingConnection::failing();
    notifier.register(owner, good.clone(), json!({})).await;
    notifier.register(owner, bad.clone(), json!({})).await;
    assert_eq!(notifier.connection_count().await, 2);

    let handle = spawn_keepalive(notifier.clone(), std::time::Duration::from_millis(10));
    tokio::time::sleep(std::time::Duration::from_millis(40)).await;
    handle.abort();

    // the dead connection is gone, the live one kept receiving pings
    assert_eq!(notifier.connection_count().await, 1);
    let pings = good
        .received()
        .iter()
        .filter(|e| e["type"] == "ping")
        .count();
    assert!(pings >= 1);
}
