//! Queue, worker pool and sweep wired together over the in-memory store.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use tokio_util::sync::CancellationToken;

use beacon_common::config::AppConfig;
use beacon_common::types::{DispatchJob, JobStatus};
use beacon_engine::{JobProcessor, JobStore, MemoryStore, ProcessorOptions};
use beacon_notifier::dry_run::DryRunGateway;
use beacon_worker::intake::{Intake, Sweeper};
use beacon_worker::queue::{Enqueued, WorkQueue, spawn_workers};
use beacon_worker::stats::WorkerStats;

fn test_config() -> AppConfig {
    AppConfig::from_vars(|key| match key {
        "DATABASE_URL" => Some("postgres://unused".to_string()),
        "DISPATCH_DRY_RUN" => Some("true".to_string()),
        "SWEEP_INTERVAL_MS" => Some("1000".to_string()),
        "PROCESSING_TIMEOUT_MS" => Some("60000".to_string()),
        _ => None,
    })
    .unwrap()
}

fn make_job(id: &str, created_at_millis: i64) -> DispatchJob {
    DispatchJob::pending(id, vec!["alice".to_string()], "Hi", "there", created_at_millis)
}

async fn wait_for_status(store: &MemoryStore, id: &str, status: JobStatus) {
    for _ in 0..100 {
        if store.get(id).await.unwrap().map(|j| j.status) == Some(status) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("job {} never reached {}", id, status);
}

#[tokio::test]
async fn test_queue_rejects_duplicates_and_overflow() {
    let stats = Arc::new(WorkerStats::new());
    let (queue, mut receiver) = WorkQueue::new(2, stats.clone());

    assert_eq!(queue.enqueue("job-1").await, Enqueued::Queued);
    assert_eq!(queue.enqueue("job-1").await, Enqueued::AlreadyQueued);
    assert_eq!(queue.enqueue("job-2").await, Enqueued::Queued);
    assert_eq!(queue.enqueue("job-3").await, Enqueued::Full);
    assert_eq!(queue.depth(), 2);

    assert_eq!(receiver.next().await.as_deref(), Some("job-1"));
    // Once dequeued the id may be queued again.
    assert_eq!(queue.enqueue("job-1").await, Enqueued::Queued);

    let snapshot = stats.snapshot();
    assert_eq!(snapshot.enqueued, 3);
    assert_eq!(snapshot.dropped, 1);
}

#[tokio::test]
async fn test_workers_process_drained_jobs() {
    let store = Arc::new(MemoryStore::new());
    store.set_inline_tokens("alice", &["alice-phone-0001"]).await;
    for i in 0..5 {
        store.insert_job(make_job(&format!("job-{}", i), i)).await;
    }

    let stats = Arc::new(WorkerStats::new());
    let (queue, receiver) = WorkQueue::new(16, stats.clone());
    let processor = Arc::new(JobProcessor::new(
        store.clone(),
        store.clone(),
        Arc::new(DryRunGateway::new()),
        ProcessorOptions::default(),
    ));
    let mut workers = spawn_workers(
        3,
        receiver,
        processor,
        stats.clone(),
        CancellationToken::new(),
    );

    let intake = Intake::new(store.clone(), queue.clone(), 10);
    assert_eq!(intake.drain_pending().await.unwrap(), 5);

    for i in 0..5 {
        wait_for_status(&store, &format!("job-{}", i), JobStatus::Sent).await;
    }

    drop(intake);
    drop(queue);
    while workers.join_next().await.is_some() {}

    let snapshot = stats.snapshot();
    assert_eq!(snapshot.sent, 5);
    assert_eq!(snapshot.errors, 0);
}

#[tokio::test]
async fn test_workers_stop_on_shutdown_while_senders_remain() {
    let store = Arc::new(MemoryStore::new());
    let stats = Arc::new(WorkerStats::new());
    let (queue, receiver) = WorkQueue::new(16, stats.clone());
    let processor = Arc::new(JobProcessor::new(
        store.clone(),
        store.clone(),
        Arc::new(DryRunGateway::new()),
        ProcessorOptions::default(),
    ));
    let shutdown = CancellationToken::new();
    let mut workers = spawn_workers(2, receiver, processor, stats, shutdown.clone());

    // A lingering sender, such as an open health connection, keeps the queue open.
    let _lingering = queue.clone();
    shutdown.cancel();

    let drained = tokio::time::timeout(Duration::from_secs(2), async {
        while workers.join_next().await.is_some() {}
    })
    .await;
    assert!(drained.is_ok(), "workers kept waiting on an open queue");
    assert_eq!(queue.enqueue("job-late").await, Enqueued::Closed);
}

#[tokio::test]
async fn test_notification_queues_announced_job_and_pending_page() {
    let store = Arc::new(MemoryStore::new());
    store.insert_job(make_job("job-0", 0)).await;
    store.insert_job(make_job("job-1", 1)).await;

    let stats = Arc::new(WorkerStats::new());
    let (queue, mut receiver) = WorkQueue::new(16, stats.clone());
    let intake = Intake::new(store.clone(), queue, 10);

    assert_eq!(intake.on_notification("  job-1 ").await.unwrap(), 2);
    assert_eq!(receiver.next().await.as_deref(), Some("job-1"));
    assert_eq!(receiver.next().await.as_deref(), Some("job-0"));

    // An empty payload still triggers the page query.
    assert_eq!(intake.on_notification("").await.unwrap(), 2);
}

#[tokio::test]
async fn test_sweep_recovers_and_requeues() {
    let store = Arc::new(MemoryStore::new());
    let config = test_config();

    let long_ago = Utc::now() - ChronoDuration::minutes(10);
    store
        .insert_job(make_job("stuck", long_ago.timestamp_millis()))
        .await;
    store.mark_processing("stuck", long_ago).await;
    store
        .insert_job(make_job("waiting", Utc::now().timestamp_millis()))
        .await;

    let stats = Arc::new(WorkerStats::new());
    let (queue, mut receiver) = WorkQueue::new(16, stats.clone());
    let sweeper = Sweeper::new(store.clone(), queue, stats.clone(), &config);

    let report = sweeper.sweep_once().await.unwrap();
    assert_eq!(report.recovered, 1);
    assert_eq!(report.queued, 2);
    assert_eq!(stats.snapshot().recovered, 1);

    assert_eq!(receiver.next().await.as_deref(), Some("stuck"));
    assert_eq!(receiver.next().await.as_deref(), Some("waiting"));

    // Nothing left to recover on the next pass.
    let report = sweeper.sweep_once().await.unwrap();
    assert_eq!(report.recovered, 0);
}

#[tokio::test]
async fn test_sweep_loop_delivers_missed_jobs() {
    let store = Arc::new(MemoryStore::new());
    store.set_inline_tokens("alice", &["alice-phone-0001"]).await;
    store
        .insert_job(make_job("missed", Utc::now().timestamp_millis()))
        .await;

    let config = test_config();
    let stats = Arc::new(WorkerStats::new());
    let (queue, receiver) = WorkQueue::new(16, stats.clone());
    let processor = Arc::new(JobProcessor::new(
        store.clone(),
        store.clone(),
        Arc::new(DryRunGateway::new()),
        ProcessorOptions::default(),
    ));
    let _workers = spawn_workers(
        1,
        receiver,
        processor,
        stats.clone(),
        CancellationToken::new(),
    );

    let sweeper = Arc::new(Sweeper::new(store.clone(), queue, stats.clone(), &config));
    let sweep = {
        let sweeper = sweeper.clone();
        tokio::spawn(async move { sweeper.run().await })
    };

    wait_for_status(&store, "missed", JobStatus::Sent).await;
    sweep.abort();
}
