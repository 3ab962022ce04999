//! End-to-end dispatch scenarios over the in-memory store.
//!
//! Run with:
//!
//! ```bash
//! cargo test -p beacon-engine --test scenarios
//! ```

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration, Utc};

use beacon_common::types::{DeviceToken, DispatchJob, JobStatus};
use beacon_engine::{JobProcessor, JobStore, MemoryStore, ProcessOutcome, ProcessorOptions};
use beacon_notifier::{
    DeliveryError, DeliveryErrorCode, NotifierError, PushGateway, PushMessage, TokenResult,
};

// ============================================================
// Shared helpers
// ============================================================

/// Gateway that records every token it is asked to send to.
///
/// Tokens starting with `gone-` are reported unregistered, tokens starting
/// with `busy-` hit a quota error, and a batch containing `down-` fails
/// outright. When `steal` is set the claim on that job is taken away while
/// the send is in flight.
#[derive(Default)]
struct RecordingGateway {
    sent: Mutex<Vec<String>>,
    steal: Option<(Arc<MemoryStore>, String)>,
}

impl RecordingGateway {
    fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl PushGateway for RecordingGateway {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn max_batch_size(&self) -> usize {
        2
    }

    async fn send_multicast(
        &self,
        _message: &PushMessage,
        tokens: &[String],
    ) -> Result<Vec<TokenResult>, NotifierError> {
        if let Some((store, job_id)) = &self.steal {
            store.mark_processing(job_id, Utc::now()).await;
        }

        self.sent.lock().unwrap().extend(tokens.iter().cloned());

        if tokens.iter().any(|t| t.starts_with("down-")) {
            return Err(NotifierError::Auth("invalid_grant".into()));
        }

        Ok(tokens
            .iter()
            .map(|t| {
                if t.starts_with("gone-") {
                    TokenResult::failed(
                        t.clone(),
                        DeliveryError::new(DeliveryErrorCode::Unregistered, "Requested entity was not found."),
                    )
                } else if t.starts_with("busy-") {
                    TokenResult::failed(
                        t.clone(),
                        DeliveryError::new(DeliveryErrorCode::QuotaExceeded, "Quota exceeded."),
                    )
                } else {
                    TokenResult::delivered(t.clone(), format!("projects/test/messages/{}", t))
                }
            })
            .collect())
    }
}

fn processor(store: &Arc<MemoryStore>, gateway: &Arc<RecordingGateway>) -> JobProcessor {
    processor_with(store, gateway, ProcessorOptions::default())
}

fn processor_with(
    store: &Arc<MemoryStore>,
    gateway: &Arc<RecordingGateway>,
    options: ProcessorOptions,
) -> JobProcessor {
    JobProcessor::new(store.clone(), store.clone(), gateway.clone(), options)
}

fn make_job(id: &str, users: &[&str]) -> DispatchJob {
    DispatchJob::pending(
        id,
        users.iter().map(|u| u.to_string()).collect(),
        "New message",
        "You have a new message",
        Utc::now().timestamp_millis(),
    )
}

async fn status_of(store: &MemoryStore, id: &str) -> JobStatus {
    store.get(id).await.unwrap().unwrap().status
}

// ============================================================
// Delivery outcomes
// ============================================================

#[tokio::test]
async fn test_all_tokens_delivered() {
    let store = Arc::new(MemoryStore::new());
    store
        .set_inline_tokens("alice", &["alice-phone-0001", "alice-tablet-001"])
        .await;
    store
        .add_sub_record("bob", DeviceToken::new("bob-phone-00001"))
        .await;
    store.insert_job(make_job("job-1", &["alice", "bob"])).await;

    let gateway = Arc::new(RecordingGateway::default());
    processor(&store, &gateway).process("job-1").await.unwrap();

    let job = store.get("job-1").await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Sent);
    assert_eq!(job.success_count, 3);
    assert_eq!(job.failed_count, 0);
    assert_eq!(job.token_count, 3);
    assert!(job.last_errors.is_empty());
    assert!(!job.dry_run);

    let mut sent = gateway.sent();
    sent.sort();
    assert_eq!(sent, vec!["alice-phone-0001", "alice-tablet-001", "bob-phone-00001"]);
}

#[tokio::test]
async fn test_partial_failure_is_sent_and_prunes_invalid_token() {
    let store = Arc::new(MemoryStore::new());
    store
        .set_inline_tokens("alice", &["alice-phone-0001", "gone-tablet-0001"])
        .await;
    store.insert_job(make_job("job-1", &["alice"])).await;

    let gateway = Arc::new(RecordingGateway::default());
    processor(&store, &gateway).process("job-1").await.unwrap();

    let job = store.get("job-1").await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Sent);
    assert_eq!(job.success_count, 1);
    assert_eq!(job.failed_count, 1);
    assert_eq!(job.last_errors.len(), 1);
    assert_eq!(job.last_errors[0].code, "unregistered");
    assert_eq!(job.last_errors[0].token, "gone-tab…");

    assert_eq!(store.user_tokens("alice").await, vec!["alice-phone-0001"]);
}

#[tokio::test]
async fn test_retryable_failure_keeps_token() {
    let store = Arc::new(MemoryStore::new());
    store.set_inline_tokens("alice", &["busy-phone-0001"]).await;
    store.insert_job(make_job("job-1", &["alice"])).await;

    let gateway = Arc::new(RecordingGateway::default());
    processor(&store, &gateway).process("job-1").await.unwrap();

    let job = store.get("job-1").await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.failed_count, 1);
    assert!(job.error.unwrap().contains("1 token"));
    assert_eq!(store.user_tokens("alice").await, vec!["busy-phone-0001"]);
}

#[tokio::test]
async fn test_failed_batch_fails_only_its_tokens() {
    let store = Arc::new(MemoryStore::new());
    store
        .set_inline_tokens("alice", &["alice-phone-0001", "alice-tablet-001", "down-watch-0001"])
        .await;
    store.insert_job(make_job("job-1", &["alice"])).await;

    let gateway = Arc::new(RecordingGateway::default());
    processor(&store, &gateway).process("job-1").await.unwrap();

    let job = store.get("job-1").await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Sent);
    assert_eq!(job.success_count, 2);
    assert_eq!(job.failed_count, 1);
    assert_eq!(job.last_errors[0].code, "auth_error");
}

#[tokio::test]
async fn test_error_samples_are_capped() {
    let store = Arc::new(MemoryStore::new());
    let tokens: Vec<String> = (0..15).map(|i| format!("gone-device-{:04}", i)).collect();
    let refs: Vec<&str> = tokens.iter().map(String::as_str).collect();
    store.set_inline_tokens("alice", &refs).await;
    store.insert_job(make_job("job-1", &["alice"])).await;

    let gateway = Arc::new(RecordingGateway::default());
    processor(&store, &gateway).process("job-1").await.unwrap();

    let job = store.get("job-1").await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.failed_count, 15);
    assert_eq!(job.last_errors.len(), 10);
    assert!(store.user_tokens("alice").await.is_empty());
}

#[tokio::test]
async fn test_no_tokens_never_calls_gateway() {
    let store = Arc::new(MemoryStore::new());
    store.set_inline_tokens("alice", &["short"]).await;
    store.insert_job(make_job("job-1", &["alice", "nobody"])).await;

    let gateway = Arc::new(RecordingGateway::default());
    let outcome = processor(&store, &gateway).process("job-1").await.unwrap();

    assert!(matches!(outcome, ProcessOutcome::Finalized(ref o) if o.status == JobStatus::NoTokens));
    assert_eq!(status_of(&store, "job-1").await, JobStatus::NoTokens);
    assert!(gateway.sent().is_empty());
}

// ============================================================
// Recipient filtering
// ============================================================

#[tokio::test]
async fn test_sender_devices_are_excluded_even_when_shared() {
    let store = Arc::new(MemoryStore::new());
    // The sender is also a recipient and shares a family iPad with Bob.
    store
        .set_inline_tokens("alice", &["alice-phone-0001", "family-ipad-00001"])
        .await;
    store
        .set_inline_tokens("bob", &["family-ipad-00001", "bob-phone-00001"])
        .await;

    let mut job = make_job("job-1", &["alice", "bob"]);
    job.sender_user_id = Some("alice".to_string());
    store.insert_job(job).await;

    let gateway = Arc::new(RecordingGateway::default());
    processor(&store, &gateway).process("job-1").await.unwrap();

    assert_eq!(gateway.sent(), vec!["bob-phone-00001"]);
    let job = store.get("job-1").await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Sent);
    assert_eq!(job.token_count, 1);
}

#[tokio::test]
async fn test_foreign_tokens_are_filtered() {
    let store = Arc::new(MemoryStore::new());
    store.set_inline_tokens("alice", &["alice-phone-0001"]).await;
    store
        .add_sub_record("carol", DeviceToken::new("carol-phone-0001").seen_at(Utc::now()))
        .await;

    let mut job = make_job("job-1", &["alice"]);
    job.explicit_tokens = Some(vec![
        "alice-phone-0001".to_string(),
        "carol-phone-0001".to_string(),
    ]);
    store.insert_job(job).await;

    let gateway = Arc::new(RecordingGateway::default());
    processor(&store, &gateway).process("job-1").await.unwrap();

    assert_eq!(gateway.sent(), vec!["alice-phone-0001"]);
    assert_eq!(status_of(&store, "job-1").await, JobStatus::Sent);

    // Without cleanup the foreign registration stays put.
    assert_eq!(store.user_tokens("carol").await, vec!["carol-phone-0001"]);
}

#[tokio::test]
async fn test_shared_token_reaches_recipient_with_cleanup_on() {
    let store = Arc::new(MemoryStore::new());
    let now = Utc::now();
    // Alice's inline token was registered by Bob more recently.
    store.set_inline_tokens("alice", &["shared-token-000001"]).await;
    store
        .add_sub_record("bob", DeviceToken::new("shared-token-000001").seen_at(now))
        .await;
    store
        .add_sub_record(
            "bob",
            DeviceToken::new("bob-old-phone-001").seen_at(now - Duration::days(30)),
        )
        .await;
    store.insert_job(make_job("job-1", &["alice"])).await;

    let options = ProcessorOptions {
        ownership_cleanup: true,
        ..ProcessorOptions::default()
    };
    let gateway = Arc::new(RecordingGateway::default());
    processor_with(&store, &gateway, options)
        .process("job-1")
        .await
        .unwrap();

    assert_eq!(status_of(&store, "job-1").await, JobStatus::Sent);
    assert_eq!(gateway.sent(), vec!["shared-token-000001"]);
    assert_eq!(store.user_tokens("alice").await, vec!["shared-token-000001"]);
    assert_eq!(
        store.user_tokens("bob").await,
        vec!["shared-token-000001", "bob-old-phone-001"]
    );
}

#[tokio::test]
async fn test_ownership_cleanup_removes_foreign_registration() {
    let store = Arc::new(MemoryStore::new());
    store.set_inline_tokens("alice", &["alice-phone-0001"]).await;
    store
        .add_sub_record("carol", DeviceToken::new("carol-phone-0001").seen_at(Utc::now()))
        .await;

    let mut job = make_job("job-1", &["alice"]);
    job.explicit_tokens = Some(vec!["carol-phone-0001".to_string()]);
    store.insert_job(job).await;

    let options = ProcessorOptions {
        ownership_cleanup: true,
        ..ProcessorOptions::default()
    };
    let gateway = Arc::new(RecordingGateway::default());
    processor_with(&store, &gateway, options)
        .process("job-1")
        .await
        .unwrap();

    assert_eq!(status_of(&store, "job-1").await, JobStatus::NoTokens);
    assert!(gateway.sent().is_empty());
    assert!(store.user_tokens("carol").await.is_empty());
    assert_eq!(store.user_tokens("alice").await, vec!["alice-phone-0001"]);
}

#[tokio::test]
async fn test_explicit_tokens_are_used_as_given() {
    let store = Arc::new(MemoryStore::new());
    store.set_inline_tokens("alice", &["alice-phone-0001"]).await;

    let mut job = make_job("job-1", &["alice"]);
    job.explicit_tokens = Some(vec!["kiosk-display-001".to_string()]);
    store.insert_job(job).await;

    let gateway = Arc::new(RecordingGateway::default());
    processor(&store, &gateway).process("job-1").await.unwrap();

    assert_eq!(gateway.sent(), vec!["kiosk-display-001"]);
}

// ============================================================
// Claiming and recovery
// ============================================================

#[tokio::test]
async fn test_concurrent_workers_send_once() {
    let store = Arc::new(MemoryStore::new());
    store.set_inline_tokens("alice", &["alice-phone-0001"]).await;
    store.insert_job(make_job("job-1", &["alice"])).await;

    let gateway = Arc::new(RecordingGateway::default());
    let processor = Arc::new(processor(&store, &gateway));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let processor = processor.clone();
        handles.push(tokio::spawn(async move { processor.process("job-1").await.unwrap() }));
    }

    let mut finalized = 0;
    for handle in handles {
        if matches!(handle.await.unwrap(), ProcessOutcome::Finalized(_)) {
            finalized += 1;
        }
    }

    assert_eq!(finalized, 1);
    assert_eq!(gateway.sent(), vec!["alice-phone-0001"]);
}

#[tokio::test]
async fn test_reclaimed_job_result_is_discarded() {
    let store = Arc::new(MemoryStore::new());
    store.set_inline_tokens("alice", &["alice-phone-0001"]).await;
    store.insert_job(make_job("job-1", &["alice"])).await;

    let gateway = Arc::new(RecordingGateway {
        steal: Some((store.clone(), "job-1".to_string())),
        ..RecordingGateway::default()
    });
    let outcome = processor(&store, &gateway).process("job-1").await.unwrap();

    assert_eq!(outcome, ProcessOutcome::Superseded);
    let job = store.get("job-1").await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Processing);
    assert_eq!(job.attempt, 2);
    assert_eq!(job.success_count, 0);
}

#[tokio::test]
async fn test_stuck_job_is_recovered_and_delivered() {
    let store = Arc::new(MemoryStore::new());
    store.set_inline_tokens("alice", &["alice-phone-0001"]).await;

    let created = Utc::now() - Duration::minutes(10);
    let mut job = make_job("job-1", &["alice"]);
    job.created_at_millis = created.timestamp_millis();
    store.insert_job(job).await;
    store.mark_processing("job-1", created).await;

    let gateway = Arc::new(RecordingGateway::default());
    let processor = processor(&store, &gateway);

    // Still claimed by the lost worker: nothing to do.
    assert_eq!(processor.process("job-1").await.unwrap(), ProcessOutcome::Skipped);

    let cutoff = (Utc::now() - Duration::minutes(5)).timestamp_millis();
    assert_eq!(store.recover_stuck(cutoff, 100).await.unwrap(), vec!["job-1"]);
    assert_eq!(status_of(&store, "job-1").await, JobStatus::Pending);

    processor.process("job-1").await.unwrap();
    let job = store.get("job-1").await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Sent);
    assert_eq!(job.attempt, 2);
}

#[tokio::test]
async fn test_recent_claims_are_not_recovered() {
    let store = Arc::new(MemoryStore::new());

    let old = Utc::now() - Duration::minutes(10);
    let mut job = make_job("job-1", &["alice"]);
    job.created_at_millis = old.timestamp_millis();
    store.insert_job(job).await;
    // Created long ago but claimed just now.
    store.mark_processing("job-1", Utc::now()).await;

    let cutoff = (Utc::now() - Duration::minutes(5)).timestamp_millis();
    assert!(store.recover_stuck(cutoff, 100).await.unwrap().is_empty());
    assert_eq!(status_of(&store, "job-1").await, JobStatus::Processing);
}
