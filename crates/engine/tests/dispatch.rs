//! State-machine tests for the dispatch engine and retry scheduler.
//!
//! Run against the in-memory record store with scripted transports, so no
//! database or SMTP relay is needed.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use courier_common::config::DispatchConfig;
use courier_common::error::AppError;
use courier_common::types::{DeliveryStatus, NotificationRecord, NotificationRequest};
use courier_engine::{DispatchEngine, MemoryRecordStore, RecordStore, RetryPolicy, RetryScheduler};
use courier_notifier::{DeliveryOutcome, OutgoingEmail, Transport};

// ============================================================
// Helpers
// ============================================================

/// Transport that replays a script of outcomes, then repeats `fallback`.
struct ScriptedTransport {
    script: Mutex<VecDeque<DeliveryOutcome>>,
    fallback: DeliveryOutcome,
    calls: AtomicUsize,
    delay: Duration,
}

impl ScriptedTransport {
    fn always(outcome: DeliveryOutcome) -> Arc<Self> {
        Self::scripted(Vec::new(), outcome)
    }

    fn scripted(script: Vec<DeliveryOutcome>, fallback: DeliveryOutcome) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            fallback,
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
        })
    }

    fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            fallback: DeliveryOutcome::Success,
            calls: AtomicUsize::new(0),
            delay,
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, _email: &OutgoingEmail) -> DeliveryOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let next = self.script.lock().pop_front();
        next.unwrap_or_else(|| self.fallback.clone())
    }
}

fn transient() -> DeliveryOutcome {
    DeliveryOutcome::TransientFailure("connection refused".to_string())
}

/// Policy with zero delays so retries are due immediately.
fn instant_policy(max_attempts: i32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_delay: Duration::ZERO,
        max_delay: Duration::ZERO,
    }
}

fn scheduler_config() -> DispatchConfig {
    DispatchConfig {
        max_attempts: 5,
        base_delay: Duration::ZERO,
        max_delay: Duration::ZERO,
        poll_interval: Duration::from_millis(10),
        workers: 4,
        batch_size: 100,
        stale_after: Duration::from_secs(60),
    }
}

fn build(
    transport: Arc<ScriptedTransport>,
    policy: RetryPolicy,
) -> (DispatchEngine, Arc<MemoryRecordStore>) {
    let store = Arc::new(MemoryRecordStore::new());
    let engine = DispatchEngine::new(store.clone(), transport, policy, Duration::from_secs(10));
    (engine, store)
}

fn request(recipient: &str, key: Option<&str>) -> NotificationRequest {
    NotificationRequest {
        recipient: recipient.to_string(),
        subject: "Hi".to_string(),
        body: "Test".to_string(),
        idempotency_key: key.map(str::to_string),
    }
}

// ============================================================
// Intake
// ============================================================

#[tokio::test]
async fn test_submit_success_marks_sent() {
    let transport = ScriptedTransport::always(DeliveryOutcome::Success);
    let (engine, _store) = build(transport.clone(), RetryPolicy::default());

    let submission = engine
        .submit(request("user@example.com", None))
        .await
        .unwrap();
    assert!(!submission.replayed);
    assert_eq!(submission.record.status, DeliveryStatus::Sent);
    assert_eq!(submission.record.attempt_count, 1);

    let stored = engine.status(submission.record.id).await.unwrap();
    assert_eq!(stored.id, submission.record.id);
    assert_eq!(stored.status, DeliveryStatus::Sent);
    assert_eq!(stored.attempt_count, 1);
    assert!(stored.last_attempt_at.is_some());
    assert!(stored.last_error.is_none());
    assert_eq!(transport.calls(), 1);
}

#[tokio::test]
async fn test_invalid_recipient_creates_nothing() {
    let transport = ScriptedTransport::always(DeliveryOutcome::Success);
    let (engine, store) = build(transport.clone(), RetryPolicy::default());

    let err = engine
        .submit(request("not-an-email", None))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));
    assert!(store.is_empty());
    assert_eq!(transport.calls(), 0);
}

#[tokio::test]
async fn test_idempotency_key_sends_once() {
    let transport = ScriptedTransport::always(DeliveryOutcome::Success);
    let (engine, store) = build(transport.clone(), RetryPolicy::default());

    let first = engine
        .submit(request("user@example.com", Some("k1")))
        .await
        .unwrap();
    let second = engine
        .submit(request("user@example.com", Some("k1")))
        .await
        .unwrap();

    assert_eq!(first.record.id, second.record.id);
    assert!(!first.replayed);
    assert!(second.replayed);
    assert_eq!(second.record.status, DeliveryStatus::Sent);
    assert_eq!(transport.calls(), 1);
    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn test_status_of_unknown_id_is_not_found() {
    let transport = ScriptedTransport::always(DeliveryOutcome::Success);
    let (engine, _store) = build(transport, RetryPolicy::default());

    let err = engine.status(uuid::Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn test_submitted_status_is_never_pending() {
    let outcomes = [
        DeliveryOutcome::Success,
        transient(),
        DeliveryOutcome::PermanentFailure("SMTP 550".to_string()),
    ];

    for outcome in outcomes {
        let transport = ScriptedTransport::always(outcome);
        let (engine, _store) = build(transport, RetryPolicy::default());
        let submission = engine
            .submit(request("user@example.com", None))
            .await
            .unwrap();
        let stored = engine.status(submission.record.id).await.unwrap();
        assert!(matches!(
            stored.status,
            DeliveryStatus::Sent
                | DeliveryStatus::Sending
                | DeliveryStatus::PendingRetry
                | DeliveryStatus::FailedPermanent
        ));
    }
}

// ============================================================
// Failure handling
// ============================================================

#[tokio::test]
async fn test_permanent_failure_short_circuits() {
    let transport =
        ScriptedTransport::always(DeliveryOutcome::PermanentFailure("SMTP 550".to_string()));
    let (engine, _store) = build(transport.clone(), instant_policy(5));
    let scheduler = RetryScheduler::new(engine.clone(), &scheduler_config());

    let submission = engine
        .submit(request("user@example.com", None))
        .await
        .unwrap();
    assert_eq!(submission.record.status, DeliveryStatus::FailedPermanent);
    assert_eq!(submission.record.attempt_count, 1);
    assert_eq!(submission.record.last_error.as_deref(), Some("SMTP 550"));

    assert_eq!(scheduler.run_once().await.unwrap(), 0);
    assert_eq!(transport.calls(), 1);
}

#[tokio::test]
async fn test_transient_failure_schedules_retry() {
    let transport = ScriptedTransport::always(transient());
    let (engine, _store) = build(transport, RetryPolicy::default());

    let before = Utc::now();
    let submission = engine
        .submit(request("user@example.com", None))
        .await
        .unwrap();

    let record = submission.record;
    assert_eq!(record.status, DeliveryStatus::PendingRetry);
    assert_eq!(record.attempt_count, 1);
    assert_eq!(record.last_error.as_deref(), Some("connection refused"));
    let due = record.next_attempt_at.expect("retry must be scheduled");
    assert!(due >= before + chrono::Duration::seconds(1));
}

#[tokio::test]
async fn test_retry_then_success() {
    let transport = ScriptedTransport::scripted(vec![transient()], DeliveryOutcome::Success);
    let (engine, _store) = build(transport.clone(), instant_policy(5));
    let scheduler = RetryScheduler::new(engine.clone(), &scheduler_config());

    let submission = engine
        .submit(request("user@example.com", None))
        .await
        .unwrap();
    assert_eq!(submission.record.status, DeliveryStatus::PendingRetry);

    assert_eq!(scheduler.run_once().await.unwrap(), 1);

    let record = engine.status(submission.record.id).await.unwrap();
    assert_eq!(record.status, DeliveryStatus::Sent);
    assert_eq!(record.attempt_count, 2);
    assert!(record.last_error.is_none());
    assert_eq!(transport.calls(), 2);
}

#[tokio::test]
async fn test_retry_exhaustion_after_max_attempts() {
    let transport = ScriptedTransport::always(transient());
    let (engine, _store) = build(transport.clone(), instant_policy(3));
    let scheduler = RetryScheduler::new(engine.clone(), &scheduler_config());

    let submission = engine
        .submit(request("user@example.com", None))
        .await
        .unwrap();
    let id = submission.record.id;

    for _ in 0..10 {
        scheduler.run_once().await.unwrap();
    }

    let record = engine.status(id).await.unwrap();
    assert_eq!(record.status, DeliveryStatus::FailedExhausted);
    assert_eq!(record.attempt_count, 3);
    assert!(record.next_attempt_at.is_none());
    assert_eq!(transport.calls(), 3);

    // Terminal: nothing left to pick up
    assert_eq!(scheduler.run_once().await.unwrap(), 0);
    assert_eq!(engine.status(id).await.unwrap(), record);
}

#[tokio::test]
async fn test_single_attempt_policy_exhausts_immediately() {
    let transport = ScriptedTransport::always(transient());
    let (engine, _store) = build(transport, instant_policy(1));

    let submission = engine
        .submit(request("user@example.com", None))
        .await
        .unwrap();
    assert_eq!(submission.record.status, DeliveryStatus::FailedExhausted);
    assert_eq!(submission.record.attempt_count, 1);
}

#[tokio::test]
async fn test_retry_not_due_is_left_alone() {
    let transport = ScriptedTransport::always(transient());
    let (engine, _store) = build(transport.clone(), RetryPolicy::default());
    let scheduler = RetryScheduler::new(engine.clone(), &scheduler_config());

    engine
        .submit(request("user@example.com", None))
        .await
        .unwrap();

    // First retry is at least a second away
    assert_eq!(scheduler.run_once().await.unwrap(), 0);
    assert_eq!(transport.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_transport_timeout_is_transient() {
    let transport = ScriptedTransport::slow(Duration::from_secs(30));
    let store = Arc::new(MemoryRecordStore::new());
    let engine = DispatchEngine::new(
        store.clone(),
        transport,
        RetryPolicy::default(),
        Duration::from_secs(10),
    );

    let submission = engine
        .submit(request("user@example.com", None))
        .await
        .unwrap();
    assert_eq!(submission.record.status, DeliveryStatus::PendingRetry);
    assert!(
        submission
            .record
            .last_error
            .as_deref()
            .unwrap_or_default()
            .contains("timed out")
    );
}

// ============================================================
// Claims and recovery
// ============================================================

#[tokio::test]
async fn test_concurrent_schedulers_claim_once() {
    let transport = ScriptedTransport::scripted(vec![transient()], DeliveryOutcome::Success);
    let (engine, _store) = build(transport.clone(), instant_policy(5));

    let submission = engine
        .submit(request("user@example.com", None))
        .await
        .unwrap();
    assert_eq!(submission.record.status, DeliveryStatus::PendingRetry);

    let a = RetryScheduler::new(engine.clone(), &scheduler_config());
    let b = RetryScheduler::new(engine.clone(), &scheduler_config());
    let (ran_a, ran_b) = tokio::join!(a.run_once(), b.run_once());

    assert_eq!(ran_a.unwrap() + ran_b.unwrap(), 1);
    assert_eq!(transport.calls(), 2);
    let record = engine.status(submission.record.id).await.unwrap();
    assert_eq!(record.status, DeliveryStatus::Sent);
    assert_eq!(record.attempt_count, 2);
}

#[tokio::test]
async fn test_resume_loses_to_earlier_claim() {
    let transport = ScriptedTransport::always(DeliveryOutcome::Success);
    let (engine, store) = build(transport.clone(), instant_policy(5));

    let record = store
        .create(&request("user@example.com", None))
        .await
        .unwrap()
        .into_record();

    // Snapshot taken before another worker claims the record
    let snapshot = record.clone();
    store
        .claim(record.id, DeliveryStatus::Pending, 0)
        .await
        .unwrap()
        .expect("claim");

    assert!(engine.resume(&snapshot).await.unwrap().is_none());
    assert_eq!(transport.calls(), 0);
}

#[tokio::test]
async fn test_stale_sending_record_is_recovered() {
    let transport = ScriptedTransport::always(DeliveryOutcome::Success);
    let (engine, store) = build(transport.clone(), instant_policy(5));
    let scheduler = RetryScheduler::new(engine.clone(), &scheduler_config());

    let mut record = NotificationRecord::new(&request("user@example.com", None));
    record.status = DeliveryStatus::Sending;
    record.attempt_count = 1;
    record.last_attempt_at = Some(Utc::now() - chrono::Duration::minutes(10));
    store.put(record.clone());

    assert_eq!(scheduler.run_once().await.unwrap(), 1);

    let recovered = engine.status(record.id).await.unwrap();
    assert_eq!(recovered.status, DeliveryStatus::Sent);
    assert_eq!(recovered.attempt_count, 2);
    assert_eq!(transport.calls(), 1);
}

#[tokio::test]
async fn test_crash_on_last_attempt_exhausts_without_resend() {
    let transport = ScriptedTransport::always(transient());
    let (engine, store) = build(transport.clone(), instant_policy(5));
    let scheduler = RetryScheduler::new(engine.clone(), &scheduler_config());

    let mut record = NotificationRecord::new(&request("user@example.com", None));
    record.status = DeliveryStatus::Sending;
    record.attempt_count = 5;
    record.last_attempt_at = Some(Utc::now() - chrono::Duration::minutes(10));
    store.put(record.clone());

    assert_eq!(scheduler.run_once().await.unwrap(), 1);

    let finished = engine.status(record.id).await.unwrap();
    assert_eq!(finished.status, DeliveryStatus::FailedExhausted);
    assert_eq!(finished.attempt_count, 5);
    assert!(finished.last_error.is_some());
    assert_eq!(transport.calls(), 0);

    // Terminal: the next scan leaves it alone
    assert_eq!(scheduler.run_once().await.unwrap(), 0);
    assert_eq!(transport.calls(), 0);
}

#[tokio::test]
async fn test_lowered_attempt_limit_exhausts_pending_retry() {
    let transport = ScriptedTransport::always(DeliveryOutcome::Success);
    let (engine, store) = build(transport.clone(), instant_policy(2));
    let scheduler = RetryScheduler::new(engine.clone(), &scheduler_config());

    let mut record = NotificationRecord::new(&request("user@example.com", None));
    record.status = DeliveryStatus::PendingRetry;
    record.attempt_count = 3;
    record.last_error = Some("SMTP 421".to_string());
    record.next_attempt_at = Some(Utc::now());
    store.put(record.clone());

    assert_eq!(scheduler.run_once().await.unwrap(), 1);

    let finished = engine.status(record.id).await.unwrap();
    assert_eq!(finished.status, DeliveryStatus::FailedExhausted);
    assert_eq!(finished.attempt_count, 3);
    assert_eq!(finished.last_error.as_deref(), Some("SMTP 421"));
    assert!(finished.next_attempt_at.is_none());
    assert_eq!(transport.calls(), 0);
}

#[tokio::test]
async fn test_fresh_sending_record_is_not_touched() {
    let transport = ScriptedTransport::always(DeliveryOutcome::Success);
    let (engine, store) = build(transport.clone(), instant_policy(5));
    let scheduler = RetryScheduler::new(engine.clone(), &scheduler_config());

    let mut record = NotificationRecord::new(&request("user@example.com", None));
    record.status = DeliveryStatus::Sending;
    record.attempt_count = 1;
    record.last_attempt_at = Some(Utc::now());
    store.put(record);

    assert_eq!(scheduler.run_once().await.unwrap(), 0);
    assert_eq!(transport.calls(), 0);
}

#[tokio::test]
async fn test_abandoned_pending_record_is_recovered() {
    let transport = ScriptedTransport::always(DeliveryOutcome::Success);
    let (engine, store) = build(transport.clone(), instant_policy(5));
    let scheduler = RetryScheduler::new(engine.clone(), &scheduler_config());

    let mut record = NotificationRecord::new(&request("user@example.com", None));
    record.created_at = Utc::now() - chrono::Duration::minutes(5);
    store.put(record.clone());

    assert_eq!(scheduler.run_once().await.unwrap(), 1);
    assert_eq!(
        engine.status(record.id).await.unwrap().status,
        DeliveryStatus::Sent
    );
}

#[tokio::test]
async fn test_scheduler_stops_on_shutdown() {
    let transport = ScriptedTransport::always(DeliveryOutcome::Success);
    let (engine, _store) = build(transport, instant_policy(5));
    let scheduler = RetryScheduler::new(engine, &scheduler_config());

    let (tx, rx) = tokio::sync::watch::channel(false);
    let handle = tokio::spawn(async move { scheduler.run(rx).await });

    tokio::time::sleep(Duration::from_millis(30)).await;
    tx.send(true).unwrap();

    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("scheduler should stop")
        .unwrap();
}

// ============================================================
// Listing
// ============================================================

#[tokio::test]
async fn test_list_pages_by_status() {
    let transport = ScriptedTransport::always(transient());
    let (engine, _store) = build(transport, RetryPolicy::default());

    for _ in 0..3 {
        engine
            .submit(request("user@example.com", None))
            .await
            .unwrap();
    }

    let page = engine
        .list(DeliveryStatus::PendingRetry, 1, 1)
        .await
        .unwrap();
    assert_eq!(page.len(), 1);

    let all = engine
        .list(DeliveryStatus::PendingRetry, 0, 100)
        .await
        .unwrap();
    assert_eq!(all.len(), 3);
    assert!(all.windows(2).all(|w| w[0].created_at <= w[1].created_at));

    assert!(engine.list(DeliveryStatus::Sent, 0, 10).await.unwrap().is_empty());
    assert!(matches!(
        engine.list(DeliveryStatus::Sent, 0, 0).await,
        Err(AppError::Validation(_))
    ));
}
