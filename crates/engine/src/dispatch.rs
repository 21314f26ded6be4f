//! Dispatch engine: the notification delivery state machine.
//!
//! ```text
//! pending ──► sending ──► sent
//!                │   ├──► failed_permanent
//!                │   └──► pending_retry ──► sending ...
//!                └──────► failed_exhausted   (transient failure on the last attempt)
//! ```
//!
//! Every attempt starts with an atomic claim in the record store. Only the
//! claim holder may write the outcome, so the synchronous first attempt and
//! the retry scheduler can never both drive the same record.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use courier_common::error::AppError;
use courier_common::types::{DeliveryStatus, NotificationRecord, NotificationRequest};
use courier_notifier::{DeliveryOutcome, OutgoingEmail, Transport};

use crate::backoff::RetryPolicy;
use crate::store::{CreateOutcome, RecordStore, StatusUpdate};
use crate::validate::validate_request;

/// Largest page `list` will return.
pub const MAX_PAGE_SIZE: usize = 100;

/// Result of `submit`.
#[derive(Debug, Clone, Serialize)]
pub struct Submission {
    #[serde(flatten)]
    pub record: NotificationRecord,
    /// True when the idempotency key matched an earlier submission
    pub replayed: bool,
}

/// Orchestrates intake, delivery attempts, and status transitions.
///
/// Cheap to clone; all state lives in the record store.
#[derive(Clone)]
pub struct DispatchEngine {
    store: Arc<dyn RecordStore>,
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
    transport_timeout: Duration,
}

impl DispatchEngine {
    pub fn new(
        store: Arc<dyn RecordStore>,
        transport: Arc<dyn Transport>,
        policy: RetryPolicy,
        transport_timeout: Duration,
    ) -> Self {
        Self {
            store,
            transport,
            policy,
            transport_timeout,
        }
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Accept a notification and make the first delivery attempt.
    ///
    /// Validation happens before any storage access. Returns once the first
    /// attempt has an outcome; retries happen later in the scheduler.
    pub async fn submit(&self, request: NotificationRequest) -> Result<Submission, AppError> {
        validate_request(&request)?;

        let record = match self.store.create(&request).await? {
            CreateOutcome::Created(record) => record,
            CreateOutcome::Duplicate(existing) => {
                tracing::info!(
                    notification_id = %existing.id,
                    status = %existing.status,
                    "Idempotent replay, skipping delivery"
                );
                return Ok(Submission {
                    record: existing,
                    replayed: true,
                });
            }
        };

        tracing::info!(
            notification_id = %record.id,
            recipient = %record.recipient,
            "Notification accepted"
        );

        // The attempt runs on its own task: if the caller goes away, the
        // outcome is still written.
        let engine = self.clone();
        let id = record.id;
        let attempted = tokio::spawn(async move {
            engine.attempt(id, DeliveryStatus::Pending, 0).await
        })
        .await
        .map_err(|e| AppError::Internal(format!("Delivery task failed: {}", e)))??;

        let record = match attempted {
            Some(record) => record,
            None => self.store.get(id).await?,
        };

        Ok(Submission {
            record,
            replayed: false,
        })
    }

    /// Current state of a notification.
    pub async fn status(&self, id: Uuid) -> Result<NotificationRecord, AppError> {
        self.store.get(id).await
    }

    /// Page through the notifications in `status`, oldest first.
    pub async fn list(
        &self,
        status: DeliveryStatus,
        skip: usize,
        limit: usize,
    ) -> Result<Vec<NotificationRecord>, AppError> {
        if limit == 0 || limit > MAX_PAGE_SIZE {
            return Err(AppError::Validation(format!(
                "limit must be between 1 and {}",
                MAX_PAGE_SIZE
            )));
        }

        self.store.list_page(status, skip, limit).await
    }

    /// Claim and deliver a record picked up by the scheduler.
    ///
    /// A record that already used all its attempts (its worker died during the
    /// last one, or `max_attempts` was lowered) is moved to `failed_exhausted`
    /// without another send. Returns `None` if another worker got to it first.
    pub async fn resume(
        &self,
        record: &NotificationRecord,
    ) -> Result<Option<NotificationRecord>, AppError> {
        if !self.policy.can_retry(record.attempt_count) {
            return self.exhaust(record).await;
        }

        self.attempt(record.id, record.status, record.attempt_count)
            .await
    }

    async fn exhaust(
        &self,
        record: &NotificationRecord,
    ) -> Result<Option<NotificationRecord>, AppError> {
        let reason = match (record.status, &record.last_error) {
            (DeliveryStatus::Sending, _) => format!(
                "attempt {} of {} abandoned without an outcome",
                record.attempt_count, self.policy.max_attempts
            ),
            (_, Some(last_error)) => last_error.clone(),
            (_, None) => format!("retry limit of {} attempts reached", self.policy.max_attempts),
        };

        let exhausted = self
            .store
            .exhaust(record.id, record.status, record.attempt_count, &reason)
            .await?;

        match &exhausted {
            Some(_) => tracing::warn!(
                notification_id = %record.id,
                attempt = record.attempt_count,
                error = %reason,
                "Attempts used up, notification exhausted"
            ),
            None => {
                tracing::debug!(notification_id = %record.id, "Record already claimed elsewhere")
            }
        }

        Ok(exhausted)
    }

    /// One delivery attempt: claim, send, write the outcome.
    async fn attempt(
        &self,
        id: Uuid,
        expected_status: DeliveryStatus,
        expected_attempts: i32,
    ) -> Result<Option<NotificationRecord>, AppError> {
        let Some(claimed) = self
            .store
            .claim(id, expected_status, expected_attempts)
            .await?
        else {
            tracing::debug!(notification_id = %id, "Record already claimed elsewhere");
            return Ok(None);
        };

        let outcome = self.send(&claimed).await;
        let update = plan_transition(&self.policy, claimed.attempt_count, &outcome, Utc::now());

        if !self.store.update_status(id, &update).await? {
            // A stale-claim recovery took the record over while we were sending
            tracing::warn!(
                notification_id = %id,
                attempt = claimed.attempt_count,
                "Lost claim before recording outcome"
            );
            return Ok(Some(self.store.get(id).await?));
        }

        log_transition(id, &update);

        Ok(Some(NotificationRecord {
            status: update.status,
            last_error: update.last_error,
            last_attempt_at: Some(update.last_attempt_at),
            next_attempt_at: update.next_attempt_at,
            ..claimed
        }))
    }

    async fn send(&self, record: &NotificationRecord) -> DeliveryOutcome {
        let email = OutgoingEmail {
            notification_id: record.id,
            recipient: record.recipient.clone(),
            subject: record.subject.clone(),
            body: record.body.clone(),
        };

        match tokio::time::timeout(self.transport_timeout, self.transport.send(&email)).await {
            Ok(outcome) => outcome,
            Err(_) => DeliveryOutcome::TransientFailure(format!(
                "transport timed out after {}ms",
                self.transport_timeout.as_millis()
            )),
        }
    }
}

/// Decide the next state after attempt number `attempt_count` produced `outcome`.
pub fn plan_transition(
    policy: &RetryPolicy,
    attempt_count: i32,
    outcome: &DeliveryOutcome,
    now: DateTime<Utc>,
) -> StatusUpdate {
    let (status, last_error, next_attempt_at) = match outcome {
        DeliveryOutcome::Success => (DeliveryStatus::Sent, None, None),
        DeliveryOutcome::PermanentFailure(reason) => {
            (DeliveryStatus::FailedPermanent, Some(reason.clone()), None)
        }
        DeliveryOutcome::TransientFailure(reason) if policy.can_retry(attempt_count) => {
            let delay = policy.delay_for(attempt_count);
            let due = chrono::Duration::from_std(delay)
                .ok()
                .and_then(|delay| now.checked_add_signed(delay))
                .unwrap_or(now);
            (DeliveryStatus::PendingRetry, Some(reason.clone()), Some(due))
        }
        DeliveryOutcome::TransientFailure(reason) => {
            (DeliveryStatus::FailedExhausted, Some(reason.clone()), None)
        }
    };

    StatusUpdate {
        status,
        attempt_count,
        last_error,
        last_attempt_at: now,
        next_attempt_at,
    }
}

fn log_transition(id: Uuid, update: &StatusUpdate) {
    match update.status {
        DeliveryStatus::Sent => tracing::info!(
            notification_id = %id,
            attempt = update.attempt_count,
            "Notification sent"
        ),
        DeliveryStatus::PendingRetry => tracing::warn!(
            notification_id = %id,
            attempt = update.attempt_count,
            next_attempt_at = ?update.next_attempt_at,
            error = update.last_error.as_deref().unwrap_or_default(),
            "Delivery failed, retry scheduled"
        ),
        status => tracing::warn!(
            notification_id = %id,
            attempt = update.attempt_count,
            status = %status,
            error = update.last_error.as_deref().unwrap_or_default(),
            "Delivery failed permanently"
        ),
    }
}
