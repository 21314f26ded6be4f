//! Record store, the source of truth for notification records.
//!
//! The dispatch engine only talks to storage through [`RecordStore`]. Two
//! implementations ship with the crate: [`PgRecordStore`] for production and
//! [`MemoryRecordStore`] for tests and database-less runs.

mod memory;
mod postgres;

pub use memory::MemoryRecordStore;
pub use postgres::PgRecordStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt, future};
use uuid::Uuid;

use courier_common::error::AppError;
use courier_common::types::{DeliveryStatus, NotificationRecord, NotificationRequest};

/// Result of [`RecordStore::create`].
#[derive(Debug, Clone, PartialEq)]
pub enum CreateOutcome {
    /// A new `pending` record was inserted.
    Created(NotificationRecord),
    /// The idempotency key was already taken; the existing record, unchanged.
    Duplicate(NotificationRecord),
}

impl CreateOutcome {
    pub fn record(&self) -> &NotificationRecord {
        match self {
            CreateOutcome::Created(record) | CreateOutcome::Duplicate(record) => record,
        }
    }

    pub fn into_record(self) -> NotificationRecord {
        match self {
            CreateOutcome::Created(record) | CreateOutcome::Duplicate(record) => record,
        }
    }
}

/// Outcome of a delivery attempt, written by the attempt's owner.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub status: DeliveryStatus,
    /// Attempt number the writer claimed; must match the stored value
    pub attempt_count: i32,
    pub last_error: Option<String>,
    pub last_attempt_at: DateTime<Utc>,
    pub next_attempt_at: Option<DateTime<Utc>>,
}

/// Durable mapping from notification id to record.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert a `pending` record for `request`, or return the record already
    /// holding its idempotency key.
    async fn create(&self, request: &NotificationRequest) -> Result<CreateOutcome, AppError>;

    /// Fetch a record by id.
    async fn get(&self, id: Uuid) -> Result<NotificationRecord, AppError>;

    /// Atomically move `id` to `sending`, bumping `attempt_count` and stamping
    /// `last_attempt_at`.
    ///
    /// Succeeds only if the record is still in `expected_status` with
    /// `expected_attempts` attempts. Returns `None` when someone else got there
    /// first, which makes this the claim that gives a worker exclusive
    /// ownership of one attempt.
    async fn claim(
        &self,
        id: Uuid,
        expected_status: DeliveryStatus,
        expected_attempts: i32,
    ) -> Result<Option<NotificationRecord>, AppError>;

    /// Move a record that has used all its attempts to `failed_exhausted`.
    ///
    /// Same compare-and-set as [`claim`](RecordStore::claim), but
    /// `attempt_count` is left alone and nothing is sent. Returns `None` when
    /// the record has moved on.
    async fn exhaust(
        &self,
        id: Uuid,
        expected_status: DeliveryStatus,
        expected_attempts: i32,
        reason: &str,
    ) -> Result<Option<NotificationRecord>, AppError>;

    /// Write the outcome of an attempt.
    ///
    /// Applied only while the record is `sending` with
    /// `update.attempt_count` attempts, i.e. only by the current claim holder.
    /// Returns whether the update was applied; `false` for an unknown id.
    async fn update_status(&self, id: Uuid, update: &StatusUpdate) -> Result<bool, AppError>;

    /// Lazily stream every record in `status`, oldest first.
    fn list_by_status(
        &self,
        status: DeliveryStatus,
    ) -> BoxStream<'_, Result<NotificationRecord, AppError>>;

    /// Up to `limit` records in `status` that are due at `cutoff`, oldest first.
    ///
    /// See [`is_due`] for which timestamp counts.
    async fn list_due(
        &self,
        status: DeliveryStatus,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<NotificationRecord>, AppError> {
        self.list_by_status(status)
            .try_filter(move |record| future::ready(is_due(record, cutoff)))
            .take(limit)
            .try_collect()
            .await
    }

    /// One page of [`list_by_status`](RecordStore::list_by_status).
    async fn list_page(
        &self,
        status: DeliveryStatus,
        skip: usize,
        limit: usize,
    ) -> Result<Vec<NotificationRecord>, AppError> {
        self.list_by_status(status)
            .skip(skip)
            .take(limit)
            .try_collect()
            .await
    }
}

/// Whether the scheduler should pick `record` up at `cutoff`.
///
/// `pending_retry` is due by `next_attempt_at`, `sending` by `last_attempt_at`
/// and `pending` by `created_at`. A missing timestamp counts as due. Records
/// in any other status are never due.
pub fn is_due(record: &NotificationRecord, cutoff: DateTime<Utc>) -> bool {
    match record.status {
        DeliveryStatus::PendingRetry => record.next_attempt_at.is_none_or(|at| at <= cutoff),
        DeliveryStatus::Sending => record.last_attempt_at.is_none_or(|at| at <= cutoff),
        DeliveryStatus::Pending => record.created_at <= cutoff,
        _ => false,
    }
}
