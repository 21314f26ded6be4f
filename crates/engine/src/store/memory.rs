//! In-process record store.
//!
//! Same contract as the Postgres store, held in a single mutex-guarded map.
//! State is lost on restart.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use parking_lot::Mutex;
use uuid::Uuid;

use courier_common::error::AppError;
use courier_common::types::{DeliveryStatus, NotificationRecord, NotificationRequest};

use super::{CreateOutcome, RecordStore, StatusUpdate};

#[derive(Default)]
struct Inner {
    records: HashMap<Uuid, NotificationRecord>,
    by_key: HashMap<String, Uuid>,
}

/// Mutex-guarded in-memory [`RecordStore`].
#[derive(Default)]
pub struct MemoryRecordStore {
    inner: Mutex<Inner>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replace a record wholesale. Lets tests stage states such as a stale
    /// `sending` record.
    pub fn put(&self, record: NotificationRecord) {
        let mut inner = self.inner.lock();
        if let Some(key) = &record.idempotency_key {
            inner.by_key.insert(key.clone(), record.id);
        }
        inner.records.insert(record.id, record);
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn create(&self, request: &NotificationRequest) -> Result<CreateOutcome, AppError> {
        let mut inner = self.inner.lock();

        if let Some(key) = &request.idempotency_key {
            if let Some(existing) = inner.by_key.get(key).and_then(|id| inner.records.get(id)) {
                return Ok(CreateOutcome::Duplicate(existing.clone()));
            }
        }

        let record = NotificationRecord::new(request);
        if let Some(key) = &record.idempotency_key {
            inner.by_key.insert(key.clone(), record.id);
        }
        inner.records.insert(record.id, record.clone());

        Ok(CreateOutcome::Created(record))
    }

    async fn get(&self, id: Uuid) -> Result<NotificationRecord, AppError> {
        self.inner
            .lock()
            .records
            .get(&id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("Notification {} not found", id)))
    }

    async fn claim(
        &self,
        id: Uuid,
        expected_status: DeliveryStatus,
        expected_attempts: i32,
    ) -> Result<Option<NotificationRecord>, AppError> {
        let mut inner = self.inner.lock();
        let Some(record) = inner.records.get_mut(&id) else {
            return Ok(None);
        };

        if record.status != expected_status || record.attempt_count != expected_attempts {
            return Ok(None);
        }

        record.status = DeliveryStatus::Sending;
        record.attempt_count += 1;
        record.last_attempt_at = Some(Utc::now());
        record.next_attempt_at = None;

        Ok(Some(record.clone()))
    }

    async fn exhaust(
        &self,
        id: Uuid,
        expected_status: DeliveryStatus,
        expected_attempts: i32,
        reason: &str,
    ) -> Result<Option<NotificationRecord>, AppError> {
        let mut inner = self.inner.lock();
        let Some(record) = inner.records.get_mut(&id) else {
            return Ok(None);
        };

        if record.status != expected_status || record.attempt_count != expected_attempts {
            return Ok(None);
        }

        record.status = DeliveryStatus::FailedExhausted;
        record.last_error = Some(reason.to_string());
        record.next_attempt_at = None;

        Ok(Some(record.clone()))
    }

    async fn update_status(&self, id: Uuid, update: &StatusUpdate) -> Result<bool, AppError> {
        let mut inner = self.inner.lock();
        let Some(record) = inner.records.get_mut(&id) else {
            return Ok(false);
        };

        if record.status != DeliveryStatus::Sending || record.attempt_count != update.attempt_count
        {
            return Ok(false);
        }

        record.status = update.status;
        record.last_error = update.last_error.clone();
        record.last_attempt_at = Some(update.last_attempt_at);
        record.next_attempt_at = update.next_attempt_at;

        Ok(true)
    }

    fn list_by_status(
        &self,
        status: DeliveryStatus,
    ) -> BoxStream<'_, Result<NotificationRecord, AppError>> {
        let mut matching: Vec<NotificationRecord> = self
            .inner
            .lock()
            .records
            .values()
            .filter(|record| record.status == status)
            .cloned()
            .collect();
        matching.sort_by_key(|record| record.created_at);

        stream::iter(matching.into_iter().map(Ok)).boxed()
    }
}
