//! PostgreSQL-backed record store.
//!
//! All records live in the `notifications` table (see `migrations/`). The
//! idempotency key has a partial unique index, so concurrent submissions with
//! the same key race safely inside the database.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use sqlx::PgPool;
use uuid::Uuid;

use courier_common::error::AppError;
use courier_common::types::{DeliveryStatus, NotificationRecord, NotificationRequest};

use super::{CreateOutcome, RecordStore, StatusUpdate};

/// [`RecordStore`] over a sqlx Postgres pool.
#[derive(Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn find_by_key(&self, key: &str) -> Result<Option<NotificationRecord>, AppError> {
        let record: Option<NotificationRecord> =
            sqlx::query_as("SELECT * FROM notifications WHERE idempotency_key = $1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(record)
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn create(&self, request: &NotificationRequest) -> Result<CreateOutcome, AppError> {
        let record = NotificationRecord::new(request);

        let inserted: Option<NotificationRecord> = sqlx::query_as(
            r#"
            INSERT INTO notifications (id, recipient, subject, body, status, attempt_count, created_at, idempotency_key)
            VALUES ($1, $2, $3, $4, $5, 0, $6, $7)
            ON CONFLICT (idempotency_key) WHERE idempotency_key IS NOT NULL DO NOTHING
            RETURNING *
            "#,
        )
        .bind(record.id)
        .bind(&record.recipient)
        .bind(&record.subject)
        .bind(&record.body)
        .bind(record.status.to_string())
        .bind(record.created_at)
        .bind(&record.idempotency_key)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(created) = inserted {
            return Ok(CreateOutcome::Created(created));
        }

        // Conflict: only possible when a key was supplied
        let key = record.idempotency_key.as_deref().ok_or_else(|| {
            AppError::Internal("Insert without idempotency key returned no row".to_string())
        })?;
        let existing = self.find_by_key(key).await?.ok_or_else(|| {
            AppError::Internal(format!("Idempotency key '{}' conflicted but no record found", key))
        })?;

        tracing::debug!(
            notification_id = %existing.id,
            idempotency_key = key,
            "Idempotency key already used, returning existing record"
        );
        Ok(CreateOutcome::Duplicate(existing))
    }

    async fn get(&self, id: Uuid) -> Result<NotificationRecord, AppError> {
        let record: NotificationRecord = sqlx::query_as("SELECT * FROM notifications WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Notification {} not found", id)))?;

        Ok(record)
    }

    async fn claim(
        &self,
        id: Uuid,
        expected_status: DeliveryStatus,
        expected_attempts: i32,
    ) -> Result<Option<NotificationRecord>, AppError> {
        let claimed: Option<NotificationRecord> = sqlx::query_as(
            r#"
            UPDATE notifications
            SET status = $1,
                attempt_count = attempt_count + 1,
                last_attempt_at = $2,
                next_attempt_at = NULL
            WHERE id = $3 AND status = $4 AND attempt_count = $5
            RETURNING *
            "#,
        )
        .bind(DeliveryStatus::Sending.to_string())
        .bind(Utc::now())
        .bind(id)
        .bind(expected_status.to_string())
        .bind(expected_attempts)
        .fetch_optional(&self.pool)
        .await?;

        Ok(claimed)
    }

    async fn exhaust(
        &self,
        id: Uuid,
        expected_status: DeliveryStatus,
        expected_attempts: i32,
        reason: &str,
    ) -> Result<Option<NotificationRecord>, AppError> {
        let exhausted: Option<NotificationRecord> = sqlx::query_as(
            r#"
            UPDATE notifications
            SET status = $1, last_error = $2, next_attempt_at = NULL
            WHERE id = $3 AND status = $4 AND attempt_count = $5
            RETURNING *
            "#,
        )
        .bind(DeliveryStatus::FailedExhausted.to_string())
        .bind(reason)
        .bind(id)
        .bind(expected_status.to_string())
        .bind(expected_attempts)
        .fetch_optional(&self.pool)
        .await?;

        Ok(exhausted)
    }

    async fn update_status(&self, id: Uuid, update: &StatusUpdate) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE notifications
            SET status = $1, last_error = $2, last_attempt_at = $3, next_attempt_at = $4
            WHERE id = $5 AND status = $6 AND attempt_count = $7
            "#,
        )
        .bind(update.status.to_string())
        .bind(&update.last_error)
        .bind(update.last_attempt_at)
        .bind(update.next_attempt_at)
        .bind(id)
        .bind(DeliveryStatus::Sending.to_string())
        .bind(update.attempt_count)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    fn list_by_status(
        &self,
        status: DeliveryStatus,
    ) -> BoxStream<'_, Result<NotificationRecord, AppError>> {
        sqlx::query_as::<_, NotificationRecord>(
            "SELECT * FROM notifications WHERE status = $1 ORDER BY created_at, id",
        )
        .bind(status.to_string())
        .fetch(&self.pool)
        .map_err(AppError::from)
        .boxed()
    }

    async fn list_due(
        &self,
        status: DeliveryStatus,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<NotificationRecord>, AppError> {
        let column = match status {
            DeliveryStatus::PendingRetry => "next_attempt_at",
            DeliveryStatus::Sending => "last_attempt_at",
            DeliveryStatus::Pending => "created_at",
            _ => return Ok(Vec::new()),
        };

        let query = format!(
            "SELECT * FROM notifications \
             WHERE status = $1 AND ({column} IS NULL OR {column} <= $2) \
             ORDER BY created_at, id LIMIT $3"
        );
        let records: Vec<NotificationRecord> = sqlx::query_as(&query)
            .bind(status.to_string())
            .bind(cutoff)
            .bind(to_sql_count(limit))
            .fetch_all(&self.pool)
            .await?;

        Ok(records)
    }

    async fn list_page(
        &self,
        status: DeliveryStatus,
        skip: usize,
        limit: usize,
    ) -> Result<Vec<NotificationRecord>, AppError> {
        let records: Vec<NotificationRecord> = sqlx::query_as(
            "SELECT * FROM notifications WHERE status = $1 ORDER BY created_at, id OFFSET $2 LIMIT $3",
        )
        .bind(status.to_string())
        .bind(to_sql_count(skip))
        .bind(to_sql_count(limit))
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }
}

/// Postgres `OFFSET`/`LIMIT` take a BIGINT.
fn to_sql_count(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}
