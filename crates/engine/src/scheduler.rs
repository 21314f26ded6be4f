//! Background retry scheduler.
//!
//! Polls the record store at a fixed interval and re-drives due records
//! through the dispatch engine:
//! - `pending_retry` records whose `next_attempt_at` has passed
//! - `pending` records older than `stale_after` (intake died before its first attempt)
//! - `sending` records whose last attempt started more than `stale_after` ago
//!   (worker died mid-attempt; the resend makes delivery at-least-once)
//!
//! Records are processed concurrently up to `workers`. Several scheduler
//! instances may run against one database: the engine claims each record
//! atomically before sending, and losers skip it.

use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::{StreamExt, future, stream};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use courier_common::config::DispatchConfig;
use courier_common::error::AppError;
use courier_common::types::{DeliveryStatus, NotificationRecord};

use crate::dispatch::DispatchEngine;

pub struct RetryScheduler {
    engine: DispatchEngine,
    poll_interval: Duration,
    workers: usize,
    batch_size: usize,
    stale_after: Duration,
}

impl RetryScheduler {
    pub fn new(engine: DispatchEngine, config: &DispatchConfig) -> Self {
        Self {
            engine,
            poll_interval: config.poll_interval,
            workers: config.workers.max(1),
            batch_size: config.batch_size.max(1),
            stale_after: config.stale_after,
        }
    }

    /// Run until `shutdown` flips to `true` or its sender is dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            workers = self.workers,
            "Retry scheduler started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.run_once().await {
                        Ok(0) => {}
                        Ok(processed) => tracing::debug!(processed, "Retry scan complete"),
                        Err(e) => tracing::error!(error = %e, "Retry scan failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Retry scheduler stopped");
    }

    /// One scan. Returns how many records this scheduler claimed and attempted.
    pub async fn run_once(&self) -> Result<usize, AppError> {
        let now = Utc::now();
        let stale_cutoff = self.stale_cutoff(now)?;

        let store = self.engine.store();
        let mut due = store
            .list_due(DeliveryStatus::PendingRetry, now, self.batch_size)
            .await?;
        due.extend(
            store
                .list_due(DeliveryStatus::Pending, stale_cutoff, self.batch_size)
                .await?,
        );
        due.extend(
            store
                .list_due(DeliveryStatus::Sending, stale_cutoff, self.batch_size)
                .await?,
        );

        if due.is_empty() {
            return Ok(0);
        }

        let processed = stream::iter(due)
            .map(|record| async move { self.process(record).await })
            .buffer_unordered(self.workers)
            .filter(|attempted| future::ready(*attempted))
            .count()
            .await;

        Ok(processed)
    }

    async fn process(&self, record: NotificationRecord) -> bool {
        if record.status != DeliveryStatus::PendingRetry {
            tracing::warn!(
                notification_id = %record.id,
                status = %record.status,
                "Recovering abandoned notification"
            );
        }

        match self.engine.resume(&record).await {
            Ok(Some(_)) => true,
            Ok(None) => false,
            Err(e) => {
                tracing::error!(
                    notification_id = %record.id,
                    error = %e,
                    "Retry attempt failed"
                );
                false
            }
        }
    }

    fn stale_cutoff(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, AppError> {
        chrono::Duration::from_std(self.stale_after)
            .ok()
            .and_then(|age| now.checked_sub_signed(age))
            .ok_or_else(|| AppError::Config("stale_after is out of range".to_string()))
    }
}
