use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Notification delivery status.
///
/// `Sent`, `FailedPermanent` and `FailedExhausted` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Created, no attempt started yet
    Pending,
    /// An attempt is in flight; only the claim holder may write the next transition
    Sending,
    Sent,
    /// The relay rejected the message for a reason retrying cannot fix
    FailedPermanent,
    /// Transient failure, waiting for `next_attempt_at`
    PendingRetry,
    /// Transient failures used up every allowed attempt
    FailedExhausted,
}

impl DeliveryStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DeliveryStatus::Sent | DeliveryStatus::FailedPermanent | DeliveryStatus::FailedExhausted
        )
    }
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryStatus::Pending => write!(f, "pending"),
            DeliveryStatus::Sending => write!(f, "sending"),
            DeliveryStatus::Sent => write!(f, "sent"),
            DeliveryStatus::FailedPermanent => write!(f, "failed_permanent"),
            DeliveryStatus::PendingRetry => write!(f, "pending_retry"),
            DeliveryStatus::FailedExhausted => write!(f, "failed_exhausted"),
        }
    }
}

impl std::str::FromStr for DeliveryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DeliveryStatus::Pending),
            "sending" => Ok(DeliveryStatus::Sending),
            "sent" => Ok(DeliveryStatus::Sent),
            "failed_permanent" => Ok(DeliveryStatus::FailedPermanent),
            "pending_retry" => Ok(DeliveryStatus::PendingRetry),
            "failed_exhausted" => Ok(DeliveryStatus::FailedExhausted),
            other => Err(format!("unknown delivery status '{}'", other)),
        }
    }
}

/// A notification request as submitted by a caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRequest {
    pub recipient: String,
    pub subject: String,
    pub body: String,
    /// Caller-supplied token; repeated submissions with the same key return the first record
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

/// A persisted notification and its delivery state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct NotificationRecord {
    pub id: Uuid,
    pub recipient: String,
    pub subject: String,
    pub body: String,
    pub status: DeliveryStatus,
    /// Number of delivery attempts started so far
    pub attempt_count: i32,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// When a `pending_retry` record becomes due
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub idempotency_key: Option<String>,
}

impl NotificationRecord {
    /// Build a fresh `pending` record for an accepted request.
    pub fn new(request: &NotificationRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            recipient: request.recipient.clone(),
            subject: request.subject.clone(),
            body: request.body.clone(),
            status: DeliveryStatus::Pending,
            attempt_count: 0,
            created_at: Utc::now(),
            last_attempt_at: None,
            next_attempt_at: None,
            last_error: None,
            idempotency_key: request.idempotency_key.clone(),
        }
    }
}
