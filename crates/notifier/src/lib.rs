//! Outbound delivery transports.
//!
//! A [`Transport`] sends one rendered email and reports how the attempt went
//! as a [`DeliveryOutcome`]. Transports never retry on their own; the
//! dispatch engine decides what a failure means for the notification.

pub mod classify;
pub mod smtp;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use smtp::SmtpTransport;

/// A single rendered email ready for delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingEmail {
    /// Notification id, reused as the `Message-ID` so receivers can drop resends
    pub notification_id: Uuid,
    pub recipient: String,
    pub subject: String,
    pub body: String,
}

/// Result of a single transport invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Success,
    /// Expected to succeed if retried later (network, timeout, 4yz replies)
    TransientFailure(String),
    /// Retrying will not help (malformed or rejected recipient)
    PermanentFailure(String),
}

/// Capability to deliver one message to one recipient.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Attempt delivery once, classifying any failure.
    async fn send(&self, email: &OutgoingEmail) -> DeliveryOutcome;
}
