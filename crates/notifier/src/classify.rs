//! Mapping of SMTP failures onto transient / permanent outcomes.
//!
//! Reply codes follow RFC 5321: `4yz` is a transient negative completion,
//! `5yz` permanent. Only permanent replies that concern the message or its
//! recipient (syntax `50z`, mailbox `55z`) are treated as permanent here.
//! Other `5yz` replies, such as `530`/`535` authentication problems, are
//! relay-side faults that an operator can fix, so they stay retryable.

use lettre::transport::smtp;

use crate::DeliveryOutcome;

/// Classify a numeric SMTP reply code.
pub fn classify_reply_code(code: u16, detail: &str) -> DeliveryOutcome {
    let reason = if detail.is_empty() {
        format!("SMTP {}", code)
    } else {
        format!("SMTP {}: {}", code, detail)
    };

    match (code / 100, (code / 10) % 10) {
        (2, _) => DeliveryOutcome::Success,
        (5, 0) | (5, 5) => DeliveryOutcome::PermanentFailure(reason),
        _ => DeliveryOutcome::TransientFailure(reason),
    }
}

/// Classify an error returned by the lettre SMTP transport.
///
/// Errors without a reply code (connection refused, TLS, I/O) are transient.
pub fn classify_smtp_error(err: &smtp::Error) -> DeliveryOutcome {
    if err.is_timeout() {
        return DeliveryOutcome::TransientFailure(format!("relay timed out: {}", err));
    }

    match err.status() {
        Some(code) => match code.to_string().parse::<u16>() {
            Ok(numeric) => classify_reply_code(numeric, &err.to_string()),
            Err(_) => DeliveryOutcome::TransientFailure(err.to_string()),
        },
        None => DeliveryOutcome::TransientFailure(err.to_string()),
    }
}
