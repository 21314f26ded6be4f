//! Intake validation, run before anything touches storage.

use courier_common::error::AppError;
use courier_common::types::NotificationRequest;

const MAX_IDEMPOTENCY_KEY_LEN: usize = 255;

/// Validate a notification request.
pub fn validate_request(request: &NotificationRequest) -> Result<(), AppError> {
    validate_recipient(&request.recipient)?;

    if request.subject.contains(['\r', '\n']) {
        return Err(AppError::Validation(
            "subject must not contain line breaks".to_string(),
        ));
    }

    if let Some(key) = &request.idempotency_key {
        if key.is_empty() || key.len() > MAX_IDEMPOTENCY_KEY_LEN {
            return Err(AppError::Validation(format!(
                "idempotency_key must be 1-{} bytes",
                MAX_IDEMPOTENCY_KEY_LEN
            )));
        }
    }

    Ok(())
}

/// Check that `recipient` looks like `local@domain`.
/// The relay still has the final word; its rejections become permanent failures.
pub fn validate_recipient(recipient: &str) -> Result<(), AppError> {
    let invalid = |reason: &str| -> Result<(), AppError> {
        Err(AppError::Validation(format!(
            "invalid recipient '{}': {}",
            recipient, reason
        )))
    };

    if recipient.is_empty() {
        return invalid("must not be empty");
    }
    if recipient.chars().any(char::is_whitespace) {
        return invalid("must not contain whitespace");
    }

    let Some((local, domain)) = recipient.split_once('@') else {
        return invalid("missing '@'");
    };
    if local.is_empty() {
        return invalid("missing local part");
    }
    if domain.contains('@') {
        return invalid("more than one '@'");
    }
    if domain.is_empty() || domain.starts_with('.') || domain.ends_with('.') {
        return invalid("missing domain");
    }

    Ok(())
}
