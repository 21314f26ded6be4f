//! Notification intake and status routes.
//!
//! Handlers only translate between HTTP and the dispatch engine; extractor
//! rejections are folded into `AppError` so every error body has the same shape.

use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use uuid::Uuid;

use courier_common::error::AppError;
use courier_common::types::{DeliveryStatus, NotificationRecord, NotificationRequest};
use courier_engine::Submission;

use crate::state::AppState;

const DEFAULT_PAGE_SIZE: usize = 20;

pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/notifications",
            get(list_notifications).post(submit_notification),
        )
        .route("/notifications/{id}", get(get_notification))
}

/// Query parameters for listing notifications.
#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub status: DeliveryStatus,
    pub skip: Option<usize>,
    pub limit: Option<usize>,
}

/// POST /notifications — Accept a notification and attempt delivery once.
///
/// Returns 201 for a new notification, 200 when the idempotency key matched
/// an earlier one.
async fn submit_notification(
    State(state): State<AppState>,
    payload: Result<Json<NotificationRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Submission>), AppError> {
    let Json(request) = payload.map_err(|e| AppError::Validation(e.body_text()))?;

    let submission = state.engine.submit(request).await?;
    let status = if submission.replayed {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };

    Ok((status, Json(submission)))
}

/// GET /notifications/{id} — Current state of one notification.
async fn get_notification(
    State(state): State<AppState>,
    id: Result<Path<Uuid>, PathRejection>,
) -> Result<Json<NotificationRecord>, AppError> {
    let Path(id) = id.map_err(|e| AppError::Validation(e.body_text()))?;
    let record = state.engine.status(id).await?;
    Ok(Json(record))
}

/// GET /notifications?status=..&skip=..&limit=.. — Page through notifications by status.
async fn list_notifications(
    State(state): State<AppState>,
    params: Result<Query<ListParams>, QueryRejection>,
) -> Result<Json<Vec<NotificationRecord>>, AppError> {
    let Query(params) = params.map_err(|e| AppError::Validation(e.body_text()))?;

    let records = state
        .engine
        .list(
            params.status,
            params.skip.unwrap_or(0),
            params.limit.unwrap_or(DEFAULT_PAGE_SIZE),
        )
        .await?;

    Ok(Json(records))
}
