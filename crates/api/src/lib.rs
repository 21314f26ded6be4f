//! Intake API for the courier notification service.
//!
//! Endpoints:
//! - POST /notifications — submit a notification (first delivery attempt is synchronous)
//! - GET  /notifications/{id} — current record for a notification
//! - GET  /notifications?status=..&skip=..&limit=.. — page through records by status
//! - GET  /health — liveness probe

pub mod routes;
pub mod state;
