//! Shared application state for the Axum API server.

use courier_engine::DispatchEngine;

/// Application state shared across all route handlers via Axum `State`.
#[derive(Clone)]
pub struct AppState {
    pub engine: DispatchEngine,
}

impl AppState {
    pub fn new(engine: DispatchEngine) -> Self {
        Self { engine }
    }
}
