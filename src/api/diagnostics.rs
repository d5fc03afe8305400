use std::sync::Arc;

use axum::extract::State;
use axum::Json;

use super::state::AppState;
use crate::logging::LogEntry;

/// Recent in-memory activity log, independent of whatever `RUST_LOG`
/// sends to stderr — a small operational surface for "what has this
/// process been doing" without shipping a separate log aggregator.
pub async fn logs(State(state): State<Arc<AppState>>) -> Json<Vec<LogEntry>> {
    Json(state.log_buffer.snapshot())
}
