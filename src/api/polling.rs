use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use super::error::ApiError;
use super::state::AppState;
use crate::scheduler::{Lease, SchedulerStats};

/// The HTTP surface only ever has one outstanding pause at a time (driven
/// by `/polling/pause` + `/polling/resume`, as distinct from the
/// Parameter Service's own internal pause/resume brackets). This cell
/// holds that lease between the two calls.
pub type PendingLease = Arc<Mutex<Option<Lease>>>;

pub async fn stats(State(state): State<Arc<AppState>>) -> Json<SchedulerStats> {
    Json(state.scheduler.stats().await)
}

pub async fn restart(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    state.scheduler.reload().await?;
    Ok(Json(json!({"ok": true})))
}

pub async fn pause(
    State(state): State<Arc<AppState>>,
    axum::extract::Extension(pending): axum::extract::Extension<PendingLease>,
) -> Result<Json<Value>, ApiError> {
    let lease = state.scheduler.pause().await?;
    *pending.lock().await = Some(lease);
    Ok(Json(json!({"ok": true})))
}

pub async fn resume(
    State(state): State<Arc<AppState>>,
    axum::extract::Extension(pending): axum::extract::Extension<PendingLease>,
) -> Json<Value> {
    if let Some(lease) = pending.lock().await.take() {
        state.scheduler.resume(lease).await;
    }
    Json(json!({"ok": true}))
}
