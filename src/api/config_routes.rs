use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use super::error::ApiError;
use super::state::AppState;
use crate::ports::PortInfo;

pub async fn com_ports() -> Json<Value> {
    let ports: Vec<PortInfo> = crate::ports::enumerate();
    Json(json!({ "ports": ports }))
}

#[derive(Debug, Deserialize)]
pub struct VerifyPinRequest {
    pub pin: String,
}

/// Constant-time equality so the PIN check doesn't leak timing information
/// about how many leading characters matched.
fn constant_time_eq(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

pub async fn verify_pin(
    State(state): State<Arc<AppState>>,
    Json(req): Json<VerifyPinRequest>,
) -> Json<Value> {
    let valid = constant_time_eq(&req.pin, &state.config.config_pin);
    Json(json!({ "valid": valid }))
}

pub async fn clear_settings(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    state.store.delete_all().await?;
    for device in state.registry.list(false).await? {
        state.registry.delete(device.id).await?;
    }
    Ok(Json(json!({"ok": true})))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_matches_equal_strings() {
        assert!(constant_time_eq("1234", "1234"));
    }

    #[test]
    fn constant_time_eq_rejects_mismatch() {
        assert!(!constant_time_eq("1234", "4321"));
        assert!(!constant_time_eq("123", "1234"));
    }
}
