use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;

use super::error::ApiError;
use super::state::AppState;
use crate::registry::{Device, DeviceDto};

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub enabled_only: bool,
}

pub async fn list(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Device>>, ApiError> {
    Ok(Json(state.registry.list(query.enabled_only).await?))
}

pub async fn create(
    State(state): State<Arc<AppState>>,
    Json(dto): Json<DeviceDto>,
) -> Result<Json<Device>, ApiError> {
    Ok(Json(state.registry.create(dto).await?))
}

pub async fn get(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<Device>, ApiError> {
    Ok(Json(state.registry.get(id).await?))
}

pub async fn update(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(dto): Json<DeviceDto>,
) -> Result<Json<Device>, ApiError> {
    Ok(Json(state.registry.update(id, dto).await?))
}

pub async fn delete(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    state.registry.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}
