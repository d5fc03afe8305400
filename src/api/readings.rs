use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::Response;
use axum::Json;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::ApiError;
use super::state::AppState;
use crate::store::Reading;

fn parse_query_ts(raw: &str) -> Result<DateTime<Utc>, ApiError> {
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S")
        .map(|naive| DateTime::from_naive_utc_and_offset(naive, Utc))
        .map_err(|err| anyhow::anyhow!("invalid timestamp {raw:?}: {err}").into())
}

#[derive(Debug, Serialize)]
pub struct LatestEntry {
    pub device_id: i64,
    pub device_name: String,
    pub latest_reading: Reading,
}

pub async fn latest(State(state): State<Arc<AppState>>) -> Result<Json<Vec<LatestEntry>>, ApiError> {
    let readings = state.store.latest().await?;
    Ok(Json(
        readings
            .into_iter()
            .map(|r| LatestEntry {
                device_id: r.device_id,
                device_name: r.device_name.clone(),
                latest_reading: r,
            })
            .collect(),
    ))
}

#[derive(Debug, Deserialize)]
pub struct DeviceHistoryQuery {
    pub limit: Option<i64>,
}

pub async fn by_device(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Query(query): Query<DeviceHistoryQuery>,
) -> Result<Json<Vec<Reading>>, ApiError> {
    let far_future = Utc::now() + chrono::Duration::days(365 * 10);
    let far_past = Utc::now() - chrono::Duration::days(365 * 10);
    Ok(Json(
        state
            .store
            .history(id, far_past, far_future, query.limit)
            .await?,
    ))
}

#[derive(Debug, Deserialize)]
pub struct FilterQuery {
    pub device_id: i64,
    pub start_date: String,
    pub end_date: String,
}

#[derive(Debug, Serialize)]
pub struct FilterResponse {
    pub readings: Vec<Reading>,
}

pub async fn filter(
    State(state): State<Arc<AppState>>,
    Query(query): Query<FilterQuery>,
) -> Result<Json<FilterResponse>, ApiError> {
    let start = parse_query_ts(&query.start_date)?;
    let end = parse_query_ts(&query.end_date)?;
    let readings = state.store.history(query.device_id, start, end, None).await?;
    Ok(Json(FilterResponse { readings }))
}

pub async fn export_csv(
    State(state): State<Arc<AppState>>,
    Query(query): Query<FilterQuery>,
) -> Result<Response, ApiError> {
    let start = parse_query_ts(&query.start_date)?;
    let end = parse_query_ts(&query.end_date)?;
    let rx = state.store.export_csv_stream(query.device_id, start, end);
    let stream = rx.into_stream();
    let body = Body::from_stream(stream);
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/csv")
        .body(body)
        .map_err(|err| anyhow::anyhow!(err).into())
}

pub async fn stats(State(state): State<Arc<AppState>>) -> Result<Json<crate::store::ReadingStats>, ApiError> {
    Ok(Json(state.store.stats().await?))
}
