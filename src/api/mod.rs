pub mod config_routes;
pub mod devices;
pub mod diagnostics;
pub mod error;
pub mod polling;
pub mod pyrometer;
pub mod readings;
pub mod state;
pub mod ws;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use state::AppState;

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

pub fn router(state: Arc<AppState>) -> Router {
    let pending_lease: polling::PendingLease = Arc::new(tokio::sync::Mutex::new(None));

    let api = Router::new()
        .route("/health", get(health))
        .route("/devices", get(devices::list).post(devices::create))
        .route(
            "/devices/{id}",
            get(devices::get).put(devices::update).delete(devices::delete),
        )
        .route("/reading/latest", get(readings::latest))
        .route("/reading/device/{id}", get(readings::by_device))
        .route("/reading/filter", get(readings::filter))
        .route("/reading/export/csv", get(readings::export_csv))
        .route("/reading/stats", get(readings::stats))
        .route("/polling/stats", get(polling::stats))
        .route("/polling/restart", post(polling::restart))
        .route("/polling/pause", post(polling::pause))
        .route("/polling/resume", post(polling::resume))
        .route("/config/com-ports", get(config_routes::com_ports))
        .route("/config/verify-pin", post(config_routes::verify_pin))
        .route("/config/clear-settings", post(config_routes::clear_settings))
        .route("/diagnostics/logs", get(diagnostics::logs))
        .route(
            "/pyrometer/emissivity",
            get(pyrometer::read_emissivity).post(pyrometer::write_emissivity),
        )
        .route(
            "/pyrometer/slope",
            get(pyrometer::read_slope).post(pyrometer::write_slope),
        )
        .route(
            "/pyrometer/measurement-mode",
            get(pyrometer::read_measurement_mode).post(pyrometer::write_measurement_mode),
        )
        .route(
            "/pyrometer/time-interval",
            get(pyrometer::read_time_interval).post(pyrometer::write_time_interval),
        )
        .route(
            "/pyrometer/temp-lower-limit",
            get(pyrometer::read_temp_lower_limit).post(pyrometer::write_temp_lower_limit),
        )
        .route(
            "/pyrometer/temp-upper-limit",
            get(pyrometer::read_temp_upper_limit).post(pyrometer::write_temp_upper_limit),
        )
        .route("/pyrometer/all-parameters", get(pyrometer::all_parameters))
        .route("/ws", get(ws::upgrade))
        .layer(axum::Extension(pending_lease))
        .with_state(state);

    Router::new()
        .nest("/api", api)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
