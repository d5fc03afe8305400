use std::sync::Arc;

use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::error::ApiError;
use super::state::AppState;
use crate::parameters::ParamId;

/// `baud` is only a fallback: if `slave_id`+`com_port` matches a registered
/// device, its own configured baud rate wins.
#[derive(Debug, Deserialize)]
pub struct ReadQuery {
    pub slave_id: u8,
    pub com_port: String,
    #[serde(default = "default_baud")]
    pub baud: u32,
}

fn default_baud() -> u32 {
    9600
}

#[derive(Debug, Deserialize)]
pub struct WriteBody {
    pub value: f32,
    pub slave_id: u8,
    pub com_port: String,
    #[serde(default = "default_baud")]
    pub baud: u32,
}

macro_rules! param_routes {
    ($read_fn:ident, $write_fn:ident, $param:expr, $field:literal) => {
        pub async fn $read_fn(
            State(state): State<Arc<AppState>>,
            Query(q): Query<ReadQuery>,
        ) -> Result<Json<Value>, ApiError> {
            let value = state
                .params
                .read_parameter(q.slave_id, &q.com_port, q.baud, $param, state.config.max_pause_wait)
                .await?;
            Ok(Json(json!({ $field: value })))
        }

        pub async fn $write_fn(
            State(state): State<Arc<AppState>>,
            Json(body): Json<WriteBody>,
        ) -> Result<Json<Value>, ApiError> {
            let value = state
                .params
                .write_parameter(
                    body.slave_id,
                    &body.com_port,
                    body.baud,
                    $param,
                    body.value,
                    state.config.max_pause_wait,
                )
                .await?;
            Ok(Json(json!({ $field: value })))
        }
    };
}

param_routes!(read_emissivity, write_emissivity, ParamId::Emissivity, "emissivity");
param_routes!(read_slope, write_slope, ParamId::Slope, "slope");
param_routes!(
    read_measurement_mode,
    write_measurement_mode,
    ParamId::MeasurementMode,
    "measurement_mode"
);
param_routes!(read_time_interval, write_time_interval, ParamId::TimeInterval, "time_interval");
param_routes!(
    read_temp_lower_limit,
    write_temp_lower_limit,
    ParamId::TempLowerLimit,
    "temp_lower_limit"
);
param_routes!(
    read_temp_upper_limit,
    write_temp_upper_limit,
    ParamId::TempUpperLimit,
    "temp_upper_limit"
);

#[derive(Debug, Serialize)]
pub struct AllParameters {
    pub emissivity: f32,
    pub slope: f32,
    pub measurement_mode: f32,
    pub time_interval: f32,
    pub temp_lower_limit: f32,
    pub temp_upper_limit: f32,
}

pub async fn all_parameters(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ReadQuery>,
) -> Result<Json<AllParameters>, ApiError> {
    let values = state
        .params
        .read_all(q.slave_id, &q.com_port, q.baud, state.config.max_pause_wait)
        .await?;

    let get = |id: ParamId| values.iter().find(|(p, _)| *p == id).map(|(_, v)| *v).unwrap_or(0.0);

    Ok(Json(AllParameters {
        emissivity: get(ParamId::Emissivity),
        slope: get(ParamId::Slope),
        measurement_mode: get(ParamId::MeasurementMode),
        time_interval: get(ParamId::TimeInterval),
        temp_lower_limit: get(ParamId::TempLowerLimit),
        temp_upper_limit: get(ParamId::TempUpperLimit),
    }))
}
