use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use serde_json::json;

use super::state::AppState;
use crate::store::Reading;

pub async fn upgrade(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

fn frame_for(reading: &Reading) -> String {
    // Built by hand rather than derived through `Reading`'s own
    // `Serialize` impl, so the no-timezone-suffix timestamp rule has to be
    // applied explicitly here too.
    json!({
        "type": "reading_update",
        "data": {
            "device_id": reading.device_id,
            "device_name": reading.device_name,
            "temperature": reading.value,
            "ambient_temp": reading.ambient_temp,
            "status": reading.status.as_str(),
            "timestamp": reading.timestamp.format("%Y-%m-%dT%H:%M:%S%.6f").to_string(),
            "raw_hex": reading.raw_hex,
            "error_message": reading.error_message,
        }
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ReadingStatus;
    use chrono::DateTime;

    #[test]
    fn frame_timestamp_has_no_timezone_suffix() {
        let ts = DateTime::parse_from_rfc3339("2026-08-01T12:34:56.789012Z")
            .unwrap()
            .with_timezone(&chrono::Utc);
        let reading = Reading {
            id: None,
            device_id: 1,
            device_name: "probe-1".into(),
            timestamp: ts,
            value: Some(20.0),
            ambient_temp: None,
            status: ReadingStatus::Ok,
            raw_hex: None,
            error_message: None,
        };
        let frame = frame_for(&reading);
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["data"]["timestamp"], "2026-08-01T12:34:56.789012");
    }
}

async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>) {
    let (rx, _handle) = state.broadcaster.subscribe();

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue, // no client-to-server protocol; ignore
                    Some(Err(_)) => break,
                }
            }
            reading = rx.recv_async() => {
                match reading {
                    Ok(reading) => {
                        if socket.send(Message::Text(frame_for(&reading).into())).await.is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        }
    }
    // `_handle` drops here, unsubscribing.
}
