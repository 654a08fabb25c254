use axum::{
    extract::{State, ws::WebSocketUpgrade},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};

use crate::interfaces::web::AppState;

/// Daemon socket endpoint. The bearer token is required at upgrade time; the
/// channel verifies it and answers with an auth frame (or an error frame for
/// a token it does not recognize).
pub async fn device_ws_endpoint(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(|s| s.to_string());

    match token {
        Some(token) => {
            let devices = state.devices.clone();
            ws.on_upgrade(move |socket| async move {
                devices.handle_socket(socket, &token).await;
            })
        }
        None => (StatusCode::UNAUTHORIZED, "Missing device token").into_response(),
    }
}
