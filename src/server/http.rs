//! HTTP handlers. The gateway's actual work happens over the device
//! WebSocket route in `server::mod`; this surface exists for health
//! checks only — there is no HTTP login/session API, devices carry
//! their bearer token directly into the WebSocket handshake.

use axum::{extract::State, response::IntoResponse, Json};
use axum::http::StatusCode;

use crate::server::GatewayState;

/// Status response
#[derive(Debug, serde::Serialize)]
pub struct StatusResponse {
    pub status: String,
    pub version: String,
    pub auth_enabled: bool,
}

/// Status handler
pub async fn status_handler(State(state): State<GatewayState>) -> impl IntoResponse {
    let response = StatusResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        auth_enabled: state.config.auth.require_auth,
    };

    (StatusCode::OK, Json(response)).into_response()
}
