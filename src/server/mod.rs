//! Server acceptor (C9): HTTP login/status surface plus the single
//! WebSocket route devices connect to. Grounded on the teacher's
//! `start`/route-merging structure in spirit; the teacher's per-message
//! chat loop is gone, replaced by handing the accepted socket straight
//! to the connection orchestrator.

pub mod auth;
pub mod device;
pub mod http;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::cache::{CacheType, TypedCache};
use crate::config::Config;
use crate::memory::MemoryStore;
use crate::orchestrator::{self, CachedWakeupResponse, ConnectionIdentity, SharedProviders};
use crate::server::auth::{authenticate_device, AuthState};
use crate::voice::stt_local::LocalStt;

const DEVICE_ID_HEADER: &str = "device-id";
const CLIENT_ID_HEADER: &str = "client-id";

/// Shared axum state: per-process auth/config plus the providers handed
/// to every accepted connection.
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<Config>,
    pub auth_state: Arc<AuthState>,
    pub shared: Arc<SharedProviders>,
}

#[derive(Debug, Deserialize, Default)]
struct WsQuery {
    #[serde(rename = "from")]
    from: Option<String>,
    #[serde(rename = "device-id")]
    device_id: Option<String>,
    #[serde(rename = "client-id")]
    client_id: Option<String>,
}

/// Start the web server: builds shared providers once, then serves the
/// device WebSocket route plus the trimmed HTTP auth/status surface.
pub async fn start(mut config: Config) -> Result<()> {
    config.ensure_jwt_secret()?;
    let config = Arc::new(config);

    let auth_config = crate::server::auth::AuthConfig {
        jwt_secret: config
            .auth
            .jwt_secret
            .clone()
            .unwrap_or_else(auth::generate_jwt_secret),
        access_token_expiry_minutes: config.auth.access_token_expiry_minutes,
    };
    let auth_state = AuthState::new(auth_config);

    let memory = Arc::new(MemoryStore::load(crate::config::memory_path()?).await?);
    let wakeup_cache = Arc::new(TypedCache::<CachedWakeupResponse>::new(CacheType::WakeupResponse));
    let local_stt = Arc::new(LocalStt::from_config(&config.voice));

    let server_mcp_tools = match &config.mcp.settings_path {
        Some(path) => crate::tools::spawn_configured_servers(path).await.unwrap_or_else(|e| {
            warn!(error = %e, "failed to load server-side MCP tools, continuing without them");
            Vec::new()
        }),
        None => Vec::new(),
    };

    let shared = Arc::new(SharedProviders {
        config: config.clone(),
        memory,
        wakeup_cache,
        local_stt,
        server_mcp_tools,
    });

    let state = GatewayState { config: config.clone(), auth_state, shared };

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;

    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    let app = Router::new()
        .route("/xiaozhi/v1/", get(device_ws_handler))
        .route("/api/status", get(http::status_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    info!("xiaozhi-gateway listening on ws://{addr}/xiaozhi/v1/");

    let listener = tokio::net::TcpListener::bind(addr).await.context("failed to bind listener")?;

    if let (Some(cert_path), Some(key_path)) =
        (config.server.tls_cert_path.as_ref(), config.server.tls_key_path.as_ref())
    {
        let cert_data = tokio::fs::read(cert_path).await.context("failed to read TLS cert")?;
        let key_data = tokio::fs::read(key_path).await.context("failed to read TLS key")?;
        let tls_config = axum_server::tls_rustls::RustlsConfig::from_pem(cert_data, key_data).await?;
        drop(listener);
        axum_server::bind_rustls(addr, tls_config)
            .serve(app.into_make_service())
            .await
            .context("server exited")?;
        return Ok(());
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server exited")?;

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received, draining connections");
}

fn real_ip(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| {
            headers
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.split(',').next())
                .map(|s| s.trim().to_string())
        })
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer ").or_else(|| v.strip_prefix("bearer ")))
        .map(str::to_string)
}

/// Handles the HANDSHAKE→AUTH→INIT sequence (§4.8) before handing the
/// upgraded socket to the orchestrator.
async fn device_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<GatewayState>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
) -> Response {
    let device_id = headers
        .get(DEVICE_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or(query.device_id);

    let Some(device_id) = device_id else {
        return Response::builder()
            .status(axum::http::StatusCode::BAD_REQUEST)
            .body("missing device-id".into())
            .unwrap();
    };

    let client_id = headers
        .get(CLIENT_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or(query.client_id)
        .unwrap_or_else(|| device_id.clone());

    let bearer = bearer_token(&headers);

    if let Err(err) =
        authenticate_device(&state.config.auth, &state.auth_state, &device_id, bearer.as_deref())
    {
        warn!(%device_id, error = %err, "device authentication failed");
        return Response::builder()
            .status(axum::http::StatusCode::UNAUTHORIZED)
            .body("authentication failed".into())
            .unwrap();
    }

    let has_audio_header = query.from.as_deref() == Some("mqtt_gateway");
    let identity = ConnectionIdentity {
        device_id,
        client_id,
        real_ip: real_ip(&headers),
        bearer_token: bearer,
        has_audio_header,
    };
    let shared = state.shared.clone();

    ws.on_upgrade(move |socket| async move {
        orchestrator::run_connection(socket, identity, shared).await;
    })
}
