//! WebSocket and admin HTTP handlers.
//!
//! Everything in this module is I/O plumbing around the core: it turns
//! WebSocket frames into envelopes and REST calls into coordinator queries,
//! nothing more.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use beacon_core::{ClientConnection, ClientSink, ClusterHandle, DisconnectReason, RoutingError};
use beacon_protocol::{Envelope, GroupName};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// Handle to the running cluster.
    pub cluster: ClusterHandle,
    /// Server configuration.
    pub config: Config,
}

/// Run the WebSocket/REST server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let cluster = ClusterHandle::spawn(config.cluster_config());
    info!(shards = cluster.shard_count(), "cluster started");

    let state = Arc::new(AppState {
        cluster,
        config: config.clone(),
    });

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    // Build router
    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/beacon/users/status/:name", get(user_status_handler))
        .route("/beacon/users/active/users", get(active_users_handler))
        .route("/beacon/users/group/users", get(group_users_handler))
        .route("/beacon/users/group/register", post(group_register_handler))
        .with_state(state);

    // Bind and serve
    let addr = config.bind_addr();
    let listener = TcpListener::bind(addr).await?;

    info!("Beacon server listening on {}", addr);
    info!("WebSocket endpoint: ws://{}/ws", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Whether a username is currently online.
async fn user_status_handler(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    let status = state.cluster.is_registered(name).await.unwrap_or(false);
    Json(serde_json::json!({ "status": status }))
}

#[derive(Deserialize)]
struct ActiveUsersQuery {
    prefix: Option<String>,
}

/// All active usernames, with an optional substring filter.
async fn active_users_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ActiveUsersQuery>,
) -> impl IntoResponse {
    let mut users = state.cluster.list_active(None).await.unwrap_or_default();
    if let Some(prefix) = query.prefix.filter(|p| !p.is_empty()) {
        // Substring match, not a strict prefix, mirroring the legacy API.
        users.retain(|name| name.contains(&prefix));
    }
    Json(serde_json::json!({ "users": users }))
}

#[derive(Deserialize)]
struct GroupUsersQuery {
    group: String,
}

/// Members of one group.
async fn group_users_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<GroupUsersQuery>,
) -> Response {
    match GroupName::from_str(&query.group) {
        Ok(group) => {
            let users = state
                .cluster
                .list_active(Some(group))
                .await
                .unwrap_or_default();
            Json(serde_json::json!({ "users": users })).into_response()
        }
        Err(err) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(serde_json::json!({ "error": err.to_string() })),
        )
            .into_response(),
    }
}

#[derive(Deserialize)]
struct GroupRegisterRequest {
    username: String,
    #[serde(rename = "groupName")]
    group_name: String,
}

/// Join a registered user to a group.
async fn group_register_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<GroupRegisterRequest>,
) -> Response {
    let result = match GroupName::from_str(&request.group_name) {
        Ok(group) => state.cluster.register_group(request.username, group).await,
        Err(err) => Err(RoutingError::InvalidGroup(err.0)),
    };

    match result {
        Ok(()) => Json(serde_json::json!({ "ok": true })).into_response(),
        Err(err) => {
            let status = match &err {
                RoutingError::InvalidGroup(_) => StatusCode::UNPROCESSABLE_ENTITY,
                RoutingError::UserNotRegistered(_) => StatusCode::NOT_FOUND,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            (
                status,
                Json(serde_json::json!({ "error": err.to_string() })),
            )
                .into_response()
        }
    }
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, state))
}

/// Handle a WebSocket connection: pump frames into the owning worker and
/// drain the connection's sink back out.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let (sink, mut outbound) = ClientSink::pair();
    let client = match state.cluster.connect(sink) {
        Ok(client) => client,
        Err(err) => {
            error!(error = %err, "cluster rejected connection");
            return;
        }
    };
    debug!(connection = %client.id(), worker = %client.worker(), "websocket attached");

    let (mut ws_tx, mut ws_rx) = socket.split();
    let max_message_size = state.config.limits.max_message_size;
    let mut reason = DisconnectReason::Closed;

    loop {
        tokio::select! {
            biased;

            // Envelopes from the core, out to the client.
            envelope = outbound.recv() => {
                let Some(envelope) = envelope else { break };
                match envelope.to_json() {
                    Ok(text) => {
                        metrics::record_message(text.len(), "outbound");
                        if ws_tx.send(Message::Text(text)).await.is_err() {
                            reason = DisconnectReason::Error;
                            break;
                        }
                    }
                    Err(err) => {
                        warn!(connection = %client.id(), error = %err, "failed to encode envelope");
                    }
                }
            }

            // Frames from the client, into the core.
            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        let start = Instant::now();
                        if !handle_inbound(&client, text.as_bytes(), max_message_size) {
                            break;
                        }
                        metrics::record_latency(start.elapsed().as_secs_f64());
                    }
                    Some(Ok(Message::Binary(data))) => {
                        let start = Instant::now();
                        if !handle_inbound(&client, &data, max_message_size) {
                            break;
                        }
                        metrics::record_latency(start.elapsed().as_secs_f64());
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if ws_tx.send(Message::Pong(data)).await.is_err() {
                            reason = DisconnectReason::Error;
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        // Ignore pongs
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %client.id(), "received close frame");
                        break;
                    }
                    Some(Err(err)) => {
                        warn!(connection = %client.id(), error = %err, "websocket error");
                        metrics::record_error("websocket");
                        reason = DisconnectReason::Error;
                        break;
                    }
                    None => {
                        debug!(connection = %client.id(), "websocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    client.disconnect(reason);
    debug!(connection = %client.id(), "websocket detached");
}

/// Parse and dispatch one inbound frame. Returns `false` once the owning
/// worker is gone and the socket should be torn down.
fn handle_inbound(client: &ClientConnection, raw: &[u8], max_message_size: usize) -> bool {
    if raw.len() > max_message_size {
        warn!(connection = %client.id(), size = raw.len(), "dropping oversized message");
        metrics::record_error("oversized");
        return true;
    }

    let Ok(text) = std::str::from_utf8(raw) else {
        debug!(connection = %client.id(), "dropping non-UTF-8 message");
        metrics::record_error("decode");
        return true;
    };

    match Envelope::from_json(text) {
        Ok(envelope) => {
            metrics::record_message(raw.len(), "inbound");
            client.message(envelope).is_ok()
        }
        Err(err) => {
            // Malformed input is dropped; the client is never sent an error.
            debug!(connection = %client.id(), error = %err, "dropping unparseable envelope");
            metrics::record_error("decode");
            true
        }
    }
}
