use axum::{
    extract::{ws::CloseFrame, ws::Message as WsMessage, ws::WebSocket, Query, State, WebSocketUpgrade},
    response::IntoResponse,
    routing::{get, post, put},
    Router,
};
use chrono::Utc;
use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use relay_core::protocol::{
    FrameKind, JoinConversationPayload, RawFrame, RiderPositionPayload, CLOSE_POLICY_VIOLATION,
};
use relay_core::Role;
use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod http;
mod state;

use state::{ClientConn, HubState, Session};

const MAX_FRAME_BYTES: usize = 64 * 1024;

#[derive(Parser, Debug)]
#[command(name = "relay-hub")]
struct Args {
    #[arg(long, default_value = "127.0.0.1:8787")]
    addr: String,
    /// JSON file mapping bearer token -> {user_id, role}.
    #[arg(long, default_value = "", env = "RELAY_SESSIONS")]
    sessions: String,
    #[arg(long, default_value_t = 2)]
    write_timeout: u64,
    #[arg(long, default_value_t = false)]
    debug: bool,
}

#[derive(Clone)]
struct Config {
    write_timeout: Duration,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.debug);

    let addr: SocketAddr = match args.addr.parse() {
        Ok(value) => value,
        Err(err) => {
            error!(event = "invalid_addr", error = %err, addr = %args.addr);
            return;
        }
    };

    let sessions = match load_sessions(&args.sessions) {
        Ok(value) => value,
        Err(err) => {
            error!(event = "sessions_load_error", error = %err, path = %args.sessions);
            return;
        }
    };
    if sessions.is_empty() {
        warn!(event = "no_sessions", "hub started with an empty session table");
    }

    let config = Config {
        write_timeout: Duration::from_secs(args.write_timeout),
    };
    let hub = Arc::new(HubState::new(sessions));

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(|| async { "ok" }))
        .route("/api/orders", post(http::create_order))
        .route("/api/orders/:id/status", put(http::update_status))
        .route("/api/orders/:id/assign", put(http::assign_order))
        .route("/api/orders/:id/pickup", post(http::confirm_pickup))
        .route(
            "/api/conversations/:order_id/messages",
            post(http::post_message).get(http::read_history),
        )
        .with_state(hub.clone())
        .layer(axum::Extension(config));

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(value) => value,
        Err(err) => {
            error!(event = "bind_error", error = %err);
            return;
        }
    };

    info!(event = "hub_start", addr = %args.addr);

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    if let Err(err) = axum::serve(listener, app).with_graceful_shutdown(shutdown).await {
        error!(event = "hub_error", error = %err);
    }
}

fn init_logging(debug: bool) {
    let level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_sessions(path: &str) -> Result<HashMap<String, Session>, anyhow::Error> {
    if path.trim().is_empty() {
        return Ok(HashMap::new());
    }
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(hub): State<Arc<HubState>>,
    axum::Extension(config): axum::Extension<Config>,
) -> impl IntoResponse {
    let token = params.get("token").cloned();
    ws.on_upgrade(move |socket| handle_socket(hub, config, socket, token))
}

async fn handle_socket(
    hub: Arc<HubState>,
    config: Config,
    socket: WebSocket,
    token: Option<String>,
) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<WsMessage>(256);
    let write_timeout = config.write_timeout;
    let write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let send = ws_sender.send(msg);
            if tokio::time::timeout(write_timeout, send).await.is_err() {
                return;
            }
        }
    });

    // Credential check happens after the upgrade so the policy-violation
    // close code actually reaches the client.
    let session = token.as_deref().and_then(|value| hub.authenticate(value));
    let session = match session {
        Some(value) => value,
        None => {
            warn!(event = "auth_rejected");
            let _ = tx
                .send(WsMessage::Close(Some(CloseFrame {
                    code: CLOSE_POLICY_VIOLATION,
                    reason: "invalid or expired credential".into(),
                })))
                .await;
            drop(tx);
            let _ = write_task.await;
            return;
        }
    };

    let conn = ClientConn::new(hub.next_conn_id(), session.user_id, session.role, tx.clone());
    hub.register(conn.clone()).await;

    while let Some(result) = ws_receiver.next().await {
        let msg = match result {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "read_error", conn_id = %conn.conn_id, error = %err);
                break;
            }
        };
        let text = match msg {
            WsMessage::Text(text) => text,
            WsMessage::Binary(bytes) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => {
                    hub.send_error(&conn, "invalid_frame", "frame is not utf-8").await;
                    continue;
                }
            },
            WsMessage::Close(_) => {
                info!(event = "client_close", conn_id = %conn.conn_id);
                break;
            }
            WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
        };
        if text.len() > MAX_FRAME_BYTES {
            warn!(event = "frame_too_large", conn_id = %conn.conn_id, size = text.len());
            continue;
        }
        dispatch_frame(&hub, &conn, &text).await;
    }

    hub.remove(&conn, "disconnect").await;
    drop(tx);
    let _ = write_task.await;
}

async fn dispatch_frame(hub: &Arc<HubState>, conn: &Arc<ClientConn>, text: &str) {
    let raw: RawFrame = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(err) => {
            warn!(event = "frame_invalid", conn_id = %conn.conn_id, error = %err);
            hub.send_error(conn, "invalid_frame", "frame did not parse").await;
            return;
        }
    };
    let kind: FrameKind = match raw.kind.parse() {
        Ok(value) => value,
        Err(_) => {
            warn!(event = "unknown_frame_type", conn_id = %conn.conn_id, r#type = %raw.kind);
            hub.send_error(conn, "unknown_type", &raw.kind).await;
            return;
        }
    };

    match kind {
        FrameKind::JoinConversation => {
            let payload: JoinConversationPayload = match serde_json::from_value(raw.payload) {
                Ok(value) => value,
                Err(_) => {
                    hub.send_error(conn, "invalid_payload", "expected {orderId}").await;
                    return;
                }
            };
            if let Err(err) = hub.join_conversation(conn, payload.order_id).await {
                hub.send_error(conn, "unknown_order", &err.to_string()).await;
            }
        }
        FrameKind::LeaveConversation => {
            let payload: JoinConversationPayload = match serde_json::from_value(raw.payload) {
                Ok(value) => value,
                Err(_) => {
                    hub.send_error(conn, "invalid_payload", "expected {orderId}").await;
                    return;
                }
            };
            hub.leave_conversation(conn, payload.order_id).await;
        }
        FrameKind::AdminJoinTracking => {
            if conn.role != Role::Admin {
                warn!(event = "role_violation", conn_id = %conn.conn_id);
                hub.send_error(conn, "role_violation", "admin role required").await;
                return;
            }
            hub.join_tracking(conn).await;
        }
        FrameKind::RiderPosition => {
            if conn.role != Role::Rider {
                warn!(event = "role_violation", conn_id = %conn.conn_id);
                hub.send_error(conn, "role_violation", "rider role required").await;
                return;
            }
            let payload: RiderPositionPayload = match serde_json::from_value(raw.payload) {
                Ok(value) => value,
                Err(_) => {
                    hub.send_error(conn, "invalid_payload", "expected {lat, lng, status}").await;
                    return;
                }
            };
            hub.update_position(conn.user_id, &payload, Utc::now()).await;
        }
        other => {
            warn!(event = "unexpected_frame", conn_id = %conn.conn_id, r#type = other.as_str());
            hub.send_error(conn, "unexpected_type", other.as_str()).await;
        }
    }
}
