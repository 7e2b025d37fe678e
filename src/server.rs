//! HTTP surface: webhook sink, live-update WebSocket channel, health probe.
//!
//! `POST /webhook/github` runs the full pipeline for one delivery:
//! verify signature → normalize payload → reconcile → broadcast. Only a bad
//! signature (403), a malformed payload (400), an unlinked repository (404),
//! or a storage failure (500) change the response; everything else is a 200.
//!
//! `GET /ws` upgrades to a WebSocket. The client sends
//! `{"type":"join","project_id":"…"}` to watch a project; events arrive as
//! JSON text frames. Dropping the socket deregisters the connection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::broadcast::{ConnId, Outbox, SubscriptionRegistry};
use crate::config::Config;
use crate::error::ReconcileError;
use crate::payload;
use crate::reconcile::Reconciler;
use crate::signature;
use crate::store::SqliteStore;

// ── Shared state ──────────────────────────────────────────────────────────────

pub struct AppState {
    reconciler: Reconciler<SqliteStore>,
    registry: Arc<SubscriptionRegistry>,
    webhook_secret: String,
    next_conn_id: AtomicU64,
}

impl AppState {
    pub fn new(
        store: SqliteStore,
        registry: Arc<SubscriptionRegistry>,
        webhook_secret: String,
    ) -> Self {
        Self {
            reconciler: Reconciler::new(store, registry.clone()),
            registry,
            webhook_secret,
            next_conn_id: AtomicU64::new(1),
        }
    }
}

// ── Webhook sink ──────────────────────────────────────────────────────────────

/// POST /webhook/github — one push-event delivery.
async fn handle_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, &'static str) {
    let event = headers
        .get("x-github-event")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    // Connectivity check from the provider: answer without payload semantics.
    if event == "ping" {
        return (StatusCode::OK, "pong");
    }

    // Signature is computed over the raw body bytes, never a re-serialization.
    let sig = headers
        .get("x-hub-signature-256")
        .and_then(|v| v.to_str().ok());
    if let Err(e) = signature::verify_signature(&body, sig, &state.webhook_secret) {
        tracing::warn!("webhook: {e}");
        return (StatusCode::FORBIDDEN, "invalid signature");
    }

    let push = match payload::normalize(&body) {
        Ok(push) => push,
        Err(e) => {
            tracing::warn!("webhook: {e}");
            return (StatusCode::BAD_REQUEST, "unprocessable payload");
        }
    };

    match state.reconciler.process(&push).await {
        Ok(outcome) => {
            tracing::info!(
                project_id = %outcome.project_id,
                commit_id = %outcome.commit.id,
                completed_task = outcome.completed.as_ref().map(|c| c.task.id.as_str()),
                "webhook processed"
            );
            (StatusCode::OK, "webhook processed")
        }
        Err(ReconcileError::UnknownRepository(url)) => {
            tracing::warn!(repo_url = %url, "webhook for unlinked repository");
            (StatusCode::NOT_FOUND, "repository not linked")
        }
        Err(e) => {
            tracing::error!("webhook processing failed: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

// ── Live channel ──────────────────────────────────────────────────────────────

/// Frames a live client may send. Anything else is ignored.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientFrame {
    Join { project_id: String },
    Leave,
}

async fn handle_ws(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let conn_id = state.next_conn_id.fetch_add(1, Ordering::Relaxed);
    ws.on_upgrade(move |socket| client_connection(state, conn_id, socket))
}

/// Drive one live connection: forward broadcast frames out, apply join/leave
/// frames coming in, deregister on close.
async fn client_connection(state: Arc<AppState>, conn_id: ConnId, socket: WebSocket) {
    tracing::debug!(conn_id, "live client connected");
    let (mut sink, mut stream) = socket.split();
    let (outbox, mut inbox) = mpsc::unbounded_channel::<String>();

    loop {
        tokio::select! {
            frame = inbox.recv() => {
                let Some(frame) = frame else { break };
                if sink.send(Message::Text(frame.into())).await.is_err() {
                    break;
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        handle_client_frame(&state, conn_id, &outbox, text.as_str());
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // pings are answered by the transport
                    Some(Err(e)) => {
                        tracing::debug!(conn_id, "live client socket error: {e}");
                        break;
                    }
                }
            }
        }
    }

    // Covers abrupt disconnects too — no explicit leave required.
    state.registry.disconnect(conn_id);
    tracing::debug!(conn_id, "live client disconnected");
}

fn handle_client_frame(state: &AppState, conn_id: ConnId, outbox: &Outbox, text: &str) {
    match serde_json::from_str::<ClientFrame>(text) {
        Ok(ClientFrame::Join { project_id }) => {
            state.registry.join(conn_id, &project_id, outbox.clone());
        }
        Ok(ClientFrame::Leave) => state.registry.disconnect(conn_id),
        Err(e) => tracing::debug!(conn_id, "ignoring unrecognized client frame: {e}"),
    }
}

// ── Router / startup ──────────────────────────────────────────────────────────

async fn handle_healthz() -> &'static str {
    "ok"
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/webhook/github", post(handle_webhook))
        .route("/ws", get(handle_ws))
        .route("/healthz", get(handle_healthz))
        .with_state(state)
}

/// Bind and serve until ctrl-c.
pub async fn run(
    config: &Config,
    webhook_secret: String,
    store: SqliteStore,
    registry: Arc<SubscriptionRegistry>,
) -> anyhow::Result<()> {
    let state = Arc::new(AppState::new(store, registry, webhook_secret));
    let app = router(state);

    let addr = format!("{}:{}", config.server.bind, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to install ctrl-c handler: {e}");
    }
    tracing::info!("shutting down");
}
