//! HTTP bridge (spec §6.1): a small local-only axum server exposing
//! `GET /health` and a configurable `POST .../message` endpoint for
//! non-chat frontends (the CLI, scripts, other services on the host).
//!
//! Runs its own [`IncomingQueue`] rather than sharing the one fed by
//! [`PipelineBridge::run`]: a queue worker is spawned once per `chat_id`
//! with a fixed processing closure, so each request here carries its own
//! reply channel in the payload instead of trying to vary the closure.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::oneshot;
use tracing::warn;

use crate::bus::events::InboundMessage;
use crate::config::SecurityProfileChoice;
use crate::gateway::bridge::PipelineBridge;
use crate::observability::{build_doctor_report, MetricsRegistry};
use crate::queue::IncomingQueue;

const MAX_BODY_BYTES: usize = 256 * 1024;

/// A request's message paired with the channel its reply travels back on.
type HttpQueueItem = (InboundMessage, oneshot::Sender<Option<String>>);

pub struct HttpBridgeState {
    bridge: Arc<PipelineBridge>,
    queue: Arc<IncomingQueue<HttpQueueItem>>,
    metrics: Arc<MetricsRegistry>,
    bridge_token: String,
    message_path: String,
    security_profile: SecurityProfileChoice,
    started_at: std::time::Instant,
}

impl HttpBridgeState {
    pub fn new(
        bridge: Arc<PipelineBridge>,
        queue: Arc<IncomingQueue<HttpQueueItem>>,
        metrics: Arc<MetricsRegistry>,
        bridge_token: String,
        message_path: String,
        security_profile: SecurityProfileChoice,
    ) -> Self {
        Self { bridge, queue, metrics, bridge_token, message_path, security_profile, started_at: std::time::Instant::now() }
    }
}

pub fn router(state: Arc<HttpBridgeState>) -> Router {
    let path = state.message_path.clone();
    Router::new().route("/health", get(health)).route(&path, post(post_message)).with_state(state)
}

async fn health(State(state): State<Arc<HttpBridgeState>>) -> impl IntoResponse {
    let report = build_doctor_report(&state.metrics, state.started_at.elapsed().as_secs(), state.queue.total_depth(), vec![]).await;
    Json(json!({
        "ok": true,
        "health": "ok",
        "service": "switchboard",
        "version": env!("CARGO_PKG_VERSION"),
        "messagePath": state.message_path,
        "securityProfile": state.security_profile,
        "metrics": report.metrics,
    }))
}

#[derive(Debug, Deserialize)]
struct MessageRequest {
    text: String,
    #[serde(rename = "chatId")]
    chat_id: Option<i64>,
    #[serde(rename = "userId")]
    user_id: Option<i64>,
    source: Option<String>,
    #[serde(rename = "requestId")]
    request_id: Option<String>,
}

async fn post_message(State(state): State<Arc<HttpBridgeState>>, headers: HeaderMap, body: axum::body::Bytes) -> impl IntoResponse {
    if body.len() > MAX_BODY_BYTES {
        return (StatusCode::PAYLOAD_TOO_LARGE, Json(json!({"ok": false, "error": "body too large"}))).into_response();
    }

    let token = headers.get("authorization").and_then(|v| v.to_str().ok()).and_then(|v| v.strip_prefix("Bearer "));
    if token != Some(state.bridge_token.as_str()) {
        return (StatusCode::UNAUTHORIZED, Json(json!({"ok": false, "error": "bad token"}))).into_response();
    }

    let req: MessageRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => {
            return (StatusCode::BAD_REQUEST, Json(json!({"ok": false, "error": format!("malformed request: {e}")}))).into_response();
        }
    };
    if req.text.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, Json(json!({"ok": false, "error": "missing text"}))).into_response();
    }

    let chat_id = req.chat_id.unwrap_or(0);
    let user_id = req.user_id.unwrap_or(0);
    let source = req.source.clone().unwrap_or_else(|| "http".into());
    let msg = InboundMessage { chat_id, user_id, text: req.text, source: source.clone(), request_id: req.request_id.clone(), reply_reference: None };

    let (reply_tx, reply_rx) = oneshot::channel();
    let bridge = Arc::clone(&state.bridge);
    let enqueue_result = state
        .queue
        .enqueue(chat_id, &source, (msg, reply_tx), move |(payload, tx)| {
            let bridge = Arc::clone(&bridge);
            async move {
                let reply = bridge.process_for_reply(&payload).await;
                let _ = tx.send(reply);
            }
        })
        .await;

    if enqueue_result.is_err() {
        warn!(chat_id, "queue rejected HTTP bridge message");
        return (StatusCode::TOO_MANY_REQUESTS, Json(json!({"ok": false, "error": "queue overflow"}))).into_response();
    }

    match reply_rx.await {
        Ok(reply) => {
            let replies: Vec<String> = reply.into_iter().collect();
            Json(json!({"ok": true, "chatId": chat_id, "userId": user_id, "replies": replies, "requestId": req.request_id})).into_response()
        }
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"ok": false, "error": "dispatcher dropped the request"}))).into_response(),
    }
}
