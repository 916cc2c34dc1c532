//! WebSocket handler for streaming chat.
//!
//! Clients connect to `/ws/chat?session=<id>` and exchange JSON frames.
//! Inbound frames carry a chat message, a stop request or a voice toggle;
//! outbound frames are the turn events, tagged by `type`. Closing the socket
//! cancels the active reply and drops the session's in-memory state.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use converse_agent::{BusyPolicy, ErrorKind, Mode, TurnEvent, TurnRequest};

use crate::error::ApiError;
use crate::state::AppState;

const OUTBOUND_BUFFER: usize = 256;

const AUDIO_NOTICE: &str =
    "Audio is transcribed by an external service; send the transcript as a text message.";

// ---------------------------------------------------------------------------
// WebSocket message types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ChatQuery {
    #[serde(default)]
    pub session: Option<String>,
}

/// Inbound frame from the client. Exactly one of `stop`, `voice_toggle` or
/// `message` is acted upon, in that order.
#[derive(Debug, Default, Deserialize)]
struct InboundMessage {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    mode: Mode,
    #[serde(default)]
    provider: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    language: Option<String>,
    /// Preempt a running reply instead of being rejected as busy.
    #[serde(default)]
    interrupt: bool,
    #[serde(default)]
    voice_toggle: Option<bool>,
    #[serde(default)]
    stop: bool,
}

impl InboundMessage {
    fn into_request(self, session_id: &str) -> Option<TurnRequest> {
        let message = self.message?;
        let mut request = TurnRequest::new(session_id, message).with_mode(self.mode);
        request.provider = self.provider;
        request.model = self.model;
        request.language = self.language;
        if self.interrupt {
            request.busy_policy = Some(BusyPolicy::Preempt);
        }
        Some(request)
    }
}

/// An `error` frame for a request that never became a turn.
fn rejection(kind: ErrorKind, reason: impl Into<String>) -> Value {
    json!({ "type": "error", "kind": kind, "reason": reason.into() })
}

fn info(message: &str) -> TurnEvent {
    TurnEvent::Info {
        turn_id: None,
        message: message.to_owned(),
    }
}

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

/// Axum handler that upgrades the HTTP connection to a WebSocket.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<ChatQuery>,
) -> Response {
    let Some(session_id) = query
        .session
        .map(|s| s.trim().to_owned())
        .filter(|s| !s.is_empty())
    else {
        return ApiError::bad_request("query parameter `session` is required").into_response();
    };
    ws.on_upgrade(move |socket| handle_socket(socket, state, session_id))
}

/// Process a single WebSocket connection.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>, session_id: String) {
    tracing::info!(%session_id, "websocket client connected");
    state.restore_preference(&session_id).await;

    let (mut sink, mut inbound) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<String>(OUTBOUND_BUFFER);
    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if sink.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
    });

    let mut turns = JoinSet::new();
    while let Some(Ok(msg)) = inbound.next().await {
        while turns.try_join_next().is_some() {}

        let text = match msg {
            Message::Text(t) => t,
            Message::Binary(_) => {
                send(&out_tx, &info(AUDIO_NOTICE)).await;
                continue;
            }
            Message::Close(_) => break,
            // Ping and pong are answered by axum.
            _ => continue,
        };

        let frame: InboundMessage = match serde_json::from_str(text.as_str()) {
            Ok(f) => f,
            Err(e) => {
                send(&out_tx, &rejection(ErrorKind::Policy, format!("malformed frame: {e}"))).await;
                continue;
            }
        };

        if frame.stop {
            state.orchestrator.cancel(&session_id);
            continue;
        }
        if let Some(on) = frame.voice_toggle {
            let event = state.orchestrator.voice_toggle(&session_id, on);
            send(&out_tx, &event).await;
            continue;
        }
        match frame.into_request(&session_id) {
            Some(request) => {
                turns.spawn(stream_turn(Arc::clone(&state), request, out_tx.clone()));
            }
            None => {
                send(
                    &out_tx,
                    &rejection(ErrorKind::Policy, "expected `message`, `stop` or `voice_toggle`"),
                )
                .await;
            }
        }
    }

    state.orchestrator.close_session(&session_id);
    turns.abort_all();
    drop(out_tx);
    writer.abort();
    tracing::info!(%session_id, "websocket client disconnected");
}

/// Run one turn and forward its events until the terminal one.
async fn stream_turn(state: Arc<AppState>, request: TurnRequest, out: mpsc::Sender<String>) {
    let mut stream = match state.orchestrator.handle(request).await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::debug!(error = %e, "turn rejected");
            send(&out, &rejection(e.kind(), e.to_string())).await;
            return;
        }
    };
    while let Some(event) = stream.next().await {
        let terminal = event.is_terminal();
        // A gone client drops the stream, which cancels the turn.
        if !send(&out, &event).await || terminal {
            break;
        }
    }
}

/// Serialize a frame and queue it for the socket. Returns `false` once the
/// writer is gone.
async fn send(out: &mpsc::Sender<String>, frame: &impl Serialize) -> bool {
    match serde_json::to_string(frame) {
        Ok(json) => out.send(json).await.is_ok(),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode websocket frame");
            false
        }
    }
}
