//! HTTP/WebSocket server: the telephony media endpoint and Telnyx webhook.
//!
//! Grounded in the teacher's `Router`/`ServerState`/`TraceLayer` wiring
//! (`axum::serve` over a `TcpListener`, `WebSocketUpgrade` extractor), with
//! the per-connection drain+receive loop and webhook dispatch drawn from
//! `original_source/voice_caller/src/websocket_server.py` and
//! `call_manager.py`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::audio;
use crate::config::Config;
use crate::llm::Bootstrap;
use crate::session_manager::SessionManager;
use crate::telephony::{TelnyxClient, WebhookEvent};

/// Drain up to this many TTS frames per outer loop iteration (§4.4).
const DRAIN_FRAMES_PER_ITER: usize = 5;
/// Poll timeout for the inbound receive side of the alternating drain+receive
/// loop (§4.6).
const RECEIVE_POLL_TIMEOUT: Duration = Duration::from_millis(50);

#[derive(Clone)]
pub struct ServerState {
    pub session_manager: Arc<SessionManager>,
    pub telnyx: Arc<TelnyxClient>,
    /// Used to run the bootstrap (§4.3) for calls that arrive without a
    /// pre-generated system prompt/greeting, e.g. purely inbound calls.
    pub default_purpose: Arc<str>,
    /// The bootstrap computed by the CLI's outbound-call flow before placing
    /// the call, consumed by the first `start` frame that arrives (there is
    /// only ever one in-flight outbound call). `None` for every session after
    /// that, and for server-only/inbound-only runs where `create` bootstraps
    /// itself.
    pub pending_bootstrap: Arc<std::sync::Mutex<Option<Bootstrap>>>,
}

pub async fn start(config: &Config, state: ServerState) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("invalid server host/port")?;

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/ws/media", get(media_ws_handler))
        .route("/webhook", post(webhook_handler))
        .route("/health", get(health_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    info!("listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    axum::serve(listener, app)
        .await
        .context("server exited with an error")?;
    Ok(())
}

async fn health_handler() -> &'static str {
    "ok"
}

async fn media_ws_handler(ws: WebSocketUpgrade, State(state): State<ServerState>) -> Response {
    ws.on_upgrade(|socket| handle_media_socket(socket, state))
}

/// Top-level shape of inbound telephony WebSocket frames (§6). Fields not
/// relevant to a given `event` are simply absent.
#[derive(Debug, Deserialize)]
struct InboundFrame {
    event: String,
    #[serde(default)]
    stream_id: Option<String>,
    #[serde(default)]
    call_control_id: Option<String>,
    #[serde(default)]
    media: Option<MediaFrame>,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MediaFrame {
    #[serde(default)]
    track: Option<String>,
    #[serde(default)]
    payload: Option<String>,
}

/// One telephony connection, one coroutine: drain outbound TTS audio, then
/// poll for an inbound frame, repeat (§4.6). No separate writer task and no
/// lock coordinates the two sides — both run in this same loop.
async fn handle_media_socket(socket: WebSocket, state: ServerState) {
    let (mut sender, mut receiver) = socket.split();
    let mut stream_id: Option<String> = None;

    loop {
        if let Some(id) = stream_id.as_deref() {
            if let Some(session) = state.session_manager.get(id) {
                if session.take_clear_pending() {
                    let clear = json!({"event": "clear", "stream_id": id});
                    if sender.send(Message::Text(clear.to_string().into())).await.is_err() {
                        break;
                    }
                }
                for _ in 0..DRAIN_FRAMES_PER_ITER {
                    let Some(frame) = session.pop_tts_frame() else {
                        break;
                    };
                    let out = json!({
                        "event": "media",
                        "stream_id": id,
                        "media": {"payload": audio::base64_encode(&frame)},
                    });
                    if sender.send(Message::Text(out.to_string().into())).await.is_err() {
                        warn!("failed to write media frame for {}, closing", id);
                        break;
                    }
                    session.note_tts_frame_sent();
                }
            }
        }

        let next = tokio::time::timeout(RECEIVE_POLL_TIMEOUT, receiver.next()).await;
        let message = match next {
            Err(_) => continue, // poll timeout, loop back to draining
            Ok(None) => break,  // connection closed
            Ok(Some(Err(e))) => {
                warn!("media socket error: {}", e);
                break;
            }
            Ok(Some(Ok(message))) => message,
        };

        match message {
            Message::Text(text) => {
                if !handle_inbound_frame(&text, &mut stream_id, &state).await {
                    break;
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    if let Some(id) = stream_id {
        state.session_manager.close(&id).await;
    }
}

/// Dispatch one decoded inbound frame. Returns `false` when the connection
/// should be torn down (a `stop` event).
async fn handle_inbound_frame(text: &str, stream_id: &mut Option<String>, state: &ServerState) -> bool {
    let frame: InboundFrame = match serde_json::from_str(text) {
        Ok(f) => f,
        Err(e) => {
            warn!("failed to parse telephony frame: {}", e);
            return true;
        }
    };

    match frame.event.as_str() {
        "connected" => {
            debug!("telephony media socket connected");
        }
        "start" => {
            let id = frame.stream_id.unwrap_or_default();
            let call_id = frame
                .call_control_id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            info!("call started: stream_id={}, call_id={}", id, call_id);
            let bootstrap = state.pending_bootstrap.lock().unwrap().take();
            state
                .session_manager
                .create(id.clone(), call_id, &state.default_purpose, bootstrap)
                .await;
            *stream_id = Some(id);
        }
        "media" => {
            let Some(id) = stream_id.as_deref() else {
                warn!("media frame received before start");
                return true;
            };
            if let Some(media) = frame.media {
                if media.track.as_deref().unwrap_or("inbound") != "inbound" {
                    return true;
                }
                if let Some(payload) = media.payload {
                    state.session_manager.handle_media(id, &payload).await;
                }
            }
        }
        "stop" => {
            info!("call stopped: stream_id={:?}", stream_id);
            if let Some(id) = stream_id.take() {
                state.session_manager.close(&id).await;
            }
            return false;
        }
        "mark" => {
            debug!("telephony mark event: {:?}", frame.name);
        }
        other => {
            debug!("ignoring unknown telephony event: {}", other);
        }
    }
    true
}

/// Telnyx call-control webhook (§6). `call.answered` starts media streaming
/// on the now-answered call; `call.machine.detection.ended` hangs up
/// immediately on a detected answering machine instead of streaming to it.
async fn webhook_handler(State(state): State<ServerState>, Json(event): Json<WebhookEvent>) -> StatusCode {
    let event_type = event.data.event_type.clone();
    let payload = event.data.payload;

    let Some(outcome) = state.telnyx.handle_webhook_event(&event_type, &payload) else {
        return StatusCode::OK;
    };
    let call_control_id = outcome.call_control_id;

    if let Some(stream_id) = outcome.stream_id_to_close {
        state.session_manager.close(&stream_id).await;
    }

    match event_type.as_str() {
        "call.answered" => {
            let telnyx = state.telnyx.clone();
            tokio::spawn(async move {
                if let Err(e) = telnyx.start_media_streaming(&call_control_id).await {
                    error!("failed to start media streaming for {}: {:#}", call_control_id, e);
                }
            });
        }
        "call.machine.detection.ended" => {
            if payload.result.as_deref() == Some("machine") {
                info!("answering machine detected on {}, hanging up", call_control_id);
                let telnyx = state.telnyx.clone();
                tokio::spawn(async move { telnyx.hangup(&call_control_id).await });
            }
        }
        _ => {}
    }

    StatusCode::OK
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbound_frame_parses_start_event() {
        let raw = r#"{"event":"start","stream_id":"s1","call_control_id":"c1"}"#;
        let frame: InboundFrame = serde_json::from_str(raw).unwrap();
        assert_eq!(frame.event, "start");
        assert_eq!(frame.stream_id.as_deref(), Some("s1"));
    }

    #[test]
    fn inbound_frame_parses_media_event() {
        let raw = r#"{"event":"media","media":{"track":"inbound","payload":"AAAA"}}"#;
        let frame: InboundFrame = serde_json::from_str(raw).unwrap();
        assert_eq!(frame.event, "media");
        assert_eq!(frame.media.unwrap().track.as_deref(), Some("inbound"));
    }
}
