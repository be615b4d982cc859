//! Streaming Text-to-Speech client.
//!
//! Accepts text fragments, forwards them to the remote synthesizer over a
//! persistent WebSocket, and surfaces synthesized audio frames plus a
//! `Flushed` control event through an unbounded channel. Audio frames are
//! forwarded to the channel the instant they arrive — no rebuffering inside
//! this client, per §4.2.
//!
//! Grounded in `original_source/voice_caller/src/tts_handler.py` (`FLUSH_CHARS`,
//! `send_text`/`stream_text`/`flush`/`cancel`/`reset_cancel` semantics) and the
//! teacher's outbound-WebSocket shape in `messaging/slack.rs`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info};

use crate::config::DeepgramConfig;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;

/// Sentence-boundary characters that trigger an implicit flush (§4.2).
const FLUSH_CHARS: [char; 5] = ['.', '!', '?', ':', ';'];

/// Events emitted by the TTS client.
#[derive(Debug, Clone)]
pub enum TtsEvent {
    /// A synthesized audio frame (µ-law 8 kHz), delivered immediately.
    Audio(Vec<u8>),
    /// The remote has emitted all buffered audio following a `flush()`.
    Flushed,
}

/// Streams text into the remote synthesizer; supports mid-utterance clear.
pub struct TtsClient {
    sink: Arc<Mutex<WsSink>>,
    connected: Arc<AtomicBool>,
    cancelled: Arc<AtomicBool>,
}

impl TtsClient {
    /// Open a persistent connection to the TTS service.
    pub async fn connect(config: &DeepgramConfig) -> Result<(Self, UnboundedReceiver<TtsEvent>)> {
        let url = format!(
            "wss://api.deepgram.com/v1/speak?model={model}&encoding={encoding}&sample_rate={rate}",
            model = config.tts_model,
            encoding = config.encoding,
            rate = config.sample_rate,
        );

        let mut request = url
            .as_str()
            .into_client_request()
            .context("failed to build TTS connection request")?;
        request.headers_mut().insert(
            "Authorization",
            format!("token {}", config.api_key)
                .parse()
                .context("invalid TTS api key header")?,
        );

        let (ws_stream, _) = connect_async(request)
            .await
            .context("failed to connect to TTS service")?;
        info!("connected to TTS service");

        let (sink, mut stream) = ws_stream.split();
        let (tx, rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(true));
        let cancelled = Arc::new(AtomicBool::new(false));
        let connected_task = connected.clone();
        let cancelled_task = cancelled.clone();

        tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                let message = match message {
                    Ok(m) => m,
                    Err(e) => {
                        error!("TTS connection error: {}", e);
                        break;
                    }
                };

                match message {
                    WsMessage::Binary(bytes) => {
                        // Late audio after cancel is dropped on arrival (§4.4).
                        if cancelled_task.load(Ordering::SeqCst) {
                            continue;
                        }
                        let _ = tx.send(TtsEvent::Audio(bytes.to_vec()));
                    }
                    WsMessage::Text(text) => {
                        let value: Value = match serde_json::from_str(&text) {
                            Ok(v) => v,
                            Err(e) => {
                                debug!("TTS: skipping malformed control message: {}", e);
                                continue;
                            }
                        };
                        match value.get("type").and_then(|t| t.as_str()) {
                            Some("Flushed") => {
                                let _ = tx.send(TtsEvent::Flushed);
                            }
                            Some("Warning") | Some("Metadata") => {
                                debug!("TTS control message: {}", text);
                            }
                            other => debug!("TTS: ignoring message type {:?}", other),
                        }
                    }
                    WsMessage::Close(_) => {
                        debug!("TTS connection closed by remote");
                        break;
                    }
                    _ => {}
                }
            }
            connected_task.store(false, Ordering::SeqCst);
        });

        Ok((
            TtsClient {
                sink: Arc::new(Mutex::new(sink)),
                connected,
                cancelled,
            },
            rx,
        ))
    }

    async fn send_control(&self, payload: Value) -> Result<()> {
        let mut sink = self.sink.lock().await;
        sink.send(WsMessage::Text(payload.to_string().into()))
            .await
            .context("failed to send TTS control message")
    }

    /// Append text to the remote synthesizer; implicitly flushes if `text`
    /// ends with a flush character.
    pub async fn send(&self, text: &str) {
        if text.is_empty() {
            return;
        }
        if !self.connected.load(Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self
            .send_control(json!({"type": "Speak", "text": text}))
            .await
        {
            error!("error sending text to TTS: {}", e);
            self.connected.store(false, Ordering::SeqCst);
            return;
        }
        if text.ends_with(FLUSH_CHARS) {
            self.flush().await;
        }
    }

    /// Pump incoming fragments: sends whenever a fragment ends with a space
    /// or a flush character, then sends any residue followed by an explicit
    /// flush. Stops pumping if cancelled mid-stream.
    pub async fn stream<S>(&self, mut fragments: S)
    where
        S: futures_util::Stream<Item = String> + Unpin,
    {
        let mut buffer = String::new();
        while let Some(fragment) = fragments.next().await {
            if self.cancelled.load(Ordering::SeqCst) {
                info!("TTS streaming cancelled");
                return;
            }
            let ends_with_flush = fragment.chars().last().map(|c| FLUSH_CHARS.contains(&c));
            let ends_with_space = fragment.ends_with(' ');
            buffer.push_str(&fragment);

            if ends_with_space || ends_with_flush.unwrap_or(false) {
                self.send(&std::mem::take(&mut buffer)).await;
            }
        }
        if !buffer.is_empty() && !self.cancelled.load(Ordering::SeqCst) {
            self.send(&buffer).await;
            self.flush().await;
        }
    }

    /// Explicit flush: the remote emits any buffered audio.
    pub async fn flush(&self) {
        if !self.connected.load(Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.send_control(json!({"type": "Flush"})).await {
            error!("error flushing TTS: {}", e);
        }
    }

    /// Instruct the remote to discard all pending synthesis immediately.
    pub async fn clear(&self) {
        if !self.connected.load(Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.send_control(json!({"type": "Clear"})).await {
            error!("error clearing TTS: {}", e);
        }
    }

    /// Local cancellation: sets the cancel flag, issues `clear()`, and stops
    /// `stream()`/future `send()` pumping until `reset_cancel()`.
    pub async fn cancel(&self) {
        info!("cancelling TTS");
        self.cancelled.store(true, Ordering::SeqCst);
        self.clear().await;
    }

    /// Reset the cancel flag for the next generation.
    pub fn reset_cancel(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Close the connection. Idempotent; errors are logged, not propagated.
    pub async fn close(&self) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.close().await {
            debug!("error closing TTS stream: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::FLUSH_CHARS;

    #[test]
    fn flush_chars_match_spec() {
        for c in ['.', '!', '?', ':', ';'] {
            assert!(FLUSH_CHARS.contains(&c));
        }
        assert!(!FLUSH_CHARS.contains(&','));
    }
}
