//! Streaming Speech-to-Text client.
//!
//! Streams 8 kHz mono µ-law audio frames to the remote STT service over a
//! persistent WebSocket and surfaces transcript/voice-activity events back to
//! the caller through an unbounded channel, rather than nested callbacks —
//! the Session drives its state machine off this channel alongside the TTS
//! event channel and its own WebSocket receive loop.
//!
//! Grounded in `original_source/voice_caller/src/stt_handler.py`'s event
//! semantics (`transcript_parts`/`current_interim` bookkeeping, `speech_ended`
//! consolidation) and the teacher's outbound-WebSocket shape in
//! `messaging/slack.rs`'s `socket_mode::start_socket_mode`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::config::DeepgramConfig;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;

/// Events emitted by the STT client, in arrival order.
#[derive(Debug, Clone)]
pub enum SttEvent {
    /// Remote VAD detected voice onset.
    SpeechStarted,
    /// Partial, non-final text since the last reset.
    InterimTranscript(String),
    /// A finalized segment; `speech_final` signals end-of-utterance.
    FinalTranscript { text: String, speech_final: bool },
    /// Backup end-of-utterance signal from endpointing silence.
    UtteranceEnd,
    /// Consolidated end-of-utterance transcript, emitted alongside
    /// `FinalTranscript{speech_final: true}` or `UtteranceEnd`.
    SpeechEnded(String),
}

/// Streams outbound audio to the remote STT service; parses inbound events.
pub struct SttClient {
    sink: Arc<Mutex<WsSink>>,
    connected: Arc<AtomicBool>,
    audio_count: Arc<std::sync::atomic::AtomicU64>,
}

impl SttClient {
    /// Open a persistent connection to the STT service, configured with
    /// interim results, endpointing, utterance-end, VAD events, and smart
    /// formatting all on, per §4.1.
    pub async fn connect(config: &DeepgramConfig) -> Result<(Self, UnboundedReceiver<SttEvent>)> {
        let url = format!(
            "wss://api.deepgram.com/v1/listen?model={model}&encoding={encoding}&sample_rate={rate}&channels=1&interim_results=true&endpointing={endpointing}&utterance_end_ms={utterance_end}&vad_events=true&smart_format=true",
            model = config.stt_model,
            encoding = config.encoding,
            rate = config.sample_rate,
            endpointing = config.endpointing_ms,
            utterance_end = config.utterance_end_ms,
        );

        let mut request = url
            .as_str()
            .into_client_request()
            .context("failed to build STT connection request")?;
        request.headers_mut().insert(
            "Authorization",
            format!("token {}", config.api_key)
                .parse()
                .context("invalid STT api key header")?,
        );

        let (ws_stream, _) = connect_async(request)
            .await
            .context("failed to connect to STT service")?;
        info!("connected to STT service");

        let (sink, mut stream) = ws_stream.split();
        let (tx, rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(true));
        let connected_task = connected.clone();

        tokio::spawn(async move {
            let mut transcript_parts: Vec<String> = Vec::new();
            let mut current_interim = String::new();

            while let Some(message) = stream.next().await {
                let message = match message {
                    Ok(m) => m,
                    Err(e) => {
                        error!("STT connection error: {}", e);
                        break;
                    }
                };

                let text = match message {
                    WsMessage::Text(t) => t,
                    WsMessage::Close(_) => {
                        debug!("STT connection closed by remote");
                        break;
                    }
                    _ => continue,
                };

                let value: Value = match serde_json::from_str(&text) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!("STT: skipping malformed message: {}", e);
                        continue;
                    }
                };

                match value.get("type").and_then(|t| t.as_str()) {
                    Some("Results") => {
                        let transcript = value
                            .get("channel")
                            .and_then(|c| c.get("alternatives"))
                            .and_then(|a| a.get(0))
                            .and_then(|alt| alt.get("transcript"))
                            .and_then(|t| t.as_str())
                            .unwrap_or("");
                        if transcript.is_empty() {
                            continue;
                        }
                        let is_final = value
                            .get("is_final")
                            .and_then(|v| v.as_bool())
                            .unwrap_or(false);
                        let speech_final = value
                            .get("speech_final")
                            .and_then(|v| v.as_bool())
                            .unwrap_or(false);

                        if is_final {
                            transcript_parts.push(transcript.to_string());
                            let _ = tx.send(SttEvent::FinalTranscript {
                                text: transcript.to_string(),
                                speech_final,
                            });
                        } else {
                            current_interim = transcript.to_string();
                            let _ = tx.send(SttEvent::InterimTranscript(transcript.to_string()));
                        }

                        if speech_final {
                            let full = transcript_parts.join(" ").trim().to_string();
                            if !full.is_empty() {
                                let _ = tx.send(SttEvent::SpeechEnded(full));
                            }
                            transcript_parts.clear();
                            current_interim.clear();
                        }
                    }
                    Some("SpeechStarted") => {
                        let _ = tx.send(SttEvent::SpeechStarted);
                    }
                    Some("UtteranceEnd") => {
                        let _ = tx.send(SttEvent::UtteranceEnd);
                        let full = transcript_parts.join(" ").trim().to_string();
                        if !full.is_empty() {
                            let _ = tx.send(SttEvent::SpeechEnded(full));
                        }
                        transcript_parts.clear();
                        current_interim.clear();
                    }
                    other => {
                        debug!("STT: ignoring message type {:?}", other);
                    }
                }
            }

            connected_task.store(false, Ordering::SeqCst);
        });

        Ok((
            SttClient {
                sink: Arc::new(Mutex::new(sink)),
                connected,
                audio_count: Arc::new(std::sync::atomic::AtomicU64::new(0)),
            },
            rx,
        ))
    }

    /// Send raw µ-law audio bytes. Silently dropped if not connected; never
    /// surfaces an error to the caller (§4.1 "the client never throws").
    pub async fn send_audio(&self, data: &[u8]) {
        if !self.connected.load(Ordering::SeqCst) {
            return;
        }
        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.send(WsMessage::Binary(data.to_vec().into())).await {
            error!("error sending audio to STT: {}", e);
            self.connected.store(false, Ordering::SeqCst);
            return;
        }
        let count = self.audio_count.fetch_add(1, Ordering::Relaxed) + 1;
        if count == 1 || count % 500 == 0 {
            info!("sent {} audio chunks to STT", count);
        }
    }

    /// True if the underlying connection is believed to be usable.
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
            debug!("error closing STT stream: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result_message(transcript: &str, is_final: bool, speech_final: bool) -> Value {
        serde_json::json!({
            "type": "Results",
            "is_final": is_final,
            "speech_final": speech_final,
            "channel": {
                "alternatives": [{ "transcript": transcript }]
            }
        })
    }

    #[test]
    fn results_message_shape_matches_deepgram_wire_format() {
        let v = result_message("hello there", true, true);
        assert_eq!(v["type"], "Results");
        assert_eq!(
            v["channel"]["alternatives"][0]["transcript"],
            "hello there"
        );
    }
}
