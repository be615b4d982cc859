//! Global registry mapping telephony stream IDs to their `Session`.
//!
//! Grounded in `original_source/voice_caller/src/websocket_server.py`'s
//! `SessionManager` (one entry per active call, created on `start`, looked up
//! on `media`, torn down on `stop`) and the teacher's `Arc<Mutex<HashMap<..>>>`
//! registry shape used for connected clients in `server/mod.rs`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{error, info, warn};

use crate::audio;
use crate::config::{BedrockConfig, DeepgramConfig};
use crate::llm::{bootstrap_call, Bootstrap};
use crate::session::Session;
use crate::stt::SttClient;
use crate::tts::TtsClient;

/// Registry of in-flight call sessions, keyed by telephony `stream_id`.
pub struct SessionManager {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    deepgram: DeepgramConfig,
    bedrock: BedrockConfig,
}

impl SessionManager {
    pub fn new(deepgram: DeepgramConfig, bedrock: BedrockConfig) -> Arc<SessionManager> {
        Arc::new(SessionManager {
            sessions: Mutex::new(HashMap::new()),
            deepgram,
            bedrock,
        })
    }

    /// Register a new Session for `stream_id` and kick off the STT/TTS
    /// connect in the background. The session is inserted before the connect
    /// resolves so inbound audio arriving in the meantime is buffered by its
    /// `Connecting`-phase gate rather than dropped for lack of a home.
    ///
    /// `bootstrap` is the pre-generated `(system_prompt, greeting)` pair from
    /// the outbound-call flow (§4.3); when absent (inbound-only / server-only
    /// mode with no prior call-placement step), the bootstrap runs here so an
    /// inbound call still gets a tailored greeting instead of a canned one.
    pub async fn create(
        self: &Arc<Self>,
        stream_id: String,
        call_id: String,
        purpose: &str,
        bootstrap: Option<Bootstrap>,
    ) -> Arc<Session> {
        let bootstrap = match bootstrap {
            Some(b) => b,
            None => bootstrap_call(&self.bedrock, purpose).await,
        };

        let session = Session::new(
            call_id,
            stream_id.clone(),
            bootstrap.greeting,
            Some(bootstrap.system_prompt),
            self.bedrock.clone(),
        );
        self.sessions
            .lock()
            .unwrap()
            .insert(stream_id.clone(), session.clone());

        let manager = self.clone();
        let session_for_connect = session.clone();
        tokio::spawn(async move {
            manager.connect_and_begin(stream_id, session_for_connect).await;
        });

        session
    }

    async fn connect_and_begin(&self, stream_id: String, session: Arc<Session>) {
        let (stt_result, tts_result) = tokio::join!(
            SttClient::connect(&self.deepgram),
            TtsClient::connect(&self.deepgram),
        );

        match (stt_result, tts_result) {
            (Ok((stt, stt_rx)), Ok((tts, tts_rx))) => {
                info!("session {} ready: STT and TTS both connected", stream_id);
                session.attach_and_begin(Arc::new(stt), stt_rx, Arc::new(tts), tts_rx);
            }
            (stt_result, tts_result) => {
                if let Err(e) = stt_result {
                    error!("session {} failed to connect STT: {:#}", stream_id, e);
                }
                if let Err(e) = tts_result {
                    error!("session {} failed to connect TTS: {:#}", stream_id, e);
                }
                warn!(
                    "session {} left in Connecting after partial/total connect failure",
                    stream_id
                );
            }
        }
    }

    /// Decode and route an inbound telephony media frame (§4.5 `handle_media`).
    pub async fn handle_media(&self, stream_id: &str, payload_b64: &str) {
        let Some(session) = self.get(stream_id) else {
            warn!("media frame for unknown stream {}", stream_id);
            return;
        };
        let bytes = match audio::base64_decode(payload_b64) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("failed to decode media payload for {}: {}", stream_id, e);
                return;
            }
        };
        session.handle_inbound_audio(bytes).await;
    }

    pub fn get(&self, stream_id: &str) -> Option<Arc<Session>> {
        self.sessions.lock().unwrap().get(stream_id).cloned()
    }

    /// Remove and tear down the session for `stream_id`, if any (§4.5 `close`).
    pub async fn close(&self, stream_id: &str) {
        let session = self.sessions.lock().unwrap().remove(stream_id);
        if let Some(session) = session {
            session.close().await;
        }
    }

    pub fn active_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deepgram_config() -> DeepgramConfig {
        DeepgramConfig {
            api_key: "test".to_string(),
            stt_model: "nova-2".to_string(),
            tts_model: "aura-2-thalia-en".to_string(),
            sample_rate: 8000,
            encoding: "mulaw".to_string(),
            endpointing_ms: 300,
            utterance_end_ms: 1000,
        }
    }

    fn bedrock_config() -> BedrockConfig {
        BedrockConfig {
            api_key: "test".to_string(),
            region: "us-east-1".to_string(),
            model_id: "us.amazon.nova-pro-v1:0".to_string(),
            max_tokens: 50,
            temperature: 0.7,
        }
    }

    #[tokio::test]
    async fn create_registers_session_immediately() {
        let manager = SessionManager::new(deepgram_config(), bedrock_config());
        let bootstrap = Bootstrap {
            system_prompt: "be nice".to_string(),
            greeting: "hi".to_string(),
        };
        let session = manager
            .create(
                "stream-1".to_string(),
                "call-1".to_string(),
                "a test call",
                Some(bootstrap),
            )
            .await;
        assert_eq!(manager.active_count(), 1);
        assert!(manager.get("stream-1").is_some());
        assert_eq!(session.phase(), crate::session::Phase::Connecting);
    }

    #[tokio::test]
    async fn close_removes_unknown_session_without_error() {
        let manager = SessionManager::new(deepgram_config(), bedrock_config());
        manager.close("never-existed").await;
        assert_eq!(manager.active_count(), 0);
    }

    #[tokio::test]
    async fn handle_media_for_unknown_stream_is_a_no_op() {
        let manager = SessionManager::new(deepgram_config(), bedrock_config());
        manager.handle_media("unknown", "AAAA").await;
    }
}
