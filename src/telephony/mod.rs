//! Telnyx telephony client: outbound-call placement and inbound-webhook
//! handling.
//!
//! Grounded in `original_source/voice_caller/src/call_manager.py`. The media
//! WebSocket protocol itself (the `start`/`media`/`stop` frames) is handled
//! by `crate::server`; this module only talks to Telnyx's REST API and
//! decodes its webhook payloads.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use crate::config::TelnyxConfig;

const TELNYX_BASE_URL: &str = "https://api.telnyx.com/v2";

/// Answering-machine-detection configuration placed on every outbound call
/// (§6, "a 4 s max detection window").
fn amd_config() -> serde_json::Value {
    json!({
        "after_greeting_silence_millis": 800,
        "between_words_silence_millis": 50,
        "greeting_duration_millis": 3500,
        "initial_silence_millis": 3500,
        "maximum_number_of_words": 5,
        "maximum_word_length_millis": 3500,
        "silence_threshold": 256,
        "total_analysis_time_millis": 4000,
    })
}

/// Tracked state of an outbound call placed by this process.
#[derive(Debug, Clone)]
#[allow(dead_code)]
pub struct CallState {
    pub call_control_id: String,
    pub to_number: String,
    pub from_number: String,
    pub status: String,
    pub stream_id: Option<String>,
}

/// Client for placing outbound Telnyx calls and handling webhooks. One
/// process hosts at most a handful of in-flight outbound calls at a time (the
/// CLI call flow), tracked by `call_control_id`.
pub struct TelnyxClient {
    http: reqwest::Client,
    config: TelnyxConfig,
    public_ws_url: String,
    active_calls: Mutex<HashMap<String, CallState>>,
}

impl TelnyxClient {
    pub fn new(config: TelnyxConfig, public_ws_url: String) -> Self {
        TelnyxClient {
            http: reqwest::Client::new(),
            config,
            public_ws_url,
            active_calls: Mutex::new(HashMap::new()),
        }
    }

    /// Place an outbound call with bidirectional media streaming and
    /// answering-machine detection enabled from the start.
    pub async fn initiate_call(&self, to_number: &str, from_number: Option<&str>) -> Result<CallState> {
        let from_number = from_number
            .map(str::to_string)
            .unwrap_or_else(|| self.config.phone_number.clone());

        info!("initiating call to {} from {}", to_number, from_number);

        let payload = json!({
            "connection_id": self.config.connection_id,
            "to": to_number,
            "from": from_number,
            "answering_machine_detection": "detect",
            "answering_machine_detection_config": amd_config(),
            "stream_url": self.public_ws_url,
            "stream_track": "both_tracks",
            "stream_bidirectional_mode": "rtp",
            "stream_bidirectional_codec": "PCMU",
            "webhook_url_method": "POST",
        });

        let response = self
            .http
            .post(format!("{}/calls", TELNYX_BASE_URL))
            .bearer_auth(&self.config.api_key)
            .json(&payload)
            .send()
            .await
            .context("failed to place outbound call")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Telnyx call placement failed ({}): {}", status, body);
        }

        let body: CallResponse = response
            .json()
            .await
            .context("failed to parse Telnyx call response")?;

        let state = CallState {
            call_control_id: body.data.call_control_id.clone(),
            to_number: to_number.to_string(),
            from_number,
            status: "initiated".to_string(),
            stream_id: None,
        };
        self.active_calls
            .lock()
            .unwrap()
            .insert(state.call_control_id.clone(), state.clone());
        info!("call initiated with control_id: {}", state.call_control_id);
        Ok(state)
    }

    /// Start media streaming for an already-answered call (used when the
    /// stream was not enabled at placement time, or is re-triggered from the
    /// webhook's `call.answered` event).
    pub async fn start_media_streaming(&self, call_control_id: &str) -> Result<()> {
        info!("starting media stream for call {}", call_control_id);

        let payload = json!({
            "stream_url": self.public_ws_url,
            "stream_track": "both_tracks",
            "stream_bidirectional_mode": "rtp",
            "stream_bidirectional_codec": "PCMU",
        });

        let response = self
            .http
            .post(format!(
                "{}/calls/{}/actions/streaming_start",
                TELNYX_BASE_URL, call_control_id
            ))
            .bearer_auth(&self.config.api_key)
            .json(&payload)
            .send()
            .await
            .context("failed to start media streaming")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Telnyx streaming_start failed ({}): {}", status, body);
        }

        if let Some(state) = self.active_calls.lock().unwrap().get_mut(call_control_id) {
            state.status = "streaming".to_string();
        }
        Ok(())
    }

    /// Hang up a call. Errors are logged, not propagated — the media
    /// WebSocket's own `stop` is the primary teardown trigger.
    pub async fn hangup(&self, call_control_id: &str) {
        info!("hanging up call {}", call_control_id);
        let result = self
            .http
            .post(format!(
                "{}/calls/{}/actions/hangup",
                TELNYX_BASE_URL, call_control_id
            ))
            .bearer_auth(&self.config.api_key)
            .send()
            .await;
        if let Err(e) = result {
            warn!("error hanging up call {}: {}", call_control_id, e);
        }
        self.active_calls.lock().unwrap().remove(call_control_id);
    }

    /// Handle a decoded webhook event. Returns `None` if the payload carries
    /// no `call_control_id`. `stream_id_to_close` is set only for
    /// `call.hangup`, when this process knows the associated stream — the
    /// caller uses it to defensively run `SessionManager::close` even if the
    /// media WebSocket's own `stop`/disconnect never arrives.
    pub fn handle_webhook_event(&self, event_type: &str, payload: &WebhookPayload) -> Option<WebhookOutcome> {
        let call_control_id = payload.call_control_id.clone()?;
        let mut calls = self.active_calls.lock().unwrap();

        let mut stream_id_to_close = None;
        match event_type {
            "call.answered" => {
                info!("call {} answered", call_control_id);
                if let Some(state) = calls.get_mut(&call_control_id) {
                    state.status = "answered".to_string();
                }
            }
            "call.hangup" => {
                info!("call {} hung up", call_control_id);
                if let Some(state) = calls.remove(&call_control_id) {
                    stream_id_to_close = state.stream_id;
                }
            }
            "streaming.started" => {
                info!(
                    "streaming started for call {}, stream_id: {:?}",
                    call_control_id, payload.stream_id
                );
                if let Some(state) = calls.get_mut(&call_control_id) {
                    state.stream_id = payload.stream_id.clone();
                }
            }
            "call.machine.detection.ended" => {
                info!(
                    "AMD result for {}: {:?}",
                    call_control_id, payload.result
                );
            }
            other => {
                warn!("unhandled webhook event type: {}", other);
            }
        }

        Some(WebhookOutcome {
            call_control_id,
            stream_id_to_close,
        })
    }
}

/// Result of decoding one webhook event (§6 [ADDED]).
pub struct WebhookOutcome {
    pub call_control_id: String,
    pub stream_id_to_close: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CallResponse {
    data: CallResponseData,
}

#[derive(Debug, Deserialize)]
struct CallResponseData {
    call_control_id: String,
}

/// The `data.payload` portion of a Telnyx webhook event.
#[derive(Debug, Deserialize, Default)]
pub struct WebhookPayload {
    pub call_control_id: Option<String>,
    pub stream_id: Option<String>,
    /// AMD classification for `call.machine.detection.ended`: human/machine/not_sure.
    pub result: Option<String>,
}

/// Top-level Telnyx webhook envelope: `{"data": {"event_type": ..., "payload": ...}}`.
#[derive(Debug, Deserialize)]
pub struct WebhookEvent {
    pub data: WebhookEventData,
}

#[derive(Debug, Deserialize)]
pub struct WebhookEventData {
    pub event_type: String,
    #[serde(default)]
    pub payload: WebhookPayload,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn webhook_event_parses_call_answered() {
        let raw = r#"{"data":{"event_type":"call.answered","payload":{"call_control_id":"abc123"}}}"#;
        let event: WebhookEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(event.data.event_type, "call.answered");
        assert_eq!(event.data.payload.call_control_id.as_deref(), Some("abc123"));
    }

    #[test]
    fn webhook_event_parses_amd_result() {
        let raw = r#"{"data":{"event_type":"call.machine.detection.ended","payload":{"call_control_id":"abc","result":"machine"}}}"#;
        let event: WebhookEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(event.data.payload.result.as_deref(), Some("machine"));
    }

    fn test_client() -> TelnyxClient {
        TelnyxClient::new(
            TelnyxConfig {
                api_key: "test".to_string(),
                connection_id: "conn".to_string(),
                phone_number: "+15550000000".to_string(),
            },
            "wss://example.test/ws/media".to_string(),
        )
    }

    #[test]
    fn hangup_returns_the_streams_id_for_defensive_close() {
        let client = test_client();
        client.active_calls.lock().unwrap().insert(
            "cc1".to_string(),
            CallState {
                call_control_id: "cc1".to_string(),
                to_number: "+15551111111".to_string(),
                from_number: "+15550000000".to_string(),
                status: "streaming".to_string(),
                stream_id: Some("stream-xyz".to_string()),
            },
        );

        let outcome = client
            .handle_webhook_event(
                "call.hangup",
                &WebhookPayload {
                    call_control_id: Some("cc1".to_string()),
                    stream_id: None,
                    result: None,
                },
            )
            .unwrap();

        assert_eq!(outcome.call_control_id, "cc1");
        assert_eq!(outcome.stream_id_to_close.as_deref(), Some("stream-xyz"));
        assert!(client.active_calls.lock().unwrap().get("cc1").is_none());
    }

    #[test]
    fn unknown_event_type_still_returns_call_control_id() {
        let client = test_client();
        let outcome = client
            .handle_webhook_event(
                "call.recording.saved",
                &WebhookPayload {
                    call_control_id: Some("cc2".to_string()),
                    stream_id: None,
                    result: None,
                },
            )
            .unwrap();
        assert_eq!(outcome.call_control_id, "cc2");
        assert!(outcome.stream_id_to_close.is_none());
    }
}
