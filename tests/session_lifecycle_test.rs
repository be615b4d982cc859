//! Integration tests spanning `session_manager` + `session` + `audio`: the
//! paths that don't require a live STT/TTS/LLM connection (the connect
//! handshake itself is covered by `stt`/`tts`'s own unit tests).

use callvoice::config::{BedrockConfig, DeepgramConfig};
use callvoice::llm::Bootstrap;
use callvoice::session::Phase;
use callvoice::session_manager::SessionManager;

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

fn bootstrap() -> Bootstrap {
    Bootstrap {
        system_prompt: "be helpful".to_string(),
        greeting: "hi there".to_string(),
    }
}

#[tokio::test]
async fn a_call_buffers_audio_while_connecting_and_tears_down_cleanly() {
    let manager = SessionManager::new(deepgram_config(), bedrock_config());
    let session = manager
        .create(
            "stream-a".to_string(),
            "call-a".to_string(),
            "confirm a delivery",
            Some(bootstrap()),
        )
        .await;

    assert_eq!(session.phase(), Phase::Connecting);

    manager.handle_media("stream-a", &base64_of(&[1, 2, 3])).await;
    manager.handle_media("stream-a", &base64_of(&[4, 5, 6])).await;
    assert_eq!(session.pre_greeting_buffer_len(), 2);

    manager.close("stream-a").await;
    assert_eq!(session.phase(), Phase::Terminated);
    assert!(!session.is_active());
    assert_eq!(manager.active_count(), 0);
}

#[tokio::test]
async fn closing_a_session_is_idempotent() {
    let manager = SessionManager::new(deepgram_config(), bedrock_config());
    manager
        .create(
            "stream-b".to_string(),
            "call-b".to_string(),
            "a reminder call",
            Some(bootstrap()),
        )
        .await;

    manager.close("stream-b").await;
    manager.close("stream-b").await;
    assert_eq!(manager.active_count(), 0);
}

#[tokio::test]
async fn unknown_stream_media_is_dropped_without_panicking() {
    let manager = SessionManager::new(deepgram_config(), bedrock_config());
    manager.handle_media("never-created", &base64_of(&[0])).await;
    assert_eq!(manager.active_count(), 0);
}

#[tokio::test]
async fn two_concurrent_calls_are_tracked_independently() {
    let manager = SessionManager::new(deepgram_config(), bedrock_config());
    manager
        .create("stream-c".to_string(), "call-c".to_string(), "call one", Some(bootstrap()))
        .await;
    manager
        .create("stream-d".to_string(), "call-d".to_string(), "call two", Some(bootstrap()))
        .await;
    assert_eq!(manager.active_count(), 2);

    manager.close("stream-c").await;
    assert_eq!(manager.active_count(), 1);
    assert!(manager.get("stream-d").is_some());
}

fn base64_of(bytes: &[u8]) -> String {
    callvoice::audio::base64_encode(bytes)
}
