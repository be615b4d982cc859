//! Configuration management
//!
//! Loads all external-service credentials and tunables from environment
//! variables (optionally via a `.env` file in the working directory, loaded
//! with `dotenvy` before the process environment is consulted).

use anyhow::{Context, Result};

fn required_env(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("missing required environment variable: {}", key))
}

fn optional_env(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn optional_env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn optional_env_u16(key: &str, default: u16) -> u16 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn optional_env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Telnyx telephony configuration.
#[derive(Debug, Clone)]
pub struct TelnyxConfig {
    pub api_key: String,
    pub connection_id: String,
    pub phone_number: String,
}

/// Deepgram STT/TTS configuration.
#[derive(Debug, Clone)]
pub struct DeepgramConfig {
    pub api_key: String,
    pub stt_model: String,
    pub tts_model: String,
    pub sample_rate: u32,
    pub encoding: String,
    pub endpointing_ms: u32,
    pub utterance_end_ms: u32,
}

/// Amazon Bedrock LLM configuration.
#[derive(Debug, Clone)]
pub struct BedrockConfig {
    pub api_key: String,
    pub region: String,
    pub model_id: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// HTTP/WebSocket server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub public_ws_url: String,
}

/// Top-level process configuration, loaded once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub telnyx: TelnyxConfig,
    pub deepgram: DeepgramConfig,
    pub bedrock: BedrockConfig,
    pub server: ServerConfig,
}

impl Config {
    /// Load and validate all configuration from environment variables,
    /// after loading an optional `.env` file from the working directory.
    pub fn load() -> Result<Self> {
        // Best-effort: a missing .env file is not an error, the process
        // environment is consulted either way.
        let _ = dotenvy::dotenv();

        Ok(Config {
            telnyx: TelnyxConfig {
                api_key: required_env("TELNYX_API_KEY")?,
                connection_id: required_env("TELNYX_CONNECTION_ID")?,
                phone_number: required_env("TELNYX_PHONE_NUMBER")?,
            },
            deepgram: DeepgramConfig {
                api_key: required_env("DEEPGRAM_API_KEY")?,
                stt_model: optional_env("DEEPGRAM_STT_MODEL", "nova-2"),
                tts_model: optional_env("DEEPGRAM_TTS_MODEL", "aura-2-thalia-en"),
                sample_rate: 8000,
                encoding: "mulaw".to_string(),
                endpointing_ms: optional_env_u32("DEEPGRAM_ENDPOINTING_MS", 300),
                utterance_end_ms: optional_env_u32("DEEPGRAM_UTTERANCE_END_MS", 1000),
            },
            bedrock: BedrockConfig {
                api_key: required_env("BEDROCK_API_KEY")?,
                region: optional_env("AWS_REGION", "us-east-1"),
                model_id: optional_env("BEDROCK_MODEL_ID", "us.amazon.nova-pro-v1:0"),
                max_tokens: optional_env_u32("BEDROCK_MAX_TOKENS", 50),
                temperature: optional_env_f32("BEDROCK_TEMPERATURE", 0.7),
            },
            server: ServerConfig {
                host: optional_env("SERVER_HOST", "0.0.0.0"),
                port: optional_env_u16("SERVER_PORT", 8765),
                public_ws_url: required_env("PUBLIC_WS_URL")?,
            },
        })
    }
}
