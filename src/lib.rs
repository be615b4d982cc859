//! callvoice - real-time telephone voice-agent orchestration engine.
//!
//! Bridges a Telnyx call's media WebSocket to Deepgram speech-to-text,
//! Amazon Bedrock for response generation, and Deepgram text-to-speech,
//! with barge-in support so a caller can interrupt mid-response.

pub mod audio;
pub mod config;
pub mod cli;
pub mod telephony;
pub mod stt;
pub mod tts;
pub mod llm;
pub mod session;
pub mod session_manager;
pub mod server;

pub use config::Config;
pub use session::Session;
pub use session_manager::SessionManager;

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name.
pub const NAME: &str = env!("CARGO_PKG_NAME");
