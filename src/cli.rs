//! Command-line interface.
//!
//! Grounded in the teacher's `clap::Parser` derive usage, simplified to this
//! crate's flat flag set (no subcommands): either place an outbound call and
//! then serve, or (with `--server-only`) just serve so an externally-placed
//! call or separate dialer can connect.

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "callvoice")]
#[command(about = "Real-time telephone voice-agent orchestration engine", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Destination number to call, in E.164 format (e.g. +15551234567).
    /// Omit together with --server-only to just host the server.
    #[arg(long)]
    pub to: Option<String>,

    /// Caller ID to place the call from. Defaults to TELNYX_PHONE_NUMBER.
    #[arg(long, env = "TELNYX_PHONE_NUMBER")]
    pub from: Option<String>,

    /// Natural-language description of why this call is being made, used to
    /// generate the system prompt and opening greeting.
    #[arg(long, default_value = "a phone call")]
    pub purpose: String,

    /// Override the generated system prompt entirely.
    #[arg(long)]
    pub system_prompt: Option<String>,

    /// Deepgram TTS voice model, e.g. aura-2-thalia-en. Overrides
    /// DEEPGRAM_TTS_MODEL for this process only.
    #[arg(long)]
    pub voice: Option<String>,

    /// Skip outbound call placement; only start the HTTP/WebSocket server.
    #[arg(long)]
    pub server_only: bool,

    /// Override the server bind host for this process only.
    #[arg(long, env = "SERVER_HOST")]
    pub host: Option<String>,

    /// Override the server bind port for this process only.
    #[arg(long, env = "SERVER_PORT")]
    pub port: Option<u16>,

    /// Raise the tracing filter to debug.
    #[arg(long)]
    pub debug: bool,
}

pub fn parse() -> Cli {
    Cli::parse()
}
