//! Process entry point: load configuration, wire up the Telnyx/session
//! stack, and either place an outbound call before serving or just serve.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use tracing::{error, info};

use callvoice::cli;
use callvoice::config::Config;
use callvoice::llm::bootstrap_call;
use callvoice::server::{self, ServerState};
use callvoice::session_manager::SessionManager;
use callvoice::telephony::TelnyxClient;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = cli::parse();

    let filter = if cli.debug {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = Config::load()?;
    if let Some(host) = cli.host.clone() {
        config.server.host = host;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }

    let mut deepgram = config.deepgram.clone();
    if let Some(voice) = cli.voice.clone() {
        deepgram.tts_model = voice;
    }

    let telnyx = Arc::new(TelnyxClient::new(
        config.telnyx.clone(),
        config.server.public_ws_url.clone(),
    ));
    let session_manager = SessionManager::new(deepgram, config.bedrock.clone());
    let pending_bootstrap = Arc::new(Mutex::new(None));

    let state = ServerState {
        session_manager,
        telnyx: telnyx.clone(),
        default_purpose: Arc::from(cli.purpose.as_str()),
        pending_bootstrap: pending_bootstrap.clone(),
    };

    if !cli.server_only {
        if let Some(to) = cli.to.clone() {
            let mut bootstrap = bootstrap_call(&config.bedrock, &cli.purpose).await;
            if let Some(system_prompt) = cli.system_prompt.clone() {
                bootstrap.system_prompt = system_prompt;
            }
            *pending_bootstrap.lock().unwrap() = Some(bootstrap);

            match telnyx.initiate_call(&to, cli.from.as_deref()).await {
                Ok(call) => info!("outbound call placed: {}", call.call_control_id),
                Err(e) => {
                    error!("failed to place outbound call: {:#}", e);
                    std::process::exit(1);
                }
            }
        } else {
            error!("--to is required unless --server-only is set");
            std::process::exit(1);
        }
    }

    if let Err(e) = server::start(&config, state).await {
        error!("server exited with an error: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}
