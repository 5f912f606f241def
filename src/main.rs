//! # Voice Chat Widget - Host Process
//!
//! Runs the widget against the real microphone, speaker and remote service,
//! starts a conversation right away and keeps it running until the process
//! is asked to stop.
//!
//! ## What happens at startup:
//! 1. `.env` is loaded, then tracing is initialized
//! 2. Configuration is loaded and validated
//! 3. Audio devices are listed in the logs
//! 4. The widget is launched and told to connect
//!
//! Status changes (connecting, open, speaking, errors) are written to the log.
//! SIGINT or SIGTERM ends the conversation and releases the devices.

use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use voice_chat_widget::config::AppConfig;
use voice_chat_widget::device::{CpalBackend, DeviceSummary};
use voice_chat_widget::websocket::GeminiLiveConnector;
use voice_chat_widget::VoiceWidget;

/// Set once a termination signal has arrived.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is fine
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting voice-chat-widget v{}", env!("CARGO_PKG_VERSION"));
    info!("Model: {}", config.live.model);
    if !config.has_api_key() {
        warn!("No API key configured (GEMINI_API_KEY), connecting will fail");
    }

    DeviceSummary::collect().log();

    let backend = Arc::new(CpalBackend::new(&config.audio));
    let connector = Arc::new(GeminiLiveConnector::from_config(&config));
    let widget = VoiceWidget::launch(config, backend, connector);

    setup_signal_handlers();

    let mut status = widget.status();
    let status_task = tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let current = status.borrow_and_update().clone();
            match &current.error {
                Some(_) => error!("Widget: {}", current.summary()),
                None => info!("Widget: {}", current.summary()),
            }
        }
    });

    widget.connect().await;

    wait_for_shutdown().await;
    info!("Shutdown signal received, ending conversation...");

    widget.disconnect().await;
    widget.shutdown().await;
    status_task.abort();

    info!("Voice widget stopped gracefully");
    Ok(())
}

/// Initialize tracing.
///
/// ## Environment Variables:
/// - `RUST_LOG`: log filter, e.g. `voice_chat_widget=trace` to see every frame
/// - If not set, defaults to `voice_chat_widget=debug`
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_chat_widget=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Listen for SIGTERM and SIGINT (Ctrl+C elsewhere) and raise the shutdown flag.
fn setup_signal_handlers() {
    tokio::spawn(async {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(mut sigterm), Ok(mut sigint)) => {
                    tokio::select! {
                        _ = sigterm.recv() => info!("Received SIGTERM"),
                        _ = sigint.recv() => info!("Received SIGINT"),
                    }
                }
                _ => {
                    warn!("Could not install unix signal handlers, falling back to Ctrl+C");
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        error!("Failed to listen for Ctrl+C: {}", e);
                    }
                }
            }
        }

        #[cfg(not(unix))]
        {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {}", e);
            }
            info!("Received Ctrl+C");
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

/// Wait until the shutdown flag is raised.
async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
