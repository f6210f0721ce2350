//! Effects relay demo
//!
//! Runs a complete session in one process over the loopback transport: a
//! "browser" participant publishes a test-pattern camera, the effects worker
//! relays it through the configured transform, and the browser displays the
//! processed track. Prompts can be sent from the web UI.
//!
//! Usage: `relay-demo [config.toml]`

use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use effects_relay::{
    config::AppConfig,
    relay::{build_transform, EffectsRelay},
    session::SessionManager,
    transport::LoopbackHub,
    ui::{AppState, WebServer},
    video::{DisplaySinks, FrameCounterSink, TestPatternCapture},
};

const BROWSER_IDENTITY: &str = "browser";

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting effects relay demo");

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = AppConfig::load(config_path.as_deref())?;

    let hub = LoopbackHub::new(&config.session.server_address);
    let transport = Arc::new(hub.transport());

    // Processing participant
    let worker = SessionManager::new(transport.clone(), config.clone());
    let worker_token = hub.issue_token(&config.session.identity);
    worker.connect(&config.session.server_address, &worker_token).await?;
    let relay = EffectsRelay::start(worker.clone(), build_transform(&config.transform));

    // Browser side: camera out, processed track in
    let browser = SessionManager::new(transport, config.clone());
    let browser_token = hub.issue_token(BROWSER_IDENTITY);
    browser.connect(&config.session.server_address, &browser_token).await?;

    let display = Arc::new(DisplaySinks::new(browser.clone()));
    let _display_subscription = {
        let display = display.clone();
        let worker_identity = config.session.identity.clone();
        browser.on_remote_track_available(move |track| {
            if track.participant != worker_identity || !track.is_video() {
                return;
            }
            let display = display.clone();
            let track_id = track.id.clone();
            tokio::spawn(async move {
                let sink = Arc::new(FrameCounterSink::new(track_id.as_str(), 150));
                if let Err(e) = display.attach(&track_id, sink).await {
                    tracing::warn!("Cannot display {}: {}", track_id, e);
                }
            });
        })
    };

    let camera = browser
        .publish_local_track(
            Box::new(TestPatternCapture::new("test-pattern")),
            config.publish.clone(),
        )
        .await?;
    tracing::info!(
        "Camera published as {} ({}x{} @ {} fps)",
        camera.id,
        config.publish.width,
        config.publish.height,
        config.publish.frame_rate
    );

    let web_handle = WebServer::new(config.ui.clone(), AppState::new(browser.clone())).start_background();
    tracing::info!(
        "Web UI available at http://{}:{}",
        config.ui.bind_address,
        config.ui.http_port
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");

    web_handle.abort();
    display.detach_all();
    browser.disconnect().await;
    relay.stop().await;
    worker.disconnect().await;

    Ok(())
}
