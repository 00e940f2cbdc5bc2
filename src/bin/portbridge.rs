//! PortBridge host
//!
//! Usage: `portbridge [settings.json]` (default `portbridge.json`).
//! Exposes the configured port until Ctrl-C, printing status periodically.

use anyhow::Context;
use portbridge::{ExposureOrchestrator, Settings};
use std::time::Duration;
use tokio::time::{MissedTickBehavior, interval};

const DEFAULT_SETTINGS_PATH: &str = "portbridge.json";
const STATUS_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_SETTINGS_PATH.to_string());

    let settings =
        Settings::load(&path).with_context(|| format!("Failed to load settings from {}", path))?;
    settings.validate().context("Invalid settings")?;

    portbridge::init(settings.debug_logging);
    tracing::info!("Loaded settings from {}", path);

    let internal_port = settings.internal_port;
    let external_port = settings.effective_external_port();
    let orchestrator = ExposureOrchestrator::new(settings);
    orchestrator.start(internal_port, external_port);

    let mut ticker = interval(STATUS_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for Ctrl-C")?;
                break;
            }
            _ = ticker.tick() => {
                println!("{}", orchestrator.diagnostics().await);
            }
        }
    }

    tracing::info!("Shutting down");
    orchestrator.shutdown().await;
    println!("{}", orchestrator.diagnostics().await);

    Ok(())
}
