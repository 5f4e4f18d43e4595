//! drover daemon — loads configuration, builds the orchestration engine,
//! and runs the scheduler until interrupted.

use anyhow::{Context, Result};
use tracing::info;

use dr_core::config::Config;
use dr_engine::daemon::Daemon;

#[tokio::main]
async fn main() -> Result<()> {
    let format = if std::env::var("DROVER_LOG_JSON").is_ok() {
        dr_telemetry::LogFormat::Json
    } else {
        dr_telemetry::LogFormat::Text
    };
    dr_telemetry::init("droverd", "info", format);

    // `droverd [config.toml]`
    let config = match std::env::args().nth(1) {
        Some(path) => Config::load_from(&path).with_context(|| format!("loading {path}"))?,
        None => Config::load().context("loading default config")?,
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        max_concurrent = config.engine.max_concurrent,
        adapters = config.adapters.len(),
        profiles = config.profiles.len(),
        "droverd starting"
    );

    let daemon = Daemon::new(config).context("failed to build daemon")?;

    let shutdown = daemon.shutdown_handle();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            return;
        }
        info!("ctrl-c received, initiating shutdown");
        shutdown.trigger("ctrl-c");
    });

    daemon.run().await
}
