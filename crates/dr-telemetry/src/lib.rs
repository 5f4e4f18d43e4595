//! Tracing initialisation shared by the drover binaries and tests.

use tracing_subscriber::{fmt, EnvFilter};

/// Output format for diagnostic logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable single-line output.
    #[default]
    Text,
    /// JSON lines, suitable for log shippers.
    Json,
}

/// Initialize the global tracing subscriber.
///
/// Honors `RUST_LOG` when set, otherwise falls back to `default_level`
/// (e.g. "info" or "dr_engine=debug,warn"). Safe to call more than once;
/// subsequent calls are no-ops, so tests can initialise freely.
pub fn init(service: &str, default_level: &str, format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(true)
        .with_line_number(true);

    let installed = match format {
        LogFormat::Text => builder.try_init().is_ok(),
        LogFormat::Json => builder.json().try_init().is_ok(),
    };

    if installed {
        tracing::info!(service, format = ?format, "logging initialised");
    }
}
