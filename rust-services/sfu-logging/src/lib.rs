//! Structured logging setup for the SFU plugin
//!
//! The host process may load, destroy and re-load the plugin several times,
//! so every initializer here tolerates an already-installed global subscriber.

use serde::Deserialize;
use tracing_subscriber::{
    fmt,
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Output format for log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// JSON formatted logs (for production)
    #[default]
    Json,
    /// Human-readable logs (for development)
    Console,
}

/// Initialize logging in the requested format.
///
/// Returns `false` when a global subscriber was already installed, in which
/// case the existing one keeps receiving events.
pub fn init(service_name: &str, default_level: &str, format: LogFormat) -> bool {
    match format {
        LogFormat::Json => init_logging(service_name, default_level),
        LogFormat::Console => init_console_logging(service_name, default_level),
    }
}

/// Initialize structured JSON logging
///
/// This sets up:
/// - JSON formatted logs
/// - Environment-based log level filtering (`RUST_LOG` wins over `default_level`)
/// - Service name tagging
pub fn init_logging(service_name: &str, default_level: &str) -> bool {
    let env_filter = env_filter(default_level);

    let installed = tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .json()
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .with_current_span(false)
                .with_span_list(false),
        )
        .try_init()
        .is_ok();

    report(service_name, installed, "Logging initialized");
    installed
}

/// Initialize simple console logging (for development)
pub fn init_console_logging(service_name: &str, default_level: &str) -> bool {
    let installed = tracing_subscriber::fmt()
        .with_env_filter(env_filter(default_level))
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .try_init()
        .is_ok();

    report(service_name, installed, "Console logging initialized");
    installed
}

fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

fn report(service_name: &str, installed: bool, message: &str) {
    if installed {
        tracing::info!(service = service_name, "{}", message);
    } else {
        tracing::debug!(
            service = service_name,
            "Global subscriber already installed, keeping it"
        );
    }
}
