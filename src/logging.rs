//! Structured logging setup.
//!
//! Console output is either single-line JSON (`log_format = "json"`, the
//! default — suited to log aggregation) or a compact human-readable format
//! (anything else). `log_level` drives an [`EnvFilter`]; noisy transport
//! crates are pinned to `warn` unless the caller's filter string overrides
//! them explicitly. When `log_file` is set, a second JSON-formatted layer
//! writes to that file via a non-blocking appender, independent of the
//! console format.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::ServerConfig;

/// Initialise the global tracing subscriber. Returns a guard that must be
/// kept alive for the lifetime of the process if file logging is enabled —
/// dropping it stops the background flush task.
pub fn init(server: &ServerConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "{},reqwest=warn,hyper=warn,tower_http=warn",
            server.log_level
        ))
    });

    let registry = tracing_subscriber::registry().with(filter);

    let console_json = server.log_format == "json";

    let (file_layer, guard) = match &server.log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .unwrap_or_else(|e| panic!("failed to open log file {path}: {e}"));
            let (writer, guard) = tracing_appender::non_blocking(file);
            (
                Some(fmt::layer().json().with_writer(writer).with_target(true)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    if console_json {
        registry
            .with(fmt::layer().json().with_target(true))
            .with(file_layer)
            .init();
    } else {
        registry
            .with(fmt::layer().compact().with_target(false))
            .with(file_layer)
            .init();
    }

    guard
}
