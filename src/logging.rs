//! Structured logging for the control-plane server.
//!
//! Two sinks with different audiences: a daily-rotated JSON file for log
//! ingestion (events flattened to top-level fields, enclosing span kept so
//! instance/org ids recorded on handler spans survive into the file), and
//! a compact stderr stream for operators watching the process.
//!
//! `RUST_LOG` overrides the default filter. The default keeps this crate
//! and request traces at `info` while quieting the HTTP and Docker client
//! internals, which are chatty at `info` during normal operation.

use std::path::Path;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Filter applied when `RUST_LOG` is unset: control-plane events and
/// request traces at `info`, dependency internals at `warn`.
const DEFAULT_DIRECTIVES: &str =
    "info,hyper=warn,h2=warn,reqwest=warn,bollard=warn,tungstenite=warn";

/// JSON log file prefix; the appender adds the date suffix.
const LOG_FILE_PREFIX: &str = "orzbob.json";

/// Holds the non-blocking writer guard for file logging.
///
/// The [`WorkerGuard`] must be kept alive for the duration of the process.
/// Dropping it flushes pending log entries and closes the file.
pub struct LoggingGuard {
    _guard: WorkerGuard,
}

/// Initialise logging for the control-plane server.
///
/// Writes flattened JSON to `{logs_dir}/orzbob.json.YYYY-MM-DD` with daily
/// rotation and compact human-readable output to stderr.
///
/// Returns a [`LoggingGuard`] that must be kept alive for log flushing.
///
/// # Errors
///
/// Returns an error if the logs directory cannot be created.
pub fn init(logs_dir: &Path) -> anyhow::Result<LoggingGuard> {
    std::fs::create_dir_all(logs_dir)
        .with_context(|| format!("failed to create logs directory {}", logs_dir.display()))?;

    let file_appender = tracing_appender::rolling::daily(logs_dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES));

    // Ingestion sink: one JSON object per event, fields at the top level,
    // the enclosing span (request or service tick) attached, span-entry
    // lists dropped as noise.
    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .flatten_event(true)
        .with_current_span(true)
        .with_span_list(false)
        .with_writer(non_blocking);

    // Operator sink: compact single-line output; targets add little once
    // the dependency internals are filtered down.
    let console_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_target(false)
        .with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .init();

    Ok(LoggingGuard { _guard: guard })
}
