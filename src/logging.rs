//! Tracing subscriber setup.
//!
//! Console output goes to stderr so stdout stays free for command output.
//! When file logging is enabled a daily rolling log is written under
//! `.cadence/logs/`; the returned guard flushes it and must outlive the run.

use std::path::Path;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LoggingSettings;

const LOG_FILE_PREFIX: &str = "cadence.log";

/// Build the filter: `RUST_LOG` wins, then the configured level.
pub fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Install the global subscriber.
///
/// `log_dir` is only used when `settings.file` is set. A directory that
/// cannot be created downgrades to console-only logging with a warning.
pub fn init(settings: &LoggingSettings, log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let mut guard = None;

    let file_layer = match log_dir.filter(|_| settings.file) {
        Some(dir) => match std::fs::create_dir_all(dir) {
            Ok(()) => {
                let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
                let (writer, worker_guard) = tracing_appender::non_blocking(appender);
                guard = Some(worker_guard);
                Some(
                    fmt::layer()
                        .with_writer(writer)
                        .with_ansi(false)
                        .with_filter(env_filter(&settings.level)),
                )
            }
            Err(err) => {
                eprintln!(
                    "Warning: failed to create log directory {}: {}",
                    dir.display(),
                    err
                );
                None
            }
        },
        None => None,
    };

    let json_layer = settings.json.then(|| {
        fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_filter(env_filter(&settings.level))
    });
    let compact_layer = (!settings.json).then(|| {
        fmt::layer()
            .compact()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_filter(env_filter(&settings.level))
    });

    tracing_subscriber::registry()
        .with(file_layer)
        .with(json_layer)
        .with(compact_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_accepts_configured_level() {
        let filter = env_filter("debug");
        assert!(!filter.to_string().is_empty());
    }
}
