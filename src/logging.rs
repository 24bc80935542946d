//! Logging Module
//!
//! Structured logging with file output for diagnostics.

use std::path::PathBuf;

use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingConfig;

const LOG_FILE_PREFIX: &str = "care-tracker.log";

/// Initialize logging with console and file output.
///
/// Safe to call more than once; only the first call installs a subscriber.
pub fn init(config: &LoggingConfig) {
    let log_dir = config.directory.clone().unwrap_or_else(default_log_directory);

    // Ensure log directory exists
    let _ = std::fs::create_dir_all(&log_dir);

    // Daily rotation; console-only if the file cannot be opened
    let file_layer = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .build(&log_dir)
        .ok()
        .map(|appender| {
            fmt::layer()
                .with_ansi(false)
                .with_target(true)
                .with_writer(appender)
        });

    // Console output in debug builds only
    #[cfg(debug_assertions)]
    let console_layer = Some(fmt::layer().with_target(true).pretty());

    #[cfg(not(debug_assertions))]
    let console_layer: Option<fmt::Layer<_>> = None;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info,hyper=warn,reqwest=warn"));

    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(console_layer);

    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn default_log_directory() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("CareTracker")
        .join("logs")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice_is_harmless() {
        let dir = tempfile::tempdir().unwrap();
        let config = LoggingConfig {
            level: "debug".into(),
            directory: Some(dir.path().to_path_buf()),
        };

        init(&config);
        init(&config);
        tracing::info!("logging initialized");

        assert!(dir.path().exists());
    }
}
