use crate::error::SwitchcraftError;
use chrono::Local;
use std::fs::create_dir_all;
use std::path::Path;
use tracing::metadata::LevelFilter;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, time::FormatTime},
    prelude::*,
    EnvFilter, Layer,
};

struct CustomTime;

impl FormatTime for CustomTime {
    fn format_time(&self, w: &mut fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("%Y-%m-%d %H:%M:%S"))
    }
}

/// Initialize the tracing system for logging
///
/// # Arguments
///
/// * `level` - The log level to use ("error", "warn", "info", "debug", "trace")
/// * `log_to_file` - Whether to log to a file
/// * `log_file_path` - Path to the log file (only used if log_to_file is true)
///
/// # Returns
///
/// Result indicating success or failure
pub fn init_logging(
    level: &str,
    log_to_file: bool,
    log_file_path: Option<&str>,
) -> Result<(), SwitchcraftError> {
    let filter_level = match level.to_lowercase().as_str() {
        "error" => LevelFilter::ERROR,
        "warn" => LevelFilter::WARN,
        "info" => LevelFilter::INFO,
        "debug" => LevelFilter::DEBUG,
        "trace" => LevelFilter::TRACE,
        _ => LevelFilter::INFO,
    };

    // RUST_LOG takes precedence over the configured level
    let env_filter = match std::env::var("RUST_LOG") {
        Ok(env_val) => EnvFilter::new(env_val),
        Err(_) => EnvFilter::new(level.to_lowercase()),
    };

    if log_to_file {
        let log_path = match log_file_path {
            Some(path) => path.to_string(),
            None => {
                let path = "logs/switchcraft.log";
                let dir = Path::new(path).parent().unwrap_or(Path::new(""));
                create_dir_all(dir).map_err(SwitchcraftError::IoError)?;
                path.to_string()
            }
        };

        let dir = Path::new(&log_path).parent().unwrap_or(Path::new(""));
        create_dir_all(dir).map_err(SwitchcraftError::IoError)?;

        let log_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(SwitchcraftError::IoError)?;

        let file_layer = fmt::layer()
            .with_writer(log_file)
            .with_timer(CustomTime)
            .with_ansi(false)
            .with_span_events(FmtSpan::NONE)
            .with_filter(filter_level);

        let stdout_layer = fmt::layer()
            .with_timer(CustomTime)
            .with_filter(env_filter);

        tracing_subscriber::registry()
            .with(file_layer)
            .with(stdout_layer)
            .try_init()
            .map_err(|e| SwitchcraftError::ConfigError(format!("failed to init logging: {}", e)))?;
    } else {
        let stdout_layer = fmt::layer()
            .with_timer(CustomTime)
            .with_filter(env_filter);

        tracing_subscriber::registry()
            .with(stdout_layer)
            .try_init()
            .map_err(|e| SwitchcraftError::ConfigError(format!("failed to init logging: {}", e)))?;
    }

    Ok(())
}
