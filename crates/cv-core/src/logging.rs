//! Logging bootstrap
//!
//! `RUST_LOG` takes precedence over the configured level.

use crate::config::DebugConfig;
use crate::error::CoreError;
use tracing_subscriber::EnvFilter;

/// Build the filter from `RUST_LOG`, falling back to the configured level
pub fn env_filter(config: &DebugConfig) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_filter()))
}

/// Install the global tracing subscriber
pub fn init(config: &DebugConfig) -> Result<(), CoreError> {
    let filter = env_filter(config);

    let result = if config.log_to_file {
        if let Some(parent) = config.log_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.log_path)?;

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_writer(std::sync::Mutex::new(file))
            .try_init()
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init()
    };

    result.map_err(|e| CoreError::Config(format!("failed to initialize logging: {}", e)))
}
