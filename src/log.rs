//! Structured logging for foreman.
//!
//! Log levels:
//! - ERROR: Critical failures that prevent operations from completing
//! - WARN: Unexpected conditions that are recoverable (failed passes, push rejects)
//! - INFO: High-level notifications (startup, sweeps, pass outcomes)
//! - DEBUG: Detailed operation traces
//! - TRACE: Very detailed traces (every published event)
//!
//! Debug mode can be enabled with `--debug` flag or `FOREMAN_DEBUG=1` env var.
//! `RUST_LOG` overrides both.

use std::fs::File;
use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static LOG_PATH: OnceLock<PathBuf> = OnceLock::new();

/// Initialize logging to ~/.foreman/foreman.log.
///
/// Falls back to stderr when the log file cannot be created.
pub fn init_with_debug(debug: bool) {
    let debug_enabled = debug || env_debug();
    let default_level = if debug_enabled { "foreman=debug" } else { "foreman=info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let file = dirs::home_dir()
        .map(|h| h.join(".foreman"))
        .and_then(|dir| {
            std::fs::create_dir_all(&dir).ok()?;
            let path = dir.join("foreman.log");
            // Truncate file on startup
            let file = File::create(&path).ok()?;
            LOG_PATH.set(path).ok();
            Some(file)
        });

    let result = match file {
        Some(file) => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(Mutex::new(file)).with_ansi(false))
            .try_init(),
        None => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr).compact())
            .try_init(),
    };
    if result.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

/// Path of the active log file, if logging to a file.
pub fn log_path() -> Option<&'static PathBuf> {
    LOG_PATH.get()
}

fn env_debug() -> bool {
    std::env::var("FOREMAN_DEBUG")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_debug_parsing() {
        std::env::set_var("FOREMAN_DEBUG", "TRUE");
        assert!(env_debug());
        std::env::set_var("FOREMAN_DEBUG", "0");
        assert!(!env_debug());
        std::env::remove_var("FOREMAN_DEBUG");
        assert!(!env_debug());
    }
}
