//! Runtime configuration from the environment, plus logging setup.

use std::path::PathBuf;

use anyhow::{bail, Result};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Default address of the SCION daemon's API endpoint.
pub const DEFAULT_DAEMON_ADDRESS: &str = "127.0.0.1:30255";

#[derive(Debug, Clone)]
pub struct Config {
    /// Base path of the exporter database; rotation derives the dated
    /// filename from it.
    pub db_path: PathBuf,
    /// Rows queued per table before a flush.
    pub batch_size: usize,
    pub remotes_file: PathBuf,
    pub daemon_address: String,
    pub log_level: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let db_path = env_or("EXPORTER_SQLITE_DB_PATH", "pingmetrics.db");
        let batch_size = match std::env::var("EXPORTER_SQLITE_DB_BATCH_SIZE") {
            Ok(value) => match value.parse::<usize>() {
                Ok(n) if n >= 1 => n,
                _ => bail!("EXPORTER_SQLITE_DB_BATCH_SIZE must be a positive integer, got {value:?}"),
            },
            Err(_) => 1,
        };
        Ok(Self {
            db_path: PathBuf::from(db_path),
            batch_size,
            remotes_file: PathBuf::from(env_or("REMOTES_FILE", "remotes.json")),
            daemon_address: env_or("SCION_DAEMON_ADDRESS", DEFAULT_DAEMON_ADDRESS),
            log_level: env_or("LOG_LEVEL", "INFO"),
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Map the LOG_LEVEL convention onto a tracing directive. FATAL has no
/// tracing equivalent and clamps to error.
pub fn level_directive(log_level: &str) -> &'static str {
    match log_level.to_ascii_uppercase().as_str() {
        "DEBUG" => "debug",
        "WARN" => "warn",
        "ERROR" | "FATAL" => "error",
        _ => "info",
    }
}

pub fn init_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_directive(log_level)));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to init logging: {e}"))?;
    Ok(())
}
