use anyhow::{bail, Context, Result};
use std::env;
use std::path::PathBuf;

/// Which storage backend to run against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    Sqlite,
    Memory,
}

#[derive(Clone)]
pub struct Config {
    pub port: u16,
    pub storage: StorageKind,
    /// Directory for persistent state (SQLite database).
    /// Defaults to current working directory.
    pub state_dir: PathBuf,
    /// Upper bound on draining in-flight requests at shutdown.
    pub shutdown_timeout_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let port = env::var("PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse::<u16>()
            .context("PORT must be a valid number")?;

        let storage = parse_storage_kind(env::var("STORAGE").ok())?;

        let state_dir = env::var("STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));

        let shutdown_timeout_secs = env::var("SHUTDOWN_TIMEOUT_SECS")
            .unwrap_or_else(|_| "5".to_string())
            .parse::<u64>()
            .context("SHUTDOWN_TIMEOUT_SECS must be a valid number")?;

        Ok(Config {
            port,
            storage,
            state_dir,
            shutdown_timeout_secs,
        })
    }
}

/// Parse the STORAGE environment value into a backend choice.
///
/// Missing or empty means SQLite; anything other than the two known
/// backends is a configuration error rather than a silent fallback.
pub fn parse_storage_kind(value: Option<String>) -> Result<StorageKind> {
    match value.as_deref() {
        None | Some("") | Some("sqlite") => Ok(StorageKind::Sqlite),
        Some("memory") => Ok(StorageKind::Memory),
        Some(other) => bail!("STORAGE must be 'sqlite' or 'memory', got '{other}'"),
    }
}
