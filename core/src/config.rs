//! Process configuration read from the environment.
//!
//! `.env` is loaded first and `.env.local` afterwards so local overrides win.
//! Values stored in the `settings` table take precedence over these defaults
//! at dispatch time (see [`crate::settings::EngineSettings`]).

use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_MAX_CONCURRENCY: usize = 8;

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Explicit database location; `None` lets the binary pick a data dir.
    pub db_path: Option<PathBuf>,
    pub default_timeout: Duration,
    pub max_concurrency: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            default_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
        }
    }
}

impl AppConfig {
    /// Load dotenv files, then read `CHATLIST_*` variables.
    pub fn from_env() -> Self {
        load_dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the config from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let db_path = lookup("CHATLIST_DB_PATH")
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);
        let default_timeout = lookup("CHATLIST_DEFAULT_TIMEOUT")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(defaults.default_timeout);
        let max_concurrency = lookup("CHATLIST_MAX_CONCURRENCY")
            .and_then(|v| v.trim().parse::<usize>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(defaults.max_concurrency);
        Self {
            db_path,
            default_timeout,
            max_concurrency,
        }
    }
}

fn load_dotenv() {
    if let Err(err) = dotenvy::dotenv() {
        if !err.not_found() {
            log::warn!("failed to read .env: {err}");
        }
    }
    if let Err(err) = dotenvy::from_filename_override(".env.local") {
        if !err.not_found() {
            log::warn!("failed to read .env.local: {err}");
        }
    }
}
