use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use crate::config::AppConfig;

pub const KEY_REQUEST_TIMEOUT: &str = "request_timeout_secs";
pub const KEY_MAX_CONCURRENCY: &str = "max_concurrency";
pub const KEY_LOG_LEVEL: &str = "log_level";

pub fn get(conn: &Connection, key: &str) -> Result<Option<String>> {
    let value: Option<Option<String>> = conn
        .query_row(
            "SELECT value FROM settings WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value.flatten())
}

pub fn set(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO settings (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}

pub fn all(conn: &Connection) -> Result<BTreeMap<String, String>> {
    let mut stmt = conn.prepare("SELECT key, value FROM settings ORDER BY key")?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
    })?;
    let mut out = BTreeMap::new();
    for row in rows {
        let (key, value) = row?;
        out.insert(key, value.unwrap_or_default());
    }
    Ok(out)
}

/// Dispatch parameters resolved for a single cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EngineSettings {
    #[serde(with = "duration_secs")]
    pub request_timeout: Duration,
    pub max_concurrency: usize,
}

impl EngineSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            request_timeout: config.default_timeout,
            max_concurrency: config.max_concurrency.max(1),
        }
    }

    /// Overlay values stored in `settings` on top of the configured defaults.
    /// Unparseable values are reported and ignored.
    pub fn load(conn: &Connection, defaults: EngineSettings) -> Result<Self> {
        let mut resolved = defaults;
        if let Some(raw) = get(conn, KEY_REQUEST_TIMEOUT)? {
            match raw.trim().parse::<u64>() {
                Ok(secs) if secs > 0 => resolved.request_timeout = Duration::from_secs(secs),
                _ => log::warn!("ignoring invalid {KEY_REQUEST_TIMEOUT} setting: {raw:?}"),
            }
        }
        if let Some(raw) = get(conn, KEY_MAX_CONCURRENCY)? {
            match raw.trim().parse::<usize>() {
                Ok(n) if n > 0 => resolved.max_concurrency = n,
                _ => log::warn!("ignoring invalid {KEY_MAX_CONCURRENCY} setting: {raw:?}"),
            }
        }
        Ok(resolved)
    }
}

mod duration_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{init_db, DbPool};

    fn pool() -> (tempfile::TempDir, DbPool) {
        let dir = tempfile::tempdir().unwrap();
        let pool = init_db(dir.path().to_path_buf(), "settings.db").unwrap();
        (dir, pool)
    }

    #[test]
    fn set_overwrites_existing_key() {
        let (_dir, pool) = pool();
        let conn = pool.get().unwrap();
        assert_eq!(get(&conn, "theme").unwrap(), None);
        set(&conn, "theme", "dark").unwrap();
        set(&conn, "theme", "light").unwrap();
        assert_eq!(get(&conn, "theme").unwrap().as_deref(), Some("light"));
        assert_eq!(all(&conn).unwrap().len(), 1);
    }

    #[test]
    fn engine_settings_overlay_defaults() {
        let (_dir, pool) = pool();
        let conn = pool.get().unwrap();
        let defaults = EngineSettings::from_config(&AppConfig::default());
        assert_eq!(EngineSettings::load(&conn, defaults).unwrap(), defaults);

        set(&conn, KEY_REQUEST_TIMEOUT, "5").unwrap();
        set(&conn, KEY_MAX_CONCURRENCY, "2").unwrap();
        let loaded = EngineSettings::load(&conn, defaults).unwrap();
        assert_eq!(loaded.request_timeout, Duration::from_secs(5));
        assert_eq!(loaded.max_concurrency, 2);
    }

    #[test]
    fn invalid_values_fall_back() {
        let (_dir, pool) = pool();
        let conn = pool.get().unwrap();
        set(&conn, KEY_REQUEST_TIMEOUT, "0").unwrap();
        set(&conn, KEY_MAX_CONCURRENCY, "many").unwrap();
        let defaults = EngineSettings::from_config(&AppConfig::default());
        assert_eq!(EngineSettings::load(&conn, defaults).unwrap(), defaults);
    }
}
