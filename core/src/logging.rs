use r2d2_sqlite::rusqlite::{params, Connection};
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::db::DbPool;

/// Append a structured diagnostic row to `event_log`.
pub fn log_event(
    conn: &Connection,
    level: &str,
    code: Option<&str>,
    module: &str,
    message: &str,
    explain: Option<&str>,
    data: Option<Value>,
) -> rusqlite::Result<()> {
    let id = Uuid::new_v4().to_string();
    let ts = OffsetDateTime::now_utc().unix_timestamp();
    let data_str = data.map(|v| v.to_string());
    conn.execute(
        "INSERT INTO event_log (id, ts, level, code, module, message, explain, data) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![id, ts, level, code, module, message, explain, data_str],
    )?;
    Ok(())
}

/// Fire-and-forget variant used from async code paths. The write happens on
/// the blocking pool so completion callbacks never wait on SQLite.
pub fn log_event_detached(
    pool: &DbPool,
    level: &'static str,
    code: &'static str,
    module: &'static str,
    message: &'static str,
    data: Value,
) {
    let pool = pool.clone();
    let write = move || {
        if let Ok(conn) = pool.get() {
            if let Err(err) = log_event(&conn, level, Some(code), module, message, None, Some(data)) {
                log::debug!("event_log write failed: {err}");
            }
        }
    };
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn_blocking(write);
        }
        Err(_) => write(),
    }
}

/// Character-safe truncation for prompt and response previews.
pub fn excerpt(text: &str, max_chars: usize) -> String {
    let mut out: String = text.chars().take(max_chars).collect();
    if text.chars().count() > max_chars {
        out.push_str("...");
    }
    out
}
