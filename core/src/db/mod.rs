use anyhow::{Context, Result};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use std::path::{Path, PathBuf};

pub type DbPool = Pool<SqliteConnectionManager>;

pub const DEFAULT_DB_FILE: &str = "chatlist.db";

/// Open (creating if needed) `workspace_dir/file_name` and bring the schema
/// up to date.
pub fn init_db(workspace_dir: PathBuf, file_name: &str) -> Result<DbPool> {
    std::fs::create_dir_all(&workspace_dir)?;
    open_pool(&workspace_dir.join(file_name))
}

/// Build a pool for an explicit database path.
pub fn open_pool(db_path: &Path) -> Result<DbPool> {
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    // Cascading deletes from prompts to results rely on this pragma, which
    // SQLite scopes to a single connection.
    let mgr = SqliteConnectionManager::file(db_path).with_init(|conn| {
        conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;")
    });
    let pool = Pool::new(mgr)
        .with_context(|| format!("failed to open database {}", db_path.display()))?;
    {
        let conn = pool.get()?;
        apply_migrations(&conn)?;
    }
    log::debug!("database ready at {}", db_path.display());
    Ok(pool)
}

fn apply_migrations(conn: &Connection) -> Result<()> {
    let migrations: &[(&str, &str)] = &[(
        "0001_init.sql",
        include_str!(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/../migrations/0001_init.sql"
        )),
    )];

    for (name, sql) in migrations {
        conn.execute_batch(sql)
            .with_context(|| format!("failed to apply migration {name}"))?;
    }
    Ok(())
}

/// Names of the user tables, used by the status command.
pub fn table_names(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
    )?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    let mut names = Vec::new();
    for row in rows {
        names.push(row?);
    }
    Ok(names)
}
