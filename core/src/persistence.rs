//! Durable storage of prompts and the responses the user chose to keep.

use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use time::macros::format_description;
use time::OffsetDateTime;

use crate::db::DbPool;
use crate::engine::TransientRow;
use crate::errors::ChatListError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PromptRecord {
    pub id: i64,
    pub date: String,
    pub prompt: String,
    pub tags: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResultRecord {
    pub id: i64,
    pub prompt_id: i64,
    pub model_name: String,
    pub response_text: String,
    pub created_at: String,
}

#[derive(Clone)]
pub struct PersistenceGateway {
    pool: DbPool,
}

impl PersistenceGateway {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Write the prompt and every given row in one transaction. On failure
    /// nothing is written.
    pub fn save(
        &self,
        prompt_text: &str,
        tags: Option<&str>,
        rows: &[TransientRow],
    ) -> Result<i64, ChatListError> {
        let mut conn = self.pool.get()?;
        save_in_transaction(&mut conn, prompt_text, tags, rows).map_err(|err| {
            log::error!("saving results failed, transaction rolled back: {err}");
            ChatListError::Persistence(err.to_string())
        })
    }

    pub fn list_prompts(&self) -> Result<Vec<PromptRecord>> {
        let conn = self.pool.get()?;
        query_prompts(
            &conn,
            "SELECT id, date, prompt, tags FROM prompts ORDER BY date DESC, id DESC",
            params![],
        )
    }

    pub fn get_prompt(&self, id: i64) -> Result<Option<PromptRecord>> {
        let conn = self.pool.get()?;
        Ok(conn
            .query_row(
                "SELECT id, date, prompt, tags FROM prompts WHERE id = ?1",
                params![id],
                map_prompt,
            )
            .optional()?)
    }

    pub fn search_prompts(&self, query: &str) -> Result<Vec<PromptRecord>> {
        let conn = self.pool.get()?;
        let pattern = format!("%{}%", query.trim());
        query_prompts(
            &conn,
            "SELECT id, date, prompt, tags FROM prompts WHERE prompt LIKE ?1 OR tags LIKE ?1 ORDER BY date DESC, id DESC",
            params![pattern],
        )
    }

    /// Delete a prompt; its results go with it through the cascade.
    pub fn delete_prompt(&self, id: i64) -> Result<bool> {
        let conn = self.pool.get()?;
        let changed = conn.execute("DELETE FROM prompts WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }

    pub fn results_for_prompt(&self, prompt_id: i64) -> Result<Vec<ResultRecord>> {
        let conn = self.pool.get()?;
        query_results(
            &conn,
            "SELECT id, prompt_id, model_name, response_text, created_at FROM results WHERE prompt_id = ?1 ORDER BY id",
            params![prompt_id],
        )
    }

    pub fn list_results(&self) -> Result<Vec<ResultRecord>> {
        let conn = self.pool.get()?;
        query_results(
            &conn,
            "SELECT id, prompt_id, model_name, response_text, created_at FROM results ORDER BY created_at DESC, id DESC",
            params![],
        )
    }

    pub fn search_results(&self, query: &str) -> Result<Vec<ResultRecord>> {
        let conn = self.pool.get()?;
        let pattern = format!("%{}%", query.trim());
        query_results(
            &conn,
            "SELECT id, prompt_id, model_name, response_text, created_at FROM results WHERE response_text LIKE ?1 OR model_name LIKE ?1 ORDER BY created_at DESC, id DESC",
            params![pattern],
        )
    }
}

fn save_in_transaction(
    conn: &mut Connection,
    prompt_text: &str,
    tags: Option<&str>,
    rows: &[TransientRow],
) -> Result<i64> {
    let now = timestamp()?;
    let tags = tags.map(str::trim).filter(|t| !t.is_empty());
    let tx = conn.transaction()?;
    tx.execute(
        "INSERT INTO prompts (date, prompt, tags) VALUES (?1, ?2, ?3)",
        params![now, prompt_text, tags],
    )?;
    let prompt_id = tx.last_insert_rowid();
    {
        let mut stmt = tx.prepare(
            "INSERT INTO results (prompt_id, model_name, response_text, created_at) VALUES (?1, ?2, ?3, ?4)",
        )?;
        for row in rows {
            stmt.execute(params![prompt_id, row.model_name, row.response_text, now])?;
        }
    }
    tx.commit()?;
    Ok(prompt_id)
}

/// Current UTC time as `YYYY-MM-DD HH:MM:SS`.
pub fn timestamp() -> Result<String> {
    let format = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    Ok(OffsetDateTime::now_utc().format(&format)?)
}

fn map_prompt(row: &Row<'_>) -> rusqlite::Result<PromptRecord> {
    Ok(PromptRecord {
        id: row.get(0)?,
        date: row.get(1)?,
        prompt: row.get(2)?,
        tags: row.get(3)?,
    })
}

fn map_result(row: &Row<'_>) -> rusqlite::Result<ResultRecord> {
    Ok(ResultRecord {
        id: row.get(0)?,
        prompt_id: row.get(1)?,
        model_name: row.get(2)?,
        response_text: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn query_prompts<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Vec<PromptRecord>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, map_prompt)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

fn query_results<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Vec<ResultRecord>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, map_result)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}
