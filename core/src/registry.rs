//! Model registry: the configured LLM targets and their credential lookup.
//!
//! Models are stored in the `models` table. The `api_id` column holds a
//! *reference* to the secret (an environment variable name), never the
//! secret itself; [`ModelRegistry::credential_for`] resolves it at call time.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::db::DbPool;
use crate::errors::ChatListError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRecord {
    pub id: i64,
    pub name: String,
    pub api_url: String,
    pub credential_ref: String,
    pub is_active: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewModel {
    pub name: String,
    pub api_url: String,
    pub credential_ref: String,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

/// Where credential references are resolved.
pub trait CredentialStore: Send + Sync {
    fn lookup(&self, reference: &str) -> Option<String>;
}

/// Resolves references as process environment variable names.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvCredentials;

impl CredentialStore for EnvCredentials {
    fn lookup(&self, reference: &str) -> Option<String> {
        std::env::var(reference).ok()
    }
}

/// Fixed map of secrets, handy for embedding and tests.
#[derive(Debug, Default, Clone)]
pub struct StaticCredentials(pub HashMap<String, String>);

impl StaticCredentials {
    pub fn with(mut self, reference: &str, secret: &str) -> Self {
        self.0.insert(reference.to_string(), secret.to_string());
        self
    }
}

impl CredentialStore for StaticCredentials {
    fn lookup(&self, reference: &str) -> Option<String> {
        self.0.get(reference).cloned()
    }
}

#[derive(Clone)]
pub struct ModelRegistry {
    pool: DbPool,
    credentials: Arc<dyn CredentialStore>,
}

impl ModelRegistry {
    pub fn new(pool: DbPool, credentials: Arc<dyn CredentialStore>) -> Self {
        Self { pool, credentials }
    }

    /// Registry backed by the process environment.
    pub fn from_env(pool: DbPool) -> Self {
        Self::new(pool, Arc::new(EnvCredentials))
    }

    /// Active models in insertion order, so column order is reproducible.
    pub fn active_models(&self) -> Result<Vec<ModelRecord>, ChatListError> {
        let conn = self.pool.get()?;
        query_models(
            &conn,
            "SELECT id, name, api_url, api_id, is_active FROM models WHERE is_active = 1 ORDER BY id",
            params![],
        )
        .map_err(|err| {
            log::error!("failed to read active models: {err}");
            ChatListError::DbUnavailable
        })
    }

    /// Resolve the model's secret. Empty values count as missing.
    pub fn credential_for(&self, model: &ModelRecord) -> Result<String, ChatListError> {
        self.credentials
            .lookup(&model.credential_ref)
            .filter(|secret| !secret.trim().is_empty())
            .ok_or_else(|| ChatListError::MissingCredential(model.credential_ref.clone()))
    }

    pub fn list_models(&self) -> Result<Vec<ModelRecord>> {
        let conn = self.pool.get()?;
        list_models(&conn)
    }

    pub fn get_model(&self, name: &str) -> Result<Option<ModelRecord>> {
        let conn = self.pool.get()?;
        get_model_by_name(&conn, name)
    }

    pub fn create_model(&self, input: NewModel) -> Result<ModelRecord> {
        let conn = self.pool.get()?;
        create_model(&conn, input)
    }

    pub fn update_model(&self, id: i64, input: NewModel) -> Result<ModelRecord> {
        let conn = self.pool.get()?;
        update_model(&conn, id, input)
    }

    pub fn delete_model(&self, name: &str) -> Result<()> {
        let conn = self.pool.get()?;
        delete_model(&conn, name)
    }

    pub fn set_active(&self, name: &str, active: bool) -> Result<ModelRecord> {
        let conn = self.pool.get()?;
        set_active(&conn, name, active)
    }

    pub fn search_models(&self, query: &str) -> Result<Vec<ModelRecord>> {
        let conn = self.pool.get()?;
        search_models(&conn, query)
    }
}

/// Reject records the dispatch engine could never call.
pub fn validate(input: &NewModel) -> Result<(), ChatListError> {
    if input.name.trim().is_empty() {
        return Err(ChatListError::InvalidModel("name is empty".into()));
    }
    let url = input.api_url.trim();
    if url.is_empty() {
        return Err(ChatListError::InvalidModel("API URL is empty".into()));
    }
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(ChatListError::InvalidModel(
            "API URL must start with http:// or https://".into(),
        ));
    }
    if input.credential_ref.trim().is_empty() {
        return Err(ChatListError::InvalidModel(
            "credential reference is empty".into(),
        ));
    }
    Ok(())
}

fn map_model(row: &Row<'_>) -> rusqlite::Result<ModelRecord> {
    Ok(ModelRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        api_url: row.get(2)?,
        credential_ref: row.get(3)?,
        is_active: row.get::<_, i64>(4)? != 0,
    })
}

fn query_models<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Vec<ModelRecord>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, map_model)?;
    let mut models = Vec::new();
    for row in rows {
        models.push(row?);
    }
    Ok(models)
}

pub fn list_models(conn: &Connection) -> Result<Vec<ModelRecord>> {
    query_models(
        conn,
        "SELECT id, name, api_url, api_id, is_active FROM models ORDER BY id",
        params![],
    )
}

pub fn get_model_by_name(conn: &Connection, name: &str) -> Result<Option<ModelRecord>> {
    Ok(conn
        .query_row(
            "SELECT id, name, api_url, api_id, is_active FROM models WHERE name = ?1",
            params![name],
            map_model,
        )
        .optional()?)
}

fn get_model_by_id(conn: &Connection, id: i64) -> Result<ModelRecord> {
    conn.query_row(
        "SELECT id, name, api_url, api_id, is_active FROM models WHERE id = ?1",
        params![id],
        map_model,
    )
    .optional()?
    .ok_or_else(|| anyhow!(ChatListError::ModelNotFound(id.to_string())))
}

pub fn create_model(conn: &Connection, input: NewModel) -> Result<ModelRecord> {
    validate(&input)?;
    if get_model_by_name(conn, input.name.trim())?.is_some() {
        return Err(anyhow!(ChatListError::InvalidModel(format!(
            "a model named `{}` already exists",
            input.name.trim()
        ))));
    }
    conn.execute(
        "INSERT INTO models (name, api_url, api_id, is_active) VALUES (?1, ?2, ?3, ?4)",
        params![
            input.name.trim(),
            input.api_url.trim(),
            input.credential_ref.trim(),
            input.is_active as i32,
        ],
    )?;
    log::info!("model `{}` added", input.name.trim());
    get_model_by_id(conn, conn.last_insert_rowid())
}

pub fn update_model(conn: &Connection, id: i64, input: NewModel) -> Result<ModelRecord> {
    validate(&input)?;
    let changed = conn.execute(
        "UPDATE models SET name = ?1, api_url = ?2, api_id = ?3, is_active = ?4 WHERE id = ?5",
        params![
            input.name.trim(),
            input.api_url.trim(),
            input.credential_ref.trim(),
            input.is_active as i32,
            id,
        ],
    )?;
    if changed == 0 {
        return Err(anyhow!(ChatListError::ModelNotFound(id.to_string())));
    }
    get_model_by_id(conn, id)
}

pub fn delete_model(conn: &Connection, name: &str) -> Result<()> {
    let changed = conn.execute("DELETE FROM models WHERE name = ?1", params![name])?;
    if changed == 0 {
        return Err(anyhow!(ChatListError::ModelNotFound(name.to_string())));
    }
    log::info!("model `{name}` removed");
    Ok(())
}

pub fn set_active(conn: &Connection, name: &str, active: bool) -> Result<ModelRecord> {
    let changed = conn.execute(
        "UPDATE models SET is_active = ?1 WHERE name = ?2",
        params![active as i32, name],
    )?;
    if changed == 0 {
        return Err(anyhow!(ChatListError::ModelNotFound(name.to_string())));
    }
    get_model_by_name(conn, name)?
        .ok_or_else(|| anyhow!(ChatListError::ModelNotFound(name.to_string())))
}

pub fn search_models(conn: &Connection, query: &str) -> Result<Vec<ModelRecord>> {
    let pattern = format!("%{}%", query.trim());
    query_models(
        conn,
        "SELECT id, name, api_url, api_id, is_active FROM models WHERE name LIKE ?1 OR api_url LIKE ?1 ORDER BY id",
        params![pattern],
    )
}
