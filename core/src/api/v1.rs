//! Version 1 of the command API.
//!
//! Commands are thin wrappers that validate input, call into the engine,
//! registry or gateway, and return JSON-friendly payloads. Every failure is
//! flattened to a `String` notice the presentation layer can show as-is.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use time::OffsetDateTime;
use tokio::task::spawn_blocking;

use crate::db::{table_names, DbPool};
use crate::engine::{DispatchEngine, TableSnapshot, TransientRow};
use crate::errors::ChatListError;
use crate::export::{write_export, ExportFormat};
use crate::improver::PromptImprover;
use crate::logging::log_event;
use crate::persistence::{PromptRecord, ResultRecord};
use crate::registry::{ModelRecord, ModelRegistry, NewModel};
use crate::settings::{self, KEY_LOG_LEVEL, KEY_MAX_CONCURRENCY, KEY_REQUEST_TIMEOUT};

/// Shared state handed to every command.
#[derive(Clone)]
pub struct ApiState {
    pub db: DbPool,
    pub engine: DispatchEngine,
    pub registry: ModelRegistry,
    pub improver: Arc<PromptImprover>,
}

impl ApiState {
    pub fn new(db: DbPool, engine: DispatchEngine, improver: PromptImprover) -> Self {
        Self {
            registry: engine.registry().clone(),
            db,
            engine,
            improver: Arc::new(improver),
        }
    }
}

/// User-facing notice for a catalogue error.
pub fn notice(err: ChatListError) -> String {
    format!("{err} [{}]: {}", err.code(), err.explain())
}

/// Simple health check.
pub fn ping() -> serde_json::Value {
    json!({
        "ok": true,
        "ts": OffsetDateTime::now_utc().unix_timestamp(),
    })
}

/// Inspect the SQLite catalog to confirm the database is reachable.
pub fn db_status(state: &ApiState) -> Result<serde_json::Value, String> {
    let conn = state.db.get().map_err(|e| e.to_string())?;
    let tables = table_names(&conn).map_err(|e| e.to_string())?;
    Ok(json!({ "ok": true, "tables": tables }))
}

// ---- models -------------------------------------------------------------

pub fn list_models(state: &ApiState) -> Result<Vec<ModelRecord>, String> {
    state.registry.list_models().map_err(|e| e.to_string())
}

pub fn search_models(state: &ApiState, q: &str) -> Result<Vec<ModelRecord>, String> {
    state.registry.search_models(q).map_err(|e| e.to_string())
}

pub fn create_model(state: &ApiState, input: NewModel) -> Result<ModelRecord, String> {
    let model = state.registry.create_model(input).map_err(|e| e.to_string())?;
    audit(state, "CFG-0100", "model created", json!({ "name": model.name }));
    Ok(model)
}

pub fn update_model(state: &ApiState, id: i64, input: NewModel) -> Result<ModelRecord, String> {
    let model = state
        .registry
        .update_model(id, input)
        .map_err(|e| e.to_string())?;
    audit(state, "CFG-0101", "model updated", json!({ "id": id, "name": model.name }));
    Ok(model)
}

pub fn set_model_active(
    state: &ApiState,
    name: &str,
    active: bool,
) -> Result<ModelRecord, String> {
    state
        .registry
        .set_active(name, active)
        .map_err(|e| e.to_string())
}

pub fn delete_model(state: &ApiState, name: &str) -> Result<(), String> {
    state.registry.delete_model(name).map_err(|e| e.to_string())?;
    audit(state, "CFG-0102", "model deleted", json!({ "name": name }));
    Ok(())
}

// ---- dispatch -----------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct SubmitOutput {
    pub cycle: u64,
    pub models: Vec<String>,
}

/// Start a dispatch cycle. Returns immediately; rows fill in as calls land.
pub fn submit_prompt(state: &ApiState, prompt: &str) -> Result<SubmitOutput, String> {
    let handle = state.engine.submit(prompt).map_err(notice)?;
    Ok(SubmitOutput {
        cycle: handle.cycle().0,
        models: handle.models().to_vec(),
    })
}

pub fn current_results(state: &ApiState) -> TableSnapshot {
    state.engine.snapshot()
}

pub fn select_result(
    state: &ApiState,
    model_name: &str,
    selected: bool,
) -> Result<TransientRow, String> {
    state
        .engine
        .set_selected(model_name, selected)
        .map_err(notice)
}

pub fn clear_results(state: &ApiState) {
    state.engine.clear();
}

#[derive(Debug, Deserialize, Default)]
pub struct SaveInput {
    pub tags: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SaveOutput {
    pub prompt_id: i64,
}

pub fn save_results(state: &ApiState, input: SaveInput) -> Result<SaveOutput, String> {
    let prompt_id = state
        .engine
        .save(input.tags.as_deref())
        .map_err(notice)?;
    Ok(SaveOutput { prompt_id })
}

/// Export the current table; the format follows the file extension unless
/// given explicitly.
pub fn export_results(
    state: &ApiState,
    path: PathBuf,
    format: Option<&str>,
) -> Result<serde_json::Value, String> {
    let format = match format {
        Some(f) => f.parse::<ExportFormat>(),
        None => ExportFormat::from_path(&path),
    }
    .map_err(|e| e.to_string())?;
    let snapshot = state.engine.snapshot();
    write_export(&snapshot, format, &path).map_err(|e| e.to_string())?;
    Ok(json!({ "ok": true, "path": path, "rows": snapshot.rows.len() }))
}

// ---- history ------------------------------------------------------------

pub fn list_prompts(state: &ApiState, q: Option<&str>) -> Result<Vec<PromptRecord>, String> {
    let gateway = state.engine.gateway();
    match q.map(str::trim).filter(|q| !q.is_empty()) {
        Some(q) => gateway.search_prompts(q),
        None => gateway.list_prompts(),
    }
    .map_err(|e| e.to_string())
}

pub fn prompt_results(state: &ApiState, prompt_id: i64) -> Result<Vec<ResultRecord>, String> {
    state
        .engine
        .gateway()
        .results_for_prompt(prompt_id)
        .map_err(|e| e.to_string())
}

pub fn list_saved_results(
    state: &ApiState,
    q: Option<&str>,
) -> Result<Vec<ResultRecord>, String> {
    let gateway = state.engine.gateway();
    match q.map(str::trim).filter(|q| !q.is_empty()) {
        Some(q) => gateway.search_results(q),
        None => gateway.list_results(),
    }
    .map_err(|e| e.to_string())
}

#[derive(Debug, Serialize)]
pub struct ResubmitOutput {
    pub prompt_id: i64,
    pub prompt: String,
    pub tags: Option<String>,
    pub cycle: u64,
    pub models: Vec<String>,
}

/// Send a saved prompt to the current active models again. The stored tags
/// come back so the caller can reuse them when saving the new answers.
pub fn resubmit_prompt(state: &ApiState, prompt_id: i64) -> Result<ResubmitOutput, String> {
    let stored = state
        .engine
        .gateway()
        .get_prompt(prompt_id)
        .map_err(|e| e.to_string())?
        .ok_or_else(|| notice(ChatListError::PromptNotFound(prompt_id)))?;
    let submitted = submit_prompt(state, &stored.prompt)?;
    Ok(ResubmitOutput {
        prompt_id: stored.id,
        prompt: stored.prompt,
        tags: stored.tags,
        cycle: submitted.cycle,
        models: submitted.models,
    })
}

pub fn delete_prompt(state: &ApiState, prompt_id: i64) -> Result<bool, String> {
    state
        .engine
        .gateway()
        .delete_prompt(prompt_id)
        .map_err(|e| e.to_string())
}

// ---- settings -----------------------------------------------------------

pub async fn get_settings(state: &ApiState) -> Result<BTreeMap<String, String>, String> {
    let pool = state.db.clone();
    spawn_blocking(move || {
        let conn = pool.get().map_err(|e| e.to_string())?;
        settings::all(&conn).map_err(|e| e.to_string())
    })
    .await
    .map_err(|e| e.to_string())?
}

/// Store a setting. Numeric dispatch settings are validated before they are
/// written so a bad value never reaches the next submit.
pub async fn update_setting(state: &ApiState, key: &str, value: &str) -> Result<(), String> {
    let value = value.trim().to_string();
    match key {
        KEY_REQUEST_TIMEOUT | KEY_MAX_CONCURRENCY => match value.parse::<u64>() {
            Ok(n) if n > 0 => {}
            _ => return Err(format!("{key} must be a positive integer")),
        },
        KEY_LOG_LEVEL => {
            if !matches!(
                value.to_ascii_lowercase().as_str(),
                "error" | "warn" | "info" | "debug" | "trace"
            ) {
                return Err(format!("unknown log level `{value}`"));
            }
        }
        _ => {}
    }
    let pool = state.db.clone();
    let key = key.to_string();
    spawn_blocking(move || {
        let conn = pool.get().map_err(|e| e.to_string())?;
        settings::set(&conn, &key, &value).map_err(|e| e.to_string())?;
        log_event(
            &conn,
            "info",
            Some("CFG-0200"),
            "settings",
            "setting updated",
            None,
            Some(json!({ "key": key, "value": value })),
        )
        .map_err(|e| e.to_string())
    })
    .await
    .map_err(|e| e.to_string())?
}

// ---- prompt improver ----------------------------------------------------

pub async fn improve_prompt(state: &ApiState, model: &str, prompt: &str) -> Result<String, String> {
    state
        .improver
        .improve(model, prompt)
        .await
        .map_err(|e| e.to_string())
}

pub async fn prompt_alternatives(
    state: &ApiState,
    model: &str,
    prompt: &str,
) -> Result<Vec<String>, String> {
    state
        .improver
        .alternatives(model, prompt)
        .await
        .map_err(|e| e.to_string())
}

// ---- diagnostics --------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct EventRecord {
    pub id: String,
    pub ts: i64,
    pub level: String,
    pub code: Option<String>,
    pub module: String,
    pub message: String,
    pub data: Option<serde_json::Value>,
}

/// Most recent rows of `event_log`, newest first.
pub fn list_events(state: &ApiState, limit: Option<usize>) -> Result<Vec<EventRecord>, String> {
    let conn = state.db.get().map_err(|e| e.to_string())?;
    let limit = limit.map_or(-1, |l| l as i64);
    let mut stmt = conn
        .prepare(
            "SELECT id, ts, level, code, module, message, data FROM event_log ORDER BY ts DESC, rowid DESC LIMIT ?1",
        )
        .map_err(|e| e.to_string())?;
    let rows = stmt
        .query_map([limit], map_event)
        .map_err(|e| e.to_string())?;
    let mut events = Vec::new();
    for row in rows {
        events.push(row.map_err(|e| e.to_string())?);
    }
    Ok(events)
}

fn map_event(row: &rusqlite::Row) -> rusqlite::Result<EventRecord> {
    let data_str: Option<String> = row.get(6)?;
    let data = data_str.and_then(|raw| serde_json::from_str(&raw).ok());
    Ok(EventRecord {
        id: row.get(0)?,
        ts: row.get(1)?,
        level: row.get(2)?,
        code: row.get(3)?,
        module: row.get(4)?,
        message: row.get(5)?,
        data,
    })
}

fn audit(state: &ApiState, code: &str, message: &str, data: serde_json::Value) {
    match state.db.get() {
        Ok(conn) => {
            if let Err(err) = log_event(&conn, "info", Some(code), "registry", message, None, Some(data)) {
                log::warn!("failed to record {code}: {err}");
            }
        }
        Err(err) => log::warn!("failed to record {code}: {err}"),
    }
}
