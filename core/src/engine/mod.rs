//! Dispatch and aggregation engine.
//!
//! [`DispatchEngine::submit`] fans one prompt out to every active model and
//! collects the answers into the transient table. The table belongs to the
//! engine alone: the presentation layer reads it through
//! [`DispatchEngine::snapshot`] and follows changes through
//! [`DispatchEngine::subscribe`].
//!
//! Each submit opens a new cycle identified by a [`CycleId`]. Calls carry the
//! id they were issued under and their results are dropped if the cycle has
//! been superseded (new submit, clear, or save) by the time they land.

mod table;

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::json;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, watch, Semaphore};
use tokio::task::AbortHandle;

use crate::adapter::{CallError, CallTarget, ErrorKind, LlmClient};
use crate::db::DbPool;
use crate::errors::ChatListError;
use crate::logging::{excerpt, log_event_detached};
use crate::persistence::PersistenceGateway;
use crate::registry::{ModelRecord, ModelRegistry};
use crate::settings::EngineSettings;

pub use table::{CycleId, CycleProgress, RowStatus, TableSnapshot, TransientRow};
use table::{Resolution, TransientTable};

const EVENT_BUFFER: usize = 256;

/// Change notifications for the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RowEvent {
    CycleStarted {
        cycle: CycleId,
        models: Vec<String>,
    },
    RowUpdated {
        cycle: CycleId,
        row: TransientRow,
    },
    RowSelected {
        cycle: CycleId,
        model_name: String,
        selected: bool,
    },
    Cleared {
        cycle: CycleId,
    },
}

/// Returned by [`DispatchEngine::submit`]; lets the caller await the cycle.
#[derive(Debug)]
pub struct CycleHandle {
    cycle: CycleId,
    models: Vec<String>,
    progress: watch::Receiver<CycleProgress>,
}

impl CycleHandle {
    pub fn cycle(&self) -> CycleId {
        self.cycle
    }

    /// Models snapshotted for this cycle, in column order.
    pub fn models(&self) -> &[String] {
        &self.models
    }

    pub fn progress(&self) -> CycleProgress {
        *self.progress.borrow()
    }

    /// Resolve once every row is terminal or the cycle is superseded.
    pub async fn wait(mut self) -> CycleProgress {
        loop {
            let current = *self.progress.borrow_and_update();
            if current.is_complete() || current.superseded {
                return current;
            }
            if self.progress.changed().await.is_err() {
                let mut last = *self.progress.borrow();
                last.superseded = true;
                return last;
            }
        }
    }
}

struct EngineState {
    table: TransientTable,
    in_flight: Vec<AbortHandle>,
    progress_tx: watch::Sender<CycleProgress>,
}

impl EngineState {
    /// Abort outstanding calls and tell waiters the cycle is gone.
    fn supersede(&mut self) {
        for handle in self.in_flight.drain(..) {
            handle.abort();
        }
        self.progress_tx.send_modify(|p| p.superseded = true);
    }
}

struct Shared {
    pool: DbPool,
    registry: ModelRegistry,
    gateway: PersistenceGateway,
    client: Arc<dyn LlmClient>,
    defaults: EngineSettings,
    runtime: Handle,
    state: Mutex<EngineState>,
    events: broadcast::Sender<RowEvent>,
}

#[derive(Clone)]
pub struct DispatchEngine {
    shared: Arc<Shared>,
}

impl DispatchEngine {
    /// Build an engine that spawns calls on the current tokio runtime.
    pub fn new(
        pool: DbPool,
        registry: ModelRegistry,
        client: Arc<dyn LlmClient>,
        defaults: EngineSettings,
    ) -> Result<Self> {
        let runtime = Handle::try_current()
            .context("dispatch engine must be created inside a tokio runtime")?;
        Ok(Self::with_runtime(pool, registry, client, defaults, runtime))
    }

    pub fn with_runtime(
        pool: DbPool,
        registry: ModelRegistry,
        client: Arc<dyn LlmClient>,
        defaults: EngineSettings,
        runtime: Handle,
    ) -> Self {
        let table = TransientTable::empty(CycleId(0));
        let (progress_tx, _) = watch::channel(table.progress());
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            shared: Arc::new(Shared {
                gateway: PersistenceGateway::new(pool.clone()),
                pool,
                registry,
                client,
                defaults,
                runtime,
                state: Mutex::new(EngineState {
                    table,
                    in_flight: Vec::new(),
                    progress_tx,
                }),
                events,
            }),
        }
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.shared.registry
    }

    pub fn gateway(&self) -> &PersistenceGateway {
        &self.shared.gateway
    }

    /// Start a new cycle for `prompt_text` across all active models.
    ///
    /// Fails without touching the current table when the prompt is blank or
    /// no model is active. Per-model failures never fail the submit; they
    /// show up as error rows.
    pub fn submit(&self, prompt_text: &str) -> Result<CycleHandle, ChatListError> {
        let prompt = prompt_text.trim();
        if prompt.is_empty() {
            return Err(ChatListError::EmptyPrompt);
        }
        let targets = self.shared.registry.active_models()?;
        if targets.is_empty() {
            return Err(ChatListError::NoActiveModels);
        }
        let settings = self.shared.engine_settings();
        let names: Vec<String> = targets.iter().map(|m| m.name.clone()).collect();
        let prompt: Arc<str> = Arc::from(prompt);
        let permits = settings.max_concurrency.clamp(1, targets.len());
        let semaphore = Arc::new(Semaphore::new(permits));

        let mut state = self.shared.lock();
        let cycle = state.table.cycle().next();
        state.supersede();
        state.table = TransientTable::new(cycle, prompt.to_string(), &names);
        let (progress_tx, progress_rx) = watch::channel(state.table.progress());
        state.progress_tx = progress_tx;
        let _ = self.shared.events.send(RowEvent::CycleStarted {
            cycle,
            models: names.clone(),
        });
        for model in targets {
            let task = self.shared.runtime.spawn(run_call(
                Arc::clone(&self.shared),
                cycle,
                model,
                Arc::clone(&prompt),
                settings.request_timeout,
                Arc::clone(&semaphore),
            ));
            state.in_flight.push(task.abort_handle());
        }
        drop(state);

        log::info!(
            "cycle {cycle} dispatched to {} model(s), timeout {} s, concurrency {permits}",
            names.len(),
            settings.request_timeout.as_secs()
        );
        log_event_detached(
            &self.shared.pool,
            "info",
            "DSP-0100",
            "dispatch",
            "Dispatch cycle started",
            json!({
                "cycle": cycle.0,
                "models": names,
                "prompt": excerpt(&prompt, 100),
            }),
        );

        Ok(CycleHandle {
            cycle,
            models: names,
            progress: progress_rx,
        })
    }

    /// Read-only copy of the current table.
    pub fn snapshot(&self) -> TableSnapshot {
        self.shared.lock().table.snapshot()
    }

    pub fn progress(&self) -> CycleProgress {
        self.shared.lock().table.progress()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RowEvent> {
        self.shared.events.subscribe()
    }

    /// Mark a row for saving. Only successful rows can be selected.
    pub fn set_selected(
        &self,
        model_name: &str,
        selected: bool,
    ) -> Result<TransientRow, ChatListError> {
        let mut state = self.shared.lock();
        let row = state.table.select(model_name, selected)?;
        let _ = self.shared.events.send(RowEvent::RowSelected {
            cycle: state.table.cycle(),
            model_name: row.model_name.clone(),
            selected,
        });
        Ok(row)
    }

    /// Drop the table and abandon any calls still in flight.
    pub fn clear(&self) {
        let mut state = self.shared.lock();
        self.shared.reset(&mut state);
        drop(state);
        log::info!("transient results cleared");
    }

    /// Persist the prompt and the selected rows of the current cycle.
    ///
    /// Refused while any row is pending. On success the table is discarded
    /// unless a newer cycle replaced it in the meantime; on failure the table
    /// is left as it was so the user can retry.
    pub fn save(&self, tags: Option<&str>) -> Result<i64, ChatListError> {
        let (cycle, prompt, rows) = {
            let state = self.shared.lock();
            let Some(prompt) = state.table.prompt() else {
                return Err(ChatListError::NothingSelected);
            };
            if state.table.progress().pending > 0 {
                return Err(ChatListError::SaveWhilePending);
            }
            let rows = state.table.selected_rows();
            if rows.is_empty() {
                return Err(ChatListError::NothingSelected);
            }
            (state.table.cycle(), prompt.to_string(), rows)
        };

        let prompt_id = self.shared.gateway.save(&prompt, tags, &rows)?;

        let mut state = self.shared.lock();
        if state.table.cycle() == cycle {
            self.shared.reset(&mut state);
        }
        drop(state);

        log::info!("saved prompt {prompt_id} with {} result(s)", rows.len());
        log_event_detached(
            &self.shared.pool,
            "info",
            "PRS-0200",
            "persistence",
            "Results saved",
            json!({
                "prompt_id": prompt_id,
                "models": rows.iter().map(|r| r.model_name.as_str()).collect::<Vec<_>>(),
            }),
        );
        Ok(prompt_id)
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn engine_settings(&self) -> EngineSettings {
        let loaded = self
            .pool
            .get()
            .map_err(anyhow::Error::from)
            .and_then(|conn| EngineSettings::load(&conn, self.defaults));
        match loaded {
            Ok(settings) => settings,
            Err(err) => {
                log::warn!("using default dispatch settings: {err}");
                self.defaults
            }
        }
    }

    fn reset(&self, state: &mut EngineState) {
        let next = state.table.cycle().next();
        state.supersede();
        state.table = TransientTable::empty(next);
        let (progress_tx, _) = watch::channel(state.table.progress());
        state.progress_tx = progress_tx;
        let _ = self.events.send(RowEvent::Cleared { cycle: next });
    }

    fn complete(&self, cycle: CycleId, model_name: &str, outcome: Result<String, CallError>) {
        let mut state = self.lock();
        match state.table.resolve(cycle, model_name, outcome) {
            Resolution::Updated(row) => {
                state.progress_tx.send_replace(state.table.progress());
                let _ = self.events.send(RowEvent::RowUpdated {
                    cycle,
                    row: row.clone(),
                });
                drop(state);
                self.record_outcome(cycle, &row);
            }
            Resolution::Stale => {
                log::debug!("dropping late result from {model_name} for superseded cycle {cycle}");
            }
            Resolution::AlreadyTerminal => {
                log::debug!("ignoring duplicate result from {model_name} in cycle {cycle}");
            }
            Resolution::UnknownModel => {
                log::warn!("result for unknown model {model_name} in cycle {cycle}");
            }
        }
    }

    fn record_outcome(&self, cycle: CycleId, row: &TransientRow) {
        match row.status {
            RowStatus::Success => {
                log::info!("{} answered in cycle {cycle}", row.model_name);
                log_event_detached(
                    &self.pool,
                    "info",
                    "DSP-0200",
                    "dispatch",
                    "Model call succeeded",
                    json!({
                        "cycle": cycle.0,
                        "model": row.model_name,
                        "preview": excerpt(&row.response_text, 200),
                    }),
                );
            }
            RowStatus::Error => {
                let kind = row.error_kind.map(|k| k.to_string()).unwrap_or_default();
                log::warn!(
                    "{} failed in cycle {cycle} ({kind}): {}",
                    row.model_name,
                    row.response_text
                );
                log_event_detached(
                    &self.pool,
                    "warn",
                    "DSP-0201",
                    "dispatch",
                    "Model call failed",
                    json!({
                        "cycle": cycle.0,
                        "model": row.model_name,
                        "kind": kind,
                        "error": row.response_text,
                    }),
                );
            }
            RowStatus::Pending => {}
        }
    }
}

async fn run_call(
    shared: Arc<Shared>,
    cycle: CycleId,
    model: ModelRecord,
    prompt: Arc<str>,
    timeout: Duration,
    semaphore: Arc<Semaphore>,
) {
    let model_name = model.name.clone();
    // A missing key fails the row at once instead of waiting for a permit.
    let secret = match shared.registry.credential_for(&model) {
        Ok(secret) => secret,
        Err(err) => {
            shared.complete(
                cycle,
                &model_name,
                Err(CallError::new(ErrorKind::Network, err.to_string())),
            );
            return;
        }
    };
    let Ok(_permit) = semaphore.acquire_owned().await else {
        return;
    };
    let target = CallTarget {
        model,
        secret: Some(secret),
    };
    let outcome = call_with_timeout(shared.client.as_ref(), &target, &prompt, timeout).await;
    shared.complete(cycle, &model_name, outcome);
}

/// The engine enforces the per-call deadline itself so a client that
/// ignores `timeout` still cannot keep a row pending past it.
async fn call_with_timeout(
    client: &dyn LlmClient,
    target: &CallTarget,
    prompt: &str,
    timeout: Duration,
) -> Result<String, CallError> {
    match tokio::time::timeout(timeout, client.call(target, prompt, timeout)).await {
        Ok(outcome) => outcome,
        Err(_) => Err(CallError::timeout(timeout)),
    }
}

#[cfg(test)]
mod tests;
