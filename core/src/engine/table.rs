use std::fmt;

use serde::{Deserialize, Serialize};

use crate::adapter::{CallError, ErrorKind};
use crate::errors::ChatListError;

/// Generation token of a dispatch cycle. Every in-flight call carries the
/// token it was issued under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CycleId(pub u64);

impl CycleId {
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for CycleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowStatus {
    Pending,
    Success,
    Error,
}

impl RowStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// One model's slot in the current cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransientRow {
    pub model_name: String,
    pub response_text: String,
    pub selected: bool,
    pub status: RowStatus,
    pub error_kind: Option<ErrorKind>,
}

impl TransientRow {
    pub fn pending(model_name: impl Into<String>) -> Self {
        Self {
            model_name: model_name.into(),
            response_text: String::new(),
            selected: false,
            status: RowStatus::Pending,
            error_kind: None,
        }
    }
}

/// Counts for one cycle, published on every row transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CycleProgress {
    pub cycle: CycleId,
    pub total: usize,
    pub pending: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub superseded: bool,
}

impl CycleProgress {
    pub fn is_complete(&self) -> bool {
        self.pending == 0
    }
}

/// Read-only copy of the transient table handed to the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableSnapshot {
    pub cycle: CycleId,
    pub prompt: Option<String>,
    pub rows: Vec<TransientRow>,
}

impl TableSnapshot {
    pub fn row(&self, model_name: &str) -> Option<&TransientRow> {
        self.rows.iter().find(|r| r.model_name == model_name)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Resolution {
    Updated(TransientRow),
    Stale,
    AlreadyTerminal,
    UnknownModel,
}

/// Rows of a single cycle. The row set is fixed when the table is built;
/// later changes only touch existing rows.
#[derive(Debug, Clone)]
pub(crate) struct TransientTable {
    cycle: CycleId,
    prompt: Option<String>,
    rows: Vec<TransientRow>,
}

impl TransientTable {
    pub(crate) fn empty(cycle: CycleId) -> Self {
        Self {
            cycle,
            prompt: None,
            rows: Vec::new(),
        }
    }

    pub(crate) fn new(cycle: CycleId, prompt: String, model_names: &[String]) -> Self {
        Self {
            cycle,
            prompt: Some(prompt),
            rows: model_names.iter().map(TransientRow::pending).collect(),
        }
    }

    pub(crate) fn cycle(&self) -> CycleId {
        self.cycle
    }

    pub(crate) fn prompt(&self) -> Option<&str> {
        self.prompt.as_deref()
    }

    pub(crate) fn rows(&self) -> &[TransientRow] {
        &self.rows
    }

    /// Apply a call outcome. Results for another cycle and rows that are
    /// already terminal are left untouched.
    pub(crate) fn resolve(
        &mut self,
        cycle: CycleId,
        model_name: &str,
        outcome: Result<String, CallError>,
    ) -> Resolution {
        if cycle != self.cycle {
            return Resolution::Stale;
        }
        let Some(row) = self.rows.iter_mut().find(|r| r.model_name == model_name) else {
            return Resolution::UnknownModel;
        };
        if row.status.is_terminal() {
            return Resolution::AlreadyTerminal;
        }
        match outcome {
            Ok(text) => {
                row.status = RowStatus::Success;
                row.response_text = text;
                row.selected = true;
                row.error_kind = None;
            }
            Err(err) => {
                row.status = RowStatus::Error;
                row.response_text = err.detail;
                row.selected = false;
                row.error_kind = Some(err.kind);
            }
        }
        Resolution::Updated(row.clone())
    }

    pub(crate) fn select(
        &mut self,
        model_name: &str,
        selected: bool,
    ) -> Result<TransientRow, ChatListError> {
        let row = self
            .rows
            .iter_mut()
            .find(|r| r.model_name == model_name)
            .ok_or_else(|| ChatListError::ModelNotFound(model_name.to_string()))?;
        if selected && row.status != RowStatus::Success {
            return Err(ChatListError::RowNotSelectable(model_name.to_string()));
        }
        row.selected = selected;
        Ok(row.clone())
    }

    pub(crate) fn selected_rows(&self) -> Vec<TransientRow> {
        self.rows
            .iter()
            .filter(|r| r.selected && r.status == RowStatus::Success)
            .cloned()
            .collect()
    }

    pub(crate) fn progress(&self) -> CycleProgress {
        let mut progress = CycleProgress {
            cycle: self.cycle,
            total: self.rows.len(),
            pending: 0,
            succeeded: 0,
            failed: 0,
            superseded: false,
        };
        for row in &self.rows {
            match row.status {
                RowStatus::Pending => progress.pending += 1,
                RowStatus::Success => progress.succeeded += 1,
                RowStatus::Error => progress.failed += 1,
            }
        }
        progress
    }

    pub(crate) fn snapshot(&self) -> TableSnapshot {
        TableSnapshot {
            cycle: self.cycle,
            prompt: self.prompt.clone(),
            rows: self.rows.clone(),
        }
    }
}
