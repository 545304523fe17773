//! Markdown and JSON exports of the transient table.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use anyhow::{anyhow, bail, Context, Result};
use serde::Serialize;

use crate::engine::{RowStatus, TableSnapshot};
use crate::persistence::timestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Markdown,
    Json,
}

impl ExportFormat {
    /// Pick the format from a file extension (`.md`, `.markdown`, `.json`).
    pub fn from_path(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .ok_or_else(|| anyhow!("cannot infer export format for {}", path.display()))?;
        ext.parse()
    }
}

impl FromStr for ExportFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "md" | "markdown" => Ok(Self::Markdown),
            "json" => Ok(Self::Json),
            other => bail!("unsupported export format `{other}`"),
        }
    }
}

#[derive(Debug, Serialize)]
struct JsonExport<'a> {
    export_date: &'a str,
    prompt: &'a str,
    results: Vec<JsonResult<'a>>,
}

#[derive(Debug, Serialize)]
struct JsonResult<'a> {
    model_name: &'a str,
    response_text: &'a str,
    success: bool,
    selected: bool,
}

pub fn render_markdown(snapshot: &TableSnapshot, export_date: &str) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Model comparison results\n");
    let _ = writeln!(out, "**Exported:** {export_date}\n");
    if let Some(prompt) = snapshot.prompt.as_deref().filter(|p| !p.is_empty()) {
        let _ = writeln!(out, "## Prompt\n\n{prompt}\n");
    }
    out.push_str("---\n\n");
    for (idx, row) in snapshot.rows.iter().enumerate() {
        let _ = writeln!(out, "## {}. {}\n", idx + 1, row.model_name);
        match row.status {
            RowStatus::Success => {
                let _ = writeln!(out, "**Status:** success\n");
                let _ = writeln!(out, "**Response:**\n\n{}\n", row.response_text);
            }
            RowStatus::Error => {
                let kind = row
                    .error_kind
                    .map(|k| format!(" ({k})"))
                    .unwrap_or_default();
                let _ = writeln!(out, "**Status:** error{kind}\n");
                let _ = writeln!(out, "**Message:** {}\n", row.response_text);
            }
            RowStatus::Pending => {
                let _ = writeln!(out, "**Status:** pending\n");
            }
        }
        out.push_str("---\n\n");
    }
    out
}

pub fn render_json(snapshot: &TableSnapshot, export_date: &str) -> Result<String> {
    let doc = JsonExport {
        export_date,
        prompt: snapshot.prompt.as_deref().unwrap_or_default(),
        results: snapshot
            .rows
            .iter()
            .map(|row| JsonResult {
                model_name: &row.model_name,
                response_text: &row.response_text,
                success: row.status == RowStatus::Success,
                selected: row.selected,
            })
            .collect(),
    };
    serde_json::to_string_pretty(&doc).context("failed to encode export")
}

/// Render the snapshot in `format` and write it to `path`.
pub fn write_export(snapshot: &TableSnapshot, format: ExportFormat, path: &Path) -> Result<()> {
    if snapshot.rows.is_empty() {
        bail!("nothing to export");
    }
    let now = timestamp()?;
    let body = match format {
        ExportFormat::Markdown => render_markdown(snapshot, &now),
        ExportFormat::Json => render_json(snapshot, &now)?,
    };
    fs::write(path, body).with_context(|| format!("failed to write {}", path.display()))?;
    log::info!("exported {} row(s) to {}", snapshot.rows.len(), path.display());
    Ok(())
}
