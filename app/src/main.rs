//! ChatList terminal front end.
//!
//! Sends one prompt to every active model, prints each answer as it lands
//! and optionally keeps the chosen ones.

mod logfile;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use directories::ProjectDirs;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use chatlist_core::adapter::HttpAdapter;
use chatlist_core::api::v1::{self, ApiState, SaveInput};
use chatlist_core::config::AppConfig;
use chatlist_core::db::{open_pool, DbPool, DEFAULT_DB_FILE};
use chatlist_core::engine::{DispatchEngine, RowEvent, RowStatus, TransientRow};
use chatlist_core::improver::PromptImprover;
use chatlist_core::registry::{ModelRegistry, NewModel};
use chatlist_core::settings::{self, EngineSettings, KEY_LOG_LEVEL};

use crate::logfile::{RotatingFile, BACKUPS, LOG_FILE, MAX_BYTES};

#[derive(Parser)]
#[command(name = "chatlist")]
#[command(about = "Send one prompt to many LLMs and compare the answers", long_about = None)]
#[command(version)]
struct Cli {
    /// SQLite database file (overrides CHATLIST_DB_PATH)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a prompt to every active model
    Ask {
        #[arg(required_unless_present = "from", conflicts_with = "from")]
        prompt: Option<String>,
        /// Send a saved prompt again; its tags are reused unless --tags is given
        #[arg(long, value_name = "PROMPT_ID")]
        from: Option<i64>,
        /// Save every successful answer after the cycle completes
        #[arg(short, long)]
        save: bool,
        /// Tags stored with the saved prompt
        #[arg(short, long)]
        tags: Option<String>,
        /// Only keep these models when saving (comma-separated)
        #[arg(long, value_delimiter = ',')]
        keep: Vec<String>,
        /// Write the results to a .md or .json file
        #[arg(short, long)]
        export: Option<PathBuf>,
    },

    /// Manage configured models
    Models {
        #[command(subcommand)]
        action: ModelAction,
    },

    /// Browse saved prompts
    History {
        /// Filter by prompt text or tags
        #[arg(short, long)]
        query: Option<String>,
    },

    /// Show saved answers for a prompt, or search all answers
    Results {
        prompt_id: Option<i64>,
        #[arg(short, long)]
        query: Option<String>,
    },

    /// Delete a saved prompt and its answers
    Forget { prompt_id: i64 },

    /// Read or change settings
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },

    /// Rewrite a prompt with one model
    Improve {
        /// Model that does the rewriting
        model: String,
        prompt: String,
        /// Ask for alternative phrasings instead of a single rewrite
        #[arg(short, long)]
        alternatives: bool,
    },

    /// Recent diagnostic events
    Events {
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Database location and tables
    Status,
}

#[derive(Subcommand)]
enum ModelAction {
    List {
        #[arg(short, long)]
        query: Option<String>,
    },
    Add {
        name: String,
        api_url: String,
        /// Environment variable holding the API key
        credential_ref: String,
        #[arg(long)]
        inactive: bool,
    },
    Enable { name: String },
    Disable { name: String },
    Remove { name: String },
}

#[derive(Subcommand)]
enum SettingsAction {
    Show,
    Set { key: String, value: String },
}

fn data_dir() -> PathBuf {
    if let Some(proj) = ProjectDirs::from("com", "ChatList", "ChatList") {
        proj.data_dir().to_path_buf()
    } else {
        std::env::temp_dir().join("ChatList")
    }
}

/// `RUST_LOG` wins; otherwise the stored `log_level` setting, then `info`.
/// Events go to stderr and to `chatlist.log` next to the database.
fn init_tracing(pool: &DbPool, log_dir: &Path) {
    let stored = pool
        .get()
        .ok()
        .and_then(|conn| settings::get(&conn, KEY_LOG_LEVEL).ok().flatten());
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(stored.as_deref().unwrap_or("info")))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let file = match RotatingFile::open(log_dir.join(LOG_FILE), MAX_BYTES, BACKUPS) {
        Ok(file) => Some(file),
        Err(err) => {
            eprintln!("log file unavailable: {err}");
            None
        }
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(file.map(|file| fmt::layer().with_ansi(false).with_writer(file)))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::from_env();
    let db_path = cli
        .db
        .clone()
        .or_else(|| config.db_path.clone())
        .unwrap_or_else(|| data_dir().join(DEFAULT_DB_FILE));
    let db = open_pool(&db_path)?;
    let log_dir = db_path.parent().map(Path::to_path_buf).unwrap_or_else(data_dir);
    init_tracing(&db, &log_dir);

    let registry = ModelRegistry::from_env(db.clone());
    let client = Arc::new(HttpAdapter::new()?);
    let defaults = EngineSettings::from_config(&config);
    let engine = DispatchEngine::new(db.clone(), registry.clone(), client.clone(), defaults)?;
    let improver = PromptImprover::new(registry, client, defaults.request_timeout);
    let state = ApiState::new(db, engine, improver);

    match cli.command {
        Commands::Ask {
            prompt,
            from,
            save,
            tags,
            keep,
            export,
        } => {
            let source = match (from, prompt) {
                (Some(id), _) => Source::Saved(id),
                (None, Some(text)) => Source::Text(text),
                (None, None) => bail!("give a prompt or --from <PROMPT_ID>"),
            };
            ask(&state, source, save, tags, &keep, export).await?
        }
        Commands::Models { action } => models(&state, action)?,
        Commands::History { query } => {
            for p in v1::list_prompts(&state, query.as_deref()).map_err(anyhow::Error::msg)? {
                let tags = p.tags.map(|t| format!(" [{t}]")).unwrap_or_default();
                println!("{:>4}  {}  {}{tags}", p.id, p.date, p.prompt);
            }
        }
        Commands::Results { prompt_id, query } => {
            let results = match prompt_id {
                Some(id) => v1::prompt_results(&state, id),
                None => v1::list_saved_results(&state, query.as_deref()),
            }
            .map_err(anyhow::Error::msg)?;
            for r in results {
                println!("--- #{} {} ({})\n{}\n", r.prompt_id, r.model_name, r.created_at, r.response_text);
            }
        }
        Commands::Forget { prompt_id } => {
            if !v1::delete_prompt(&state, prompt_id).map_err(anyhow::Error::msg)? {
                bail!("no saved prompt with id {prompt_id}");
            }
            println!("deleted prompt {prompt_id}");
        }
        Commands::Settings { action } => match action {
            SettingsAction::Show => {
                println!(
                    "defaults: timeout {} s, concurrency {}",
                    defaults.request_timeout.as_secs(),
                    defaults.max_concurrency
                );
                for (key, value) in v1::get_settings(&state).await.map_err(anyhow::Error::msg)? {
                    println!("{key} = {value}");
                }
            }
            SettingsAction::Set { key, value } => {
                v1::update_setting(&state, &key, &value)
                    .await
                    .map_err(anyhow::Error::msg)?;
                println!("{key} = {value}");
            }
        },
        Commands::Improve {
            model,
            prompt,
            alternatives,
        } => {
            if alternatives {
                let variants = v1::prompt_alternatives(&state, &model, &prompt)
                    .await
                    .map_err(anyhow::Error::msg)?;
                for (i, v) in variants.iter().enumerate() {
                    println!("{}. {v}", i + 1);
                }
            } else {
                let improved = v1::improve_prompt(&state, &model, &prompt)
                    .await
                    .map_err(anyhow::Error::msg)?;
                println!("{improved}");
            }
        }
        Commands::Events { limit } => {
            for e in v1::list_events(&state, Some(limit)).map_err(anyhow::Error::msg)? {
                println!(
                    "{} {:<5} {:<9} {} {}",
                    e.ts,
                    e.level,
                    e.code.unwrap_or_default(),
                    e.module,
                    e.message
                );
            }
        }
        Commands::Status => {
            let status = v1::db_status(&state).map_err(anyhow::Error::msg)?;
            println!("database: {}", db_path.display());
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
    }
    Ok(())
}

enum Source {
    Text(String),
    Saved(i64),
}

async fn ask(
    state: &ApiState,
    source: Source,
    save: bool,
    tags: Option<String>,
    keep: &[String],
    export: Option<PathBuf>,
) -> Result<()> {
    let mut events = state.engine.subscribe();
    let (cycle_id, models, tags) = match source {
        Source::Text(prompt) => {
            let out = v1::submit_prompt(state, &prompt).map_err(anyhow::Error::msg)?;
            (out.cycle, out.models, tags)
        }
        Source::Saved(id) => {
            let out = v1::resubmit_prompt(state, id).map_err(anyhow::Error::msg)?;
            println!("prompt #{}: {}", out.prompt_id, out.prompt);
            (out.cycle, out.models, tags.or(out.tags))
        }
    };
    println!("cycle #{cycle_id} -> {}", models.join(", "));

    let mut printed = HashSet::new();
    while printed.len() < models.len() {
        tokio::select! {
            event = events.recv() => match event {
                Ok(RowEvent::RowUpdated { cycle, row }) if cycle.0 == cycle_id => {
                    for row in unseen(&mut printed, [&row]) {
                        print_row(row);
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    log::warn!("missed {skipped} row update(s); reading the table instead");
                    let snapshot = v1::current_results(state);
                    for row in unseen(&mut printed, &snapshot.rows) {
                        print_row(row);
                    }
                }
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                v1::clear_results(state);
                bail!("cancelled; pending calls abandoned");
            }
        }
    }

    if let Some(path) = export {
        v1::export_results(state, path.clone(), None).map_err(anyhow::Error::msg)?;
        println!("exported to {}", path.display());
    }

    if save {
        if !keep.is_empty() {
            for row in v1::current_results(state).rows {
                if row.status == RowStatus::Success && !keep.contains(&row.model_name) {
                    v1::select_result(state, &row.model_name, false).map_err(anyhow::Error::msg)?;
                }
            }
        }
        let saved = v1::save_results(state, SaveInput { tags })
            .map_err(anyhow::Error::msg)
            .context("results were not saved")?;
        println!("saved as prompt {}", saved.prompt_id);
    }
    Ok(())
}

/// Finished rows whose model has not been printed yet, marking them printed.
fn unseen<'a>(
    printed: &mut HashSet<String>,
    rows: impl IntoIterator<Item = &'a TransientRow>,
) -> Vec<&'a TransientRow> {
    rows.into_iter()
        .filter(|row| row.status.is_terminal() && printed.insert(row.model_name.clone()))
        .collect()
}

fn print_row(row: &TransientRow) {
    match (row.status, row.error_kind) {
        (RowStatus::Success, _) => println!("\n== {} ==\n{}", row.model_name, row.response_text),
        (_, Some(kind)) => println!("\n== {} [{kind}] ==\n{}", row.model_name, row.response_text),
        _ => println!("\n== {} [error] ==\n{}", row.model_name, row.response_text),
    }
}

fn models(state: &ApiState, action: ModelAction) -> Result<()> {
    match action {
        ModelAction::List { query } => {
            let models = match query {
                Some(q) => v1::search_models(state, &q),
                None => v1::list_models(state),
            }
            .map_err(anyhow::Error::msg)?;
            for m in models {
                let flag = if m.is_active { "*" } else { " " };
                println!("{flag} {:<20} {:<50} ${}", m.name, m.api_url, m.credential_ref);
            }
        }
        ModelAction::Add {
            name,
            api_url,
            credential_ref,
            inactive,
        } => {
            let model = v1::create_model(
                state,
                NewModel {
                    name,
                    api_url,
                    credential_ref,
                    is_active: !inactive,
                },
            )
            .map_err(anyhow::Error::msg)?;
            println!("added {} (id {})", model.name, model.id);
        }
        ModelAction::Enable { name } => {
            v1::set_model_active(state, &name, true).map_err(anyhow::Error::msg)?;
            println!("{name} enabled");
        }
        ModelAction::Disable { name } => {
            v1::set_model_active(state, &name, false).map_err(anyhow::Error::msg)?;
            println!("{name} disabled");
        }
        ModelAction::Remove { name } => {
            v1::delete_model(state, &name).map_err(anyhow::Error::msg)?;
            println!("{name} removed");
        }
    }
    Ok(())
}
