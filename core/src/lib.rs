//! Core library of ChatList: send one prompt to many LLM endpoints and keep
//! the answers worth keeping.
//!
//! - [`registry`] stores the configured models and resolves their credentials.
//! - [`adapter`] turns a prompt into one provider-specific HTTP call.
//! - [`engine`] fans prompts out, tracks each call and owns the transient table.
//! - [`persistence`] writes selected rows to SQLite in a single transaction.
//! - [`settings`] and [`config`] supply timeouts and concurrency limits.
//! - [`export`] and [`improver`] are the side tools around a cycle.
//! - [`api`] is the thin command layer a front end calls.
//! - [`db`], [`errors`] and [`logging`] are the shared plumbing.

pub mod adapter;
pub mod api;
pub mod config;
pub mod db;
pub mod engine;
pub mod errors;
pub mod export;
pub mod improver;
pub mod logging;
pub mod persistence;
pub mod registry;
pub mod settings;
