//! Outbound LLM calls behind a uniform contract.
//!
//! The engine only sees [`LlmClient::call`]; provider specific request and
//! response shapes live in [`providers`], and the reqwest implementation in
//! [`http`].

pub mod http;
pub mod providers;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::registry::ModelRecord;

pub use http::HttpAdapter;
pub use providers::ProviderKind;

/// Failure class of a single call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "code", rename_all = "snake_case")]
pub enum ErrorKind {
    Network,
    Timeout,
    HttpStatus(u16),
    MalformedResponse,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network => f.write_str("network"),
            Self::Timeout => f.write_str("timeout"),
            Self::HttpStatus(code) => write!(f, "http_status({code})"),
            Self::MalformedResponse => f.write_str("malformed_response"),
        }
    }
}

/// Classified call failure with a human readable detail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallError {
    pub kind: ErrorKind,
    pub detail: String,
}

impl CallError {
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new(
            ErrorKind::Timeout,
            format!("Request timed out after {} s", after.as_secs()),
        )
    }
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.detail)
    }
}

impl std::error::Error for CallError {}

/// A model plus its resolved secret, ready to be called.
#[derive(Debug, Clone)]
pub struct CallTarget {
    pub model: ModelRecord,
    pub secret: Option<String>,
}

impl CallTarget {
    pub fn provider(&self) -> ProviderKind {
        ProviderKind::detect(&self.model.api_url)
    }
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Perform exactly one request. Must not panic; every failure resolves
    /// to a [`CallError`].
    async fn call(
        &self,
        target: &CallTarget,
        prompt: &str,
        timeout: Duration,
    ) -> Result<String, CallError>;
}
