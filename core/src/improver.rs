//! Prompt rewriting through a single configured model.
//!
//! The improver goes through the same [`LlmClient`] as dispatch, so every
//! provider the adapter speaks can be used to polish a prompt before it is
//! fanned out.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use regex::Regex;
use thiserror::Error;

use crate::adapter::{CallError, CallTarget, LlmClient};
use crate::errors::ChatListError;
use crate::registry::ModelRegistry;

const MAX_ALTERNATIVES: usize = 3;

const IMPROVE_TEMPLATE: &str = "You are an expert at writing effective prompts for AI models.

Improve the following prompt so it is clearer, better structured and more effective.

Original prompt:
{prompt}

Requirements:
1. Keep the core intent of the prompt
2. Make it more specific and detailed
3. Add structure where it helps
4. Keep the style and tone of the original

Return ONLY the improved prompt, without explanations.";

const ALTERNATIVES_TEMPLATE: &str = "You are an expert at writing effective prompts for AI models.

Write 2-3 alternative phrasings of the following prompt. Each must keep the core intent but use a different wording or approach.

Original prompt:
{prompt}

Answer strictly in this format:
VARIANT 1:
[first variant]

VARIANT 2:
[second variant]

VARIANT 3:
[third variant]";

#[derive(Debug, Error)]
pub enum ImproveError {
    #[error(transparent)]
    Registry(#[from] ChatListError),
    #[error("{0}")]
    Call(#[from] CallError),
    #[error("no alternatives could be parsed from the model response")]
    NoAlternatives,
    #[error("{0}")]
    Internal(String),
}

pub struct PromptImprover {
    registry: ModelRegistry,
    client: Arc<dyn LlmClient>,
    timeout: Duration,
}

impl PromptImprover {
    pub fn new(registry: ModelRegistry, client: Arc<dyn LlmClient>, timeout: Duration) -> Self {
        Self {
            registry,
            client,
            timeout,
        }
    }

    /// Ask `model_name` for a cleaner version of `prompt`.
    pub async fn improve(&self, model_name: &str, prompt: &str) -> Result<String, ImproveError> {
        let response = self.ask(model_name, IMPROVE_TEMPLATE, prompt).await?;
        Ok(strip_quotes(response.trim()).to_string())
    }

    /// Ask `model_name` for up to three rephrasings of `prompt`.
    pub async fn alternatives(
        &self,
        model_name: &str,
        prompt: &str,
    ) -> Result<Vec<String>, ImproveError> {
        let response = self.ask(model_name, ALTERNATIVES_TEMPLATE, prompt).await?;
        let parsed = parse_alternatives(&response);
        if parsed.is_empty() {
            return Err(ImproveError::NoAlternatives);
        }
        Ok(parsed)
    }

    async fn ask(
        &self,
        model_name: &str,
        template: &str,
        prompt: &str,
    ) -> Result<String, ImproveError> {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Err(ChatListError::EmptyPrompt.into());
        }
        let model = self
            .registry
            .get_model(model_name)
            .map_err(|err| ImproveError::Internal(err.to_string()))?
            .ok_or_else(|| ChatListError::ModelNotFound(model_name.to_string()))?;
        let secret = self.registry.credential_for(&model)?;
        let target = CallTarget {
            model,
            secret: Some(secret),
        };
        let request = template.replace("{prompt}", prompt);
        log::debug!("asking {model_name} to rewrite a prompt");
        Ok(self.client.call(&target, &request, self.timeout).await?)
    }
}

fn variant_marker() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)VARIANT\s+\d+\s*:").expect("variant pattern"))
}

fn list_marker() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^\s*\d+[.)]\s*").expect("list pattern"))
}

/// Split a model answer into at most three alternatives. Recognises
/// `VARIANT N:` blocks, then a numbered list, then falls back to the first
/// non-empty lines.
pub fn parse_alternatives(response: &str) -> Vec<String> {
    let mut pieces = split_on(variant_marker(), response);
    if pieces.is_empty() {
        pieces = split_on(list_marker(), response);
    }
    if pieces.is_empty() {
        pieces = response
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
    }
    pieces
        .iter()
        .map(|p| strip_quotes(p.trim()).trim().to_string())
        .filter(|p| !p.is_empty())
        .take(MAX_ALTERNATIVES)
        .collect()
}

/// Text following each marker up to the next one. Empty when the marker
/// never occurs.
fn split_on(marker: &Regex, text: &str) -> Vec<String> {
    let bounds: Vec<_> = marker.find_iter(text).collect();
    bounds
        .iter()
        .enumerate()
        .map(|(i, m)| {
            let end = bounds.get(i + 1).map_or(text.len(), |next| next.start());
            text[m.end()..end].trim().to_string()
        })
        .collect()
}

fn strip_quotes(text: &str) -> &str {
    let mut out = text;
    for quote in ['"', '\''] {
        if out.len() >= 2 && out.starts_with(quote) && out.ends_with(quote) {
            out = &out[1..out.len() - 1];
        }
    }
    out
}
