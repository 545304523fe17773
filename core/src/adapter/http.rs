use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;

use super::providers::ProviderKind;
use super::{CallError, CallTarget, ErrorKind, LlmClient};
use crate::logging::excerpt;

/// reqwest-backed client shared by every dispatch.
pub struct HttpAdapter {
    client: Client,
}

impl HttpAdapter {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .user_agent("ChatList/0.1")
            .build()
            .context("failed to construct HTTP client")?;
        Ok(Self { client })
    }

    async fn send(
        &self,
        target: &CallTarget,
        prompt: &str,
        timeout: Duration,
    ) -> Result<String, CallError> {
        let kind = target.provider();
        let payload = kind.build_payload(&target.model.name, prompt);
        let mut request = self
            .client
            .post(target.model.api_url.as_str())
            .timeout(timeout)
            .json(&payload);

        let secret = target.secret.as_deref().filter(|_| kind.sends_auth());
        request = match (kind, secret) {
            (ProviderKind::Anthropic, Some(secret)) => request
                .header("x-api-key", secret)
                .header("anthropic-version", "2023-06-01"),
            (ProviderKind::Gemini, Some(secret)) => request.query(&[("key", secret)]),
            (_, Some(secret)) => request.bearer_auth(secret),
            (_, None) => request,
        };

        let response = request
            .send()
            .await
            .map_err(|err| classify(err, timeout))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| classify(err, timeout))?;

        if !status.is_success() {
            return Err(CallError::new(
                ErrorKind::HttpStatus(status.as_u16()),
                format!("HTTP {}: {}", status.as_u16(), excerpt(body.trim(), 200)),
            ));
        }

        let decoded: Value = serde_json::from_str(&body).map_err(|err| {
            CallError::new(
                ErrorKind::MalformedResponse,
                format!("Response is not valid JSON: {err}"),
            )
        })?;
        kind.extract_content(&decoded).ok_or_else(|| {
            CallError::new(
                ErrorKind::MalformedResponse,
                "Unexpected response format from API",
            )
        })
    }
}

#[async_trait]
impl LlmClient for HttpAdapter {
    async fn call(
        &self,
        target: &CallTarget,
        prompt: &str,
        timeout: Duration,
    ) -> Result<String, CallError> {
        self.send(target, prompt, timeout).await
    }
}

fn classify(err: reqwest::Error, timeout: Duration) -> CallError {
    if err.is_timeout() {
        CallError::timeout(timeout)
    } else if err.is_decode() {
        CallError::new(ErrorKind::MalformedResponse, format!("Undecodable response: {err}"))
    } else {
        CallError::new(ErrorKind::Network, format!("Network error: {err}"))
    }
}
