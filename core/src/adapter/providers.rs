use serde::Serialize;
use serde_json::{json, Value};

/// API flavour inferred from a model's endpoint URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    OpenAi,
    DeepSeek,
    Groq,
    Anthropic,
    Gemini,
    Ollama,
    Generic,
}

impl ProviderKind {
    pub fn detect(api_url: &str) -> Self {
        let url = api_url.to_lowercase();
        if url.contains("openai.com") {
            Self::OpenAi
        } else if url.contains("deepseek.com") {
            Self::DeepSeek
        } else if url.contains("groq.com") {
            Self::Groq
        } else if url.contains("anthropic.com") {
            Self::Anthropic
        } else if url.contains("generativelanguage.googleapis.com") {
            Self::Gemini
        } else if url.trim_end_matches('/').ends_with("/api/chat") {
            Self::Ollama
        } else {
            Self::Generic
        }
    }

    /// Local runtimes take no auth header even when a key is configured.
    pub fn sends_auth(self) -> bool {
        !matches!(self, Self::Ollama)
    }

    /// Request body for this flavour.
    pub fn build_payload(self, model_name: &str, prompt: &str) -> Value {
        let messages = json!([{ "role": "user", "content": prompt }]);
        match self {
            Self::OpenAi => json!({
                "model": openai_model_id(model_name),
                "messages": messages,
                "temperature": 0.7,
            }),
            Self::DeepSeek => json!({
                "model": "deepseek-chat",
                "messages": messages,
                "temperature": 0.7,
            }),
            Self::Groq => json!({
                "model": groq_model_id(model_name),
                "messages": messages,
            }),
            Self::Anthropic => json!({
                "model": model_name,
                "max_tokens": 1024,
                "messages": [{
                    "role": "user",
                    "content": [{ "type": "text", "text": prompt }],
                }],
            }),
            Self::Gemini => json!({
                "contents": [{ "role": "user", "parts": [{ "text": prompt }] }],
            }),
            Self::Ollama => json!({
                "model": model_name,
                "messages": messages,
                "stream": false,
            }),
            Self::Generic => json!({
                "model": model_name,
                "messages": messages,
            }),
        }
    }

    /// Pull the response text out of a decoded body, `None` when the body
    /// does not have the expected shape.
    pub fn extract_content(self, body: &Value) -> Option<String> {
        match self {
            Self::OpenAi | Self::DeepSeek | Self::Groq => chat_choice_content(body),
            Self::Anthropic => body
                .get("content")
                .and_then(|c| c.get(0))
                .and_then(|part| part.get("text"))
                .and_then(Value::as_str)
                .map(str::to_string),
            Self::Gemini => body
                .get("candidates")
                .and_then(|c| c.get(0))
                .and_then(|cand| cand.get("content"))
                .and_then(|content| content.get("parts"))
                .and_then(|parts| parts.get(0))
                .and_then(|part| part.get("text"))
                .and_then(Value::as_str)
                .map(str::to_string),
            Self::Ollama => body
                .get("message")
                .and_then(|m| m.get("content"))
                .and_then(Value::as_str)
                .map(str::to_string),
            Self::Generic => chat_choice_content(body)
                .or_else(|| {
                    body.get("choices")
                        .and_then(|c| c.get(0))
                        .and_then(|choice| choice.get("text"))
                        .and_then(Value::as_str)
                        .map(str::to_string)
                })
                .or_else(|| body.get("content").and_then(Value::as_str).map(str::to_string))
                .or_else(|| body.get("text").and_then(Value::as_str).map(str::to_string)),
        }
    }
}

fn chat_choice_content(body: &Value) -> Option<String> {
    body.get("choices")
        .and_then(|choices| choices.get(0))
        .and_then(|choice| choice.get("message"))
        .and_then(|msg| msg.get("content"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn openai_model_id(model_name: &str) -> &'static str {
    let normalised = model_name.to_lowercase().replace(' ', "-");
    if normalised.contains("gpt-4") {
        "gpt-4"
    } else {
        "gpt-3.5-turbo"
    }
}

fn groq_model_id(model_name: &str) -> &'static str {
    let normalised = model_name.to_lowercase();
    if normalised.contains("mixtral") {
        "mixtral-8x7b-32768"
    } else {
        "llama3-8b-8192"
    }
}
