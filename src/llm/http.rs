use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::{CompletionModel, CompletionRequest, RetryPolicy};
use crate::config::ModelConfig;
use crate::error::LlmError;

const CONTEXT_OVERFLOW_MARKERS: &[&str] = &[
    "context length",
    "context_length",
    "context window",
    "context size",
    "maximum context",
    "too many tokens",
    "n_ctx",
];

/// Client for an OpenAI-compatible `/v1/chat/completions` endpoint.
pub struct HttpModel {
    client: reqwest::Client,
    url: String,
    model: String,
    api_key: Option<String>,
    timeout: Duration,
    retry: RetryPolicy,
}

impl HttpModel {
    pub fn new(config: &ModelConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: format!("{}/v1/chat/completions", config.url.trim_end_matches('/')),
            model: config.name.clone(),
            api_key: config.api_key.clone().filter(|k| !k.is_empty()),
            timeout: Duration::from_secs(config.timeout_secs),
            retry: RetryPolicy {
                max_retries: config.max_retries,
                base_delay: Duration::from_millis(config.retry_base_ms),
            },
        }
    }

    async fn send_once(&self, request: &CompletionRequest) -> Result<String, LlmError> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [{
                "role": "user",
                "content": request.prompt,
            }],
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
        });

        let mut builder = self
            .client
            .post(&self.url)
            .header("content-type", "application/json; charset=utf-8")
            .json(&body)
            .timeout(self.timeout);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        tracing::debug!(url = %self.url, prompt_chars = request.prompt.len(), "sending completion request");
        let resp = builder.send().await.map_err(|e| self.map_send_error(e))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(classify_failure(status.as_u16(), text));
        }

        let data: Value = resp.json().await.map_err(|e| LlmError::InvalidResponse {
            reason: e.to_string(),
        })?;
        let text = extract_text(&data)?;
        let preview: String = text.chars().take(200).collect();
        tracing::debug!(%preview, "completion received");
        Ok(text)
    }

    fn map_send_error(&self, e: reqwest::Error) -> LlmError {
        if e.is_timeout() {
            LlmError::Timeout {
                after: self.timeout,
            }
        } else {
            e.into()
        }
    }
}

#[async_trait]
impl CompletionModel for HttpModel {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError> {
        self.retry.run(move || self.send_once(request)).await
    }
}

/// Map a non-2xx reply to an error, recognizing context-window overflow.
pub fn classify_failure(status: u16, body: String) -> LlmError {
    let lowered = body.to_lowercase();
    let overflow = matches!(status, 400 | 413 | 422)
        && CONTEXT_OVERFLOW_MARKERS.iter().any(|m| lowered.contains(m));
    if overflow {
        LlmError::ContextLengthExceeded { detail: body }
    } else {
        LlmError::Status { status, body }
    }
}

/// `choices[0].message.content`, falling back to the legacy `choices[0].text`.
pub fn extract_text(data: &Value) -> Result<String, LlmError> {
    let choice = &data["choices"][0];
    choice["message"]["content"]
        .as_str()
        .or_else(|| choice["text"].as_str())
        .map(str::to_string)
        .ok_or_else(|| LlmError::InvalidResponse {
            reason: "response carries no generated text".to_string(),
        })
}
