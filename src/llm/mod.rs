//! The completion-model boundary.

pub mod http;
pub mod retry;

use async_trait::async_trait;

use crate::error::LlmError;

pub use http::HttpModel;
pub use retry::RetryPolicy;

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl CompletionRequest {
    pub fn new(prompt: impl Into<String>, max_tokens: u32, temperature: f32) -> Self {
        Self {
            prompt: prompt.into(),
            max_tokens,
            temperature,
        }
    }
}

/// One opaque request/response round trip. Implementations apply their own
/// timeout and retry policy; callers treat every `Err` as an empty result.
#[async_trait]
pub trait CompletionModel: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError>;
}
