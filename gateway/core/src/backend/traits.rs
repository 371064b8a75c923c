//! Model Invocation Traits
//!
//! The outbound boundary of the gateway. An invoker turns one
//! [`InvocationRequest`] into one complete [`InvocationResponse`] against a
//! provider (Ollama, an OpenAI-compatible API, a test double...).
//!
//! # Cancellation
//!
//! Every call receives a [`CancellationToken`]. When it fires the invoker
//! must stop promptly and return [`InvocationError::Cancelled`]; dropping
//! the in-flight HTTP future is enough to release the connection.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// One non-streaming chat call
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InvocationRequest {
    /// Catalog id of the model
    pub model_id: String,
    /// Name the provider knows the model by
    pub upstream_model: String,
    /// Provider to dispatch to
    pub provider: String,
    /// Optional system prompt
    pub system_prompt: Option<String>,
    /// The user's message
    pub user_prompt: String,
    /// Sampling temperature
    pub temperature: f32,
    /// Cap on generated tokens
    pub max_tokens: Option<u32>,
}

impl InvocationRequest {
    /// Request for a model with default sampling
    pub fn new(
        model_id: impl Into<String>,
        provider: impl Into<String>,
        user_prompt: impl Into<String>,
    ) -> Self {
        let model_id = model_id.into();
        Self {
            upstream_model: model_id.clone(),
            model_id,
            provider: provider.into(),
            system_prompt: None,
            user_prompt: user_prompt.into(),
            temperature: 0.7,
            max_tokens: None,
        }
    }

    /// Set the provider-side model name
    #[must_use]
    pub fn with_upstream_model(mut self, name: impl Into<String>) -> Self {
        self.upstream_model = name.into();
        self
    }

    /// Set the system prompt
    #[must_use]
    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system_prompt = Some(system.into());
        self
    }

    /// Set temperature, clamped to `[0, 2]`
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature.clamp(0.0, 2.0);
        self
    }

    /// Cap generated tokens
    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// Complete model answer
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationResponse {
    /// Generated text
    pub content: String,
    /// Tokens in the prompt, as reported by the provider
    pub prompt_tokens: u64,
    /// Tokens generated
    pub completion_tokens: u64,
}

impl InvocationResponse {
    /// Prompt plus completion tokens
    #[must_use]
    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// Invocation failures
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InvocationError {
    /// No invoker is registered for the provider
    #[error("no invoker registered for provider '{0}'")]
    UnknownProvider(String),

    /// The request never produced an HTTP response
    #[error("transport error: {0}")]
    Transport(String),

    /// The provider answered with an error status
    #[error("provider returned {status}: {body}")]
    Upstream {
        /// HTTP status code
        status: u16,
        /// Response body, possibly truncated
        body: String,
    },

    /// The provider's answer could not be decoded
    #[error("invalid provider response: {0}")]
    Decode(String),

    /// The call was cancelled
    #[error("invocation cancelled")]
    Cancelled,
}

/// Outbound model-invocation boundary
#[async_trait]
pub trait ModelInvoker: Send + Sync {
    /// Short invoker name for logs
    fn name(&self) -> &str;

    /// Run one chat call to completion
    async fn invoke(
        &self,
        request: &InvocationRequest,
        cancel: CancellationToken,
    ) -> Result<InvocationResponse, InvocationError>;
}

/// Truncate an upstream error body for logs and error messages
pub(crate) fn truncate_body(body: &str) -> String {
    const MAX: usize = 512;
    if body.len() <= MAX {
        return body.to_string();
    }
    let mut end = MAX;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &body[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builder() {
        let request = InvocationRequest::new("llama3.1-8b", "ollama", "Hello")
            .with_upstream_model("llama3.1:8b")
            .with_system("Be brief")
            .with_temperature(5.0)
            .with_max_tokens(64);

        assert_eq!(request.model_id, "llama3.1-8b");
        assert_eq!(request.upstream_model, "llama3.1:8b");
        assert_eq!(request.system_prompt.as_deref(), Some("Be brief"));
        assert!((request.temperature - 2.0).abs() < f32::EPSILON);
        assert_eq!(request.max_tokens, Some(64));
    }

    #[test]
    fn test_total_tokens() {
        let response = InvocationResponse {
            content: "hi".into(),
            prompt_tokens: 12,
            completion_tokens: 30,
        };
        assert_eq!(response.total_tokens(), 42);
    }

    #[test]
    fn test_truncate_body_respects_char_boundaries() {
        let body = "é".repeat(400);
        let truncated = truncate_body(&body);
        assert!(truncated.ends_with("..."));
        assert!(truncated.len() <= 515);
        assert_eq!(truncate_body("short"), "short");
    }
}
