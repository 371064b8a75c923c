//! Ollama Invoker
//!
//! Model invoker for Ollama (local LLM server), using the non-streaming
//! `/api/chat` endpoint.
//!
//! # Ollama API
//!
//! - `/api/chat` - Chat completion with message history
//!
//! Liveness is not probed here; outcomes reach the router's health tracker
//! through the fallback executor's attempt records.
//!
//! Token counts come from `prompt_eval_count` and `eval_count` in the final
//! response object.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::traits::{
    truncate_body, InvocationError, InvocationRequest, InvocationResponse, ModelInvoker,
};

/// Default Ollama host
pub const DEFAULT_OLLAMA_HOST: &str = "localhost";
/// Default Ollama port
pub const DEFAULT_OLLAMA_PORT: u16 = 11434;

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Default, Serialize)]
struct ChatOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
    options: ChatOptions,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    message: Option<ChatResponseMessage>,
    #[serde(default)]
    prompt_eval_count: u64,
    #[serde(default)]
    eval_count: u64,
}

/// Ollama client
#[derive(Clone, Debug)]
pub struct OllamaInvoker {
    host: String,
    port: u16,
    http_client: reqwest::Client,
}

impl OllamaInvoker {
    /// Create an invoker; `request_timeout` bounds each HTTP call
    pub fn new(
        host: impl Into<String>,
        port: u16,
        request_timeout: Duration,
    ) -> Result<Self, InvocationError> {
        let http_client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| InvocationError::Transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            host: host.into(),
            port,
            http_client,
        })
    }

    fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    fn chat_url(&self) -> String {
        format!("{}/api/chat", self.base_url())
    }

    fn build_body<'a>(request: &'a InvocationRequest) -> ChatRequest<'a> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = request.system_prompt.as_deref() {
            messages.push(ChatMessage {
                role: "system",
                content: system,
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: &request.user_prompt,
        });

        ChatRequest {
            model: &request.upstream_model,
            messages,
            stream: false,
            options: ChatOptions {
                temperature: Some(request.temperature),
                num_predict: request.max_tokens,
            },
        }
    }

    async fn send(&self, request: &InvocationRequest) -> Result<InvocationResponse, InvocationError> {
        let response = self
            .http_client
            .post(self.chat_url())
            .json(&Self::build_body(request))
            .send()
            .await
            .map_err(|e| InvocationError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(InvocationError::Upstream {
                status: status.as_u16(),
                body: truncate_body(&body),
            });
        }

        let data: ChatResponse = response
            .json()
            .await
            .map_err(|e| InvocationError::Decode(e.to_string()))?;

        Ok(InvocationResponse {
            content: data.message.map(|m| m.content).unwrap_or_default(),
            prompt_tokens: data.prompt_eval_count,
            completion_tokens: data.eval_count,
        })
    }
}

#[async_trait]
impl ModelInvoker for OllamaInvoker {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn invoke(
        &self,
        request: &InvocationRequest,
        cancel: CancellationToken,
    ) -> Result<InvocationResponse, InvocationError> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(InvocationError::Cancelled),
            result = self.send(request) => result,
        }
    }
}
