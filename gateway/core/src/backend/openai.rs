//! OpenAI-Compatible Invoker
//!
//! Speaks the `/chat/completions` API shared by OpenAI and the many
//! providers and proxies that mirror it. Token counts come from the
//! response's `usage` object.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::traits::{
    truncate_body, InvocationError, InvocationRequest, InvocationResponse, ModelInvoker,
};

/// Public OpenAI endpoint
pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Debug, Serialize)]
struct CompletionMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<CompletionMessage<'a>>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
    usage: Option<CompletionUsage>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct CompletionUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

/// Client for an OpenAI-compatible chat API
#[derive(Clone)]
pub struct OpenAiCompatibleInvoker {
    name: String,
    base_url: String,
    api_key: Option<String>,
    http_client: reqwest::Client,
}

impl std::fmt::Debug for OpenAiCompatibleInvoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiCompatibleInvoker")
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .field("has_api_key", &self.api_key.is_some())
            .finish_non_exhaustive()
    }
}

impl OpenAiCompatibleInvoker {
    /// Create an invoker named `name` against `base_url`
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: Option<String>,
        request_timeout: Duration,
    ) -> Result<Self, InvocationError> {
        let http_client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| InvocationError::Transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.filter(|key| !key.is_empty()),
            http_client,
        })
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn build_body<'a>(request: &'a InvocationRequest) -> CompletionRequest<'a> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = request.system_prompt.as_deref() {
            messages.push(CompletionMessage {
                role: "system",
                content: system,
            });
        }
        messages.push(CompletionMessage {
            role: "user",
            content: &request.user_prompt,
        });

        CompletionRequest {
            model: &request.upstream_model,
            messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        }
    }

    async fn send(&self, request: &InvocationRequest) -> Result<InvocationResponse, InvocationError> {
        let mut builder = self
            .http_client
            .post(self.completions_url())
            .json(&Self::build_body(request));
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
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

        let data: CompletionResponse = response
            .json()
            .await
            .map_err(|e| InvocationError::Decode(e.to_string()))?;
        parse_completion(data)
    }
}

fn parse_completion(data: CompletionResponse) -> Result<InvocationResponse, InvocationError> {
    let content = data
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .ok_or_else(|| InvocationError::Decode("no content in completion".to_string()))?;
    let usage = data.usage.unwrap_or_default();

    Ok(InvocationResponse {
        content,
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
    })
}

#[async_trait]
impl ModelInvoker for OpenAiCompatibleInvoker {
    fn name(&self) -> &str {
        &self.name
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
