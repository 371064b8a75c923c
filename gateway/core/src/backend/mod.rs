//! Model Invocation Backends
//!
//! Outbound calls to model providers through a common trait.
//!
//! # Available Invokers
//!
//! - **Ollama**: local LLM server, `/api/chat`
//! - **OpenAI-compatible**: any `/chat/completions` API
//! - **ProviderRegistry**: dispatches by provider name to the above
//!
//! # Usage
//!
//! ```ignore
//! use gateway_core::backend::{InvocationRequest, ModelInvoker, OllamaInvoker, ProviderRegistry};
//!
//! let ollama = OllamaInvoker::new("localhost", 11434, Duration::from_secs(60))?;
//! let registry = ProviderRegistry::new().with("ollama", Arc::new(ollama));
//! let request = InvocationRequest::new("llama3.1-8b", "ollama", "Hello!");
//! let response = registry.invoke(&request, CancellationToken::new()).await?;
//! ```

mod ollama;
mod openai;
mod registry;
mod traits;

pub use ollama::{OllamaInvoker, DEFAULT_OLLAMA_HOST, DEFAULT_OLLAMA_PORT};
pub use openai::{OpenAiCompatibleInvoker, DEFAULT_OPENAI_BASE_URL};
pub use registry::ProviderRegistry;
pub use traits::{InvocationError, InvocationRequest, InvocationResponse, ModelInvoker};
