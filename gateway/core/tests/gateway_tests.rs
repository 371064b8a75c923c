//! End-to-End Gateway Tests
//!
//! Builds a full gateway with an in-process quota store and a fake provider,
//! then drives requests through admission, routing and execution.

use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use tempfile::NamedTempFile;
use tokio_util::sync::CancellationToken;

use gateway_core::admission::{AdmissionResponse, HEADER_LIMIT, HEADER_REMAINING};
use gateway_core::backend::{
    InvocationError, InvocationRequest, InvocationResponse, ModelInvoker, ProviderRegistry,
};
use gateway_core::config::load_config_with_env;
use gateway_core::quota::{ManualClock, StorageBackendKind};
use gateway_core::routing::{ExecutorConfig, RoutingContext};
use gateway_core::{ChatRequest, EndpointKind, Gateway, GatewayError, InboundRequest, Tier};

/// Provider that answers for every model it is asked about
#[derive(Default)]
struct EchoProvider {
    calls: AtomicUsize,
}

#[async_trait]
impl ModelInvoker for EchoProvider {
    fn name(&self) -> &str {
        "echo"
    }

    async fn invoke(
        &self,
        request: &InvocationRequest,
        _cancel: CancellationToken,
    ) -> Result<InvocationResponse, InvocationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(InvocationResponse {
            content: format!("{} says: {}", request.upstream_model, request.user_prompt),
            prompt_tokens: 8,
            completion_tokens: 16,
        })
    }
}

/// Provider that is always down
struct DownProvider;

#[async_trait]
impl ModelInvoker for DownProvider {
    fn name(&self) -> &str {
        "down"
    }

    async fn invoke(
        &self,
        _request: &InvocationRequest,
        _cancel: CancellationToken,
    ) -> Result<InvocationResponse, InvocationError> {
        Err(InvocationError::Transport("connection reset by peer".to_string()))
    }
}

fn registry(invoker: Arc<dyn ModelInvoker>) -> Arc<ProviderRegistry> {
    Arc::new(
        ProviderRegistry::new()
            .with("openai", invoker.clone())
            .with("anthropic", invoker.clone())
            .with("ollama", invoker),
    )
}

fn chat(user: &str, tier: &str, prompt: &str) -> ChatRequest {
    ChatRequest::new(
        InboundRequest::new(EndpointKind::chat())
            .with_user(user)
            .with_tier(tier),
        prompt,
    )
}

#[tokio::test]
async fn test_admitted_chat_is_routed_within_tier_and_served() {
    let provider = Arc::new(EchoProvider::default());
    let gateway = Gateway::builder()
        .with_invoker(registry(provider.clone()))
        .with_clock(Arc::new(ManualClock::new(1_700_000_000_000)))
        .build()
        .unwrap();

    let response = gateway.handle_chat(chat("u1", "free", "hello")).await;

    let headers = response.headers();
    assert!(headers.contains(&(HEADER_LIMIT, "20".to_string())));
    assert!(headers.contains(&(HEADER_REMAINING, "19".to_string())));

    let AdmissionResponse::Admitted { body, .. } = response else {
        panic!("expected admitted response");
    };
    let completion = body.unwrap();
    let free = ["gpt-4o-mini", "claude-3-haiku", "llama3.1-8b"];
    assert!(free.contains(&completion.outcome.served_by.as_str()));
    assert_eq!(completion.outcome.total_tokens, 24);
    assert_eq!(completion.decision.selected_model, completion.outcome.served_by);
    assert_eq!(provider.calls.load(Ordering::SeqCst), 1);

    let stats = gateway.stats();
    assert_eq!(stats.metrics.admitted, 1);
    assert_eq!(stats.metrics.routed, 1);
    assert_eq!(stats.metrics.completions, 1);
    assert_eq!(stats.storage_backend, StorageBackendKind::Local);
    assert!(stats.health.get(&completion.outcome.served_by).is_some());
}

#[tokio::test]
async fn test_upstream_model_name_is_sent_to_provider() {
    let gateway = Gateway::builder()
        .with_invoker(registry(Arc::new(EchoProvider::default())))
        .with_models(vec![gateway_core::routing::ModelConfig::new("llama3.1-8b", "ollama")
            .with_upstream_name("llama3.1:8b")])
        .with_tiers(
            Tier::ALL
                .into_iter()
                .fold(gateway_core::TierPolicy::new(), |policy, tier| {
                    policy.with_tier(tier, ["llama3.1-8b"])
                }),
        )
        .build()
        .unwrap();

    let response = gateway.handle_chat(chat("u1", "pro", "ping")).await;
    let completion = response.body().unwrap().as_ref().unwrap();
    assert_eq!(completion.outcome.content, "llama3.1:8b says: ping");
}

#[tokio::test]
async fn test_quota_denial_skips_routing_and_execution() {
    let provider = Arc::new(EchoProvider::default());
    let gateway = Gateway::builder()
        .with_invoker(registry(provider.clone()))
        .with_clock(Arc::new(ManualClock::new(1_700_000_000_000)))
        .build()
        .unwrap();

    for _ in 0..20 {
        let response = gateway.handle_chat(chat("u2", "free", "hi")).await;
        assert!(response.denial().is_none());
    }
    let response = gateway.handle_chat(chat("u2", "free", "hi")).await;

    let denial = response.denial().unwrap();
    assert_eq!(denial.status_code, 429);
    assert_eq!(denial.retry_after_secs, Some(3));
    assert_eq!(provider.calls.load(Ordering::SeqCst), 20);
    assert_eq!(gateway.stats().metrics.routed, 20);
}

#[tokio::test]
async fn test_chat_is_charged_to_chat_quota_whatever_endpoint_is_named() {
    let provider = Arc::new(EchoProvider::default());
    let gateway = Gateway::builder()
        .with_invoker(registry(provider.clone()))
        .with_clock(Arc::new(ManualClock::new(1_700_000_000_000)))
        .build()
        .unwrap();

    let mut served = 0;
    for i in 0..40 {
        let request = ChatRequest::new(
            InboundRequest::new(EndpointKind::new(format!("x{i}")))
                .with_user("u1")
                .with_tier("free"),
            "hi",
        );
        let response = gateway.handle_chat(request).await;
        if response.denial().is_none() {
            served += 1;
        }
    }

    assert_eq!(served, 20);
    assert_eq!(provider.calls.load(Ordering::SeqCst), 20);

    // The plain chat endpoint shares the same, now empty, bucket
    let response = gateway.handle_chat(chat("u1", "free", "hi")).await;
    assert_eq!(response.denial().unwrap().retry_after_secs, Some(3));
}

#[tokio::test]
async fn test_all_providers_down_surfaces_sanitized_503() {
    let gateway = Gateway::builder()
        .with_invoker(registry(Arc::new(DownProvider)))
        .build()
        .unwrap();

    let response = gateway.handle_chat(chat("u3", "enterprise", "hi")).await;

    let AdmissionResponse::Admitted { body, .. } = response else {
        panic!("expected admitted response");
    };
    let err = body.unwrap_err();
    assert!(matches!(err, GatewayError::Unavailable(_)));
    assert_eq!(err.status_code(), 503);
    assert!(!err.public_message().contains("connection reset"));

    let stats = gateway.stats();
    assert_eq!(stats.metrics.exhausted, 1);
    assert_eq!(stats.metrics.attempt_failures, 3);
}

#[tokio::test]
async fn test_cancelled_caller_gets_cancelled_error() {
    let gateway = Gateway::builder()
        .with_invoker(registry(Arc::new(EchoProvider::default())))
        .build()
        .unwrap();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let response = gateway
        .handle_chat(chat("u4", "pro", "hi").with_cancellation(cancel))
        .await;

    let err = response.body().unwrap().clone().unwrap_err();
    assert!(matches!(err, GatewayError::Cancelled { .. }));
    assert_eq!(err.status_code(), 499);
}

#[tokio::test]
async fn test_route_only_does_not_consume_quota_or_invoke() {
    let provider = Arc::new(EchoProvider::default());
    let gateway = Gateway::builder()
        .with_invoker(registry(provider.clone()))
        .build()
        .unwrap();

    for _ in 0..50 {
        let decision = gateway
            .route(&RoutingContext::new("u5", Tier::Free, "refactor this code"))
            .unwrap();
        assert!(!decision.selected_model.is_empty());
    }
    assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    assert_eq!(gateway.stats().metrics.admitted, 0);
}

#[tokio::test]
async fn test_gateway_built_from_config_file() {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(
        br#"
[executor]
attempt_timeout_ms = 2000
max_attempts = 2

[rate_limits.endpoints.chat.free]
requests = 2
window_secs = 60
"#,
    )
    .unwrap();
    let config = load_config_with_env(Some(file.path().to_path_buf()), |_| None).unwrap();
    assert_eq!(
        config.executor,
        ExecutorConfig {
            attempt_timeout: Duration::from_millis(2000),
            max_attempts: 2,
        }
    );

    let gateway = Gateway::builder()
        .with_config(&config)
        .with_invoker(registry(Arc::new(DownProvider)))
        .with_clock(Arc::new(ManualClock::new(1_700_000_000_000)))
        .build()
        .unwrap();

    let first = gateway.handle_chat(chat("u6", "free", "hi")).await;
    let Some(Err(GatewayError::Unavailable(err))) = first.body() else {
        panic!("expected unavailable");
    };
    assert!(matches!(
        err,
        gateway_core::routing::ExecutionError::Exhausted { attempts: 2, .. }
    ));

    let _ = gateway.handle_chat(chat("u6", "free", "hi")).await;
    let third = gateway.handle_chat(chat("u6", "free", "hi")).await;
    assert!(third.denial().is_some());
}
