//! Daemon Wire Protocol
//!
//! Newline-delimited JSON over the Unix socket. Each line a client writes is
//! one [`DaemonRequest`]; the daemon answers each with exactly one
//! [`DaemonResponse`] line, in order.
//!
//! ```text
//! → {"type":"chat","user_id":"u1","tier":"pro","prompt":"Explain lifetimes"}
//! ← {"type":"completion","request_id":"…","headers":{…},"completion":{…}}
//!
//! → {"type":"stats"}
//! ← {"type":"stats","stats":{…}}
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use gateway_core::admission::{AdmissionResponse, QuotaDenial};
use gateway_core::gateway::{GatewayStats, ANONYMOUS_USER};
use gateway_core::{
    ChatCompletion, ChatRequest, EndpointKind, GatewayError, InboundRequest, RoutingContext,
    RoutingDecision, Tier,
};

/// One request line
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DaemonRequest {
    /// Admit, route and execute a chat message
    Chat {
        /// Correlation id; generated when absent
        #[serde(default)]
        request_id: Option<String>,
        /// Caller, as asserted by the trusted front end
        #[serde(default)]
        user_id: Option<String>,
        /// Caller's tier name
        #[serde(default)]
        tier: Option<String>,
        /// The user's message
        prompt: String,
        /// Optional system prompt
        #[serde(default)]
        system_prompt: Option<String>,
        /// Sampling temperature
        #[serde(default)]
        temperature: Option<f32>,
        /// Cap on generated tokens
        #[serde(default)]
        max_tokens: Option<u32>,
    },
    /// Show how a prompt would be routed, without executing it
    Route {
        /// Caller
        #[serde(default)]
        user_id: Option<String>,
        /// Caller's tier name
        #[serde(default)]
        tier: Option<String>,
        /// Prompt to route
        prompt: String,
    },
    /// Counters, health and store state
    Stats,
}

/// One response line
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DaemonResponse {
    /// A served chat request
    Completion {
        /// Correlation id
        request_id: String,
        /// Rate-limit headers (empty when enforcement was skipped)
        headers: BTreeMap<String, String>,
        /// Routing decision and model output
        completion: Box<ChatCompletion>,
    },
    /// Quota denial
    RateLimited {
        /// Rate-limit headers, including `Retry-After` when it helps
        headers: BTreeMap<String, String>,
        /// The denial body
        denial: QuotaDenial,
    },
    /// A routing preview
    Route {
        /// The decision
        decision: RoutingDecision,
    },
    /// Operator statistics
    Stats {
        /// The snapshot
        stats: Box<GatewayStats>,
    },
    /// Any failure, with a sanitized message
    Error {
        /// Correlation id, when the request had one
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        /// HTTP-equivalent status
        status: u16,
        /// Caller-facing message
        message: String,
        /// Rate-limit headers when the request was admitted
        #[serde(skip_serializing_if = "BTreeMap::is_empty")]
        headers: BTreeMap<String, String>,
    },
}

/// Malformed client input
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The line was not a valid request
    #[error("invalid request: {0}")]
    InvalidRequest(#[from] serde_json::Error),

    /// The line exceeded the size limit
    #[error("request line exceeds {limit} bytes")]
    LineTooLong {
        /// The configured limit
        limit: usize,
    },
}

impl ProtocolError {
    /// Response line describing this error
    #[must_use]
    pub fn to_response(&self) -> DaemonResponse {
        let status = match self {
            Self::InvalidRequest(_) => 400,
            Self::LineTooLong { .. } => 413,
        };
        DaemonResponse::Error {
            request_id: None,
            status,
            message: self.to_string(),
            headers: BTreeMap::new(),
        }
    }
}

/// Parse one request line
pub fn parse_request(line: &str) -> Result<DaemonRequest, ProtocolError> {
    Ok(serde_json::from_str(line.trim())?)
}

/// Turn a chat request line into a gateway request
///
/// Chat lines are always charged to the chat quota.
#[must_use]
pub fn chat_request(
    request_id: Option<String>,
    user_id: Option<String>,
    tier: Option<String>,
    prompt: String,
) -> ChatRequest {
    let mut inbound = InboundRequest::new(EndpointKind::chat());
    if let Some(request_id) = request_id.filter(|id| !id.trim().is_empty()) {
        inbound = inbound.with_request_id(request_id);
    }
    inbound.user_id = user_id;
    inbound.tier = tier;
    ChatRequest::new(inbound, prompt)
}

/// Routing context for a route preview
#[must_use]
pub fn routing_context(user_id: Option<String>, tier: Option<&str>, prompt: String) -> RoutingContext {
    let tier = tier.map_or_else(Tier::most_restrictive, Tier::resolve);
    RoutingContext::new(
        user_id.unwrap_or_else(|| ANONYMOUS_USER.to_string()),
        tier,
        prompt,
    )
}

fn header_map(headers: Vec<(&'static str, String)>) -> BTreeMap<String, String> {
    headers
        .into_iter()
        .map(|(name, value)| (name.to_string(), value))
        .collect()
}

/// Response line for a finished chat request
#[must_use]
pub fn chat_response(
    request_id: String,
    response: AdmissionResponse<Result<ChatCompletion, GatewayError>>,
) -> DaemonResponse {
    let headers = header_map(response.headers());
    match response {
        AdmissionResponse::Rejected(denial) => DaemonResponse::RateLimited { headers, denial },
        AdmissionResponse::Admitted { body, .. } | AdmissionResponse::Unthrottled { body, .. } => {
            match body {
                Ok(completion) => DaemonResponse::Completion {
                    request_id,
                    headers,
                    completion: Box::new(completion),
                },
                Err(err) => error_response(Some(request_id), &err, headers),
            }
        }
    }
}

/// Response line for a gateway error
#[must_use]
pub fn error_response(
    request_id: Option<String>,
    err: &GatewayError,
    headers: BTreeMap<String, String>,
) -> DaemonResponse {
    DaemonResponse::Error {
        request_id,
        status: err.status_code(),
        message: err.public_message().to_string(),
        headers,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_chat_request() {
        let request = parse_request(
            r#"{"type":"chat","user_id":"u1","tier":"pro","prompt":"hi","temperature":0.2}"#,
        )
        .unwrap();
        assert_eq!(
            request,
            DaemonRequest::Chat {
                request_id: None,
                user_id: Some("u1".to_string()),
                tier: Some("pro".to_string()),
                prompt: "hi".to_string(),
                system_prompt: None,
                temperature: Some(0.2),
                max_tokens: None,
            }
        );
    }

    #[test]
    fn test_parse_stats_request() {
        assert_eq!(parse_request("{\"type\":\"stats\"}\n").unwrap(), DaemonRequest::Stats);
    }

    #[test]
    fn test_parse_rejects_unknown_type() {
        let err = parse_request(r#"{"type":"shutdown"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidRequest(_)));
        assert!(matches!(
            err.to_response(),
            DaemonResponse::Error { status: 400, .. }
        ));
    }

    #[test]
    fn test_chat_request_uses_chat_endpoint() {
        let request = chat_request(None, Some("u1".to_string()), None, "hi".to_string());
        assert_eq!(request.inbound.endpoint(), EndpointKind::chat());
        assert!(!request.inbound.request_id.is_empty());

        let request = chat_request(Some("abc".to_string()), None, None, "hi".to_string());
        assert_eq!(request.inbound.request_id, "abc");
    }

    #[test]
    fn test_caller_supplied_endpoint_is_ignored() {
        let DaemonRequest::Chat {
            request_id,
            user_id,
            tier,
            prompt,
            ..
        } = parse_request(r#"{"type":"chat","endpoint":"x1","user_id":"u1","prompt":"hi"}"#)
            .unwrap()
        else {
            panic!("expected chat request");
        };
        let request = chat_request(request_id, user_id, tier, prompt);
        assert_eq!(request.inbound.endpoint(), EndpointKind::chat());
    }

    #[test]
    fn test_route_context_without_tier_is_most_restrictive() {
        let ctx = routing_context(None, None, "hi".to_string());
        assert_eq!(ctx.tier, Tier::most_restrictive());
        assert_eq!(ctx.user_id, ANONYMOUS_USER);
    }

    #[test]
    fn test_error_response_is_sanitized() {
        let err = GatewayError::Cancelled {
            request_id: "r1".to_string(),
        };
        let json =
            serde_json::to_value(error_response(Some("r1".to_string()), &err, BTreeMap::new()))
                .unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["status"], 499);
        assert!(json.get("headers").is_none());
    }
}
