//! Plan API adapter: a pass-through to an Anthropic-compatible endpoint.

use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use futures::StreamExt;
use serde_json::Value;

use crate::models::error_type::ErrorType;
use crate::models::messages::{CountTokensResponse, MessagesRequest, MessagesResponse};
use crate::proxy::adapter::{
    truncate_body, Adapter, AdapterCall, AdapterError, AdapterResponse, ByteStream, StreamError,
};
use crate::proxy::upstream::{classify_transport, TransportFailure};

pub const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Caller headers forwarded to the Plan API.
pub const PASSTHROUGH_HEADERS: &[&str] = &[
    "x-api-key",
    "authorization",
    "anthropic-version",
    "anthropic-beta",
    "content-type",
];

const ERROR_BODY_LIMIT: usize = 200;

/// Subset of inbound headers eligible for passthrough.
pub fn passthrough_headers(inbound: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for name in PASSTHROUGH_HEADERS {
        if let Some(value) = inbound.get(*name) {
            out.insert(HeaderName::from_static(name), value.clone());
        }
    }
    out
}

fn has_caller_credential(headers: &HeaderMap) -> bool {
    headers.contains_key("x-api-key") || headers.contains_key("authorization")
}

pub struct PlanAdapter {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl PlanAdapter {
    pub fn new(client: reqwest::Client, base_url: &str, api_key: Option<String>) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.is_empty()),
        }
    }

    /// True when the call would carry some credential upstream.
    pub fn has_credentials(&self, headers: &HeaderMap) -> bool {
        has_caller_credential(headers) || self.api_key.is_some()
    }

    fn outgoing_headers(&self, caller: &HeaderMap) -> HeaderMap {
        let mut headers = passthrough_headers(caller);
        if !has_caller_credential(&headers) {
            if let Some(value) = self
                .api_key
                .as_deref()
                .and_then(|k| HeaderValue::from_str(k).ok())
            {
                headers.insert("x-api-key", value);
            }
        }
        if !headers.contains_key("anthropic-version") {
            headers.insert(
                "anthropic-version",
                HeaderValue::from_static(ANTHROPIC_VERSION),
            );
        }
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        headers
    }

    async fn post(
        &self,
        path: &str,
        caller: &HeaderMap,
        body: &Value,
    ) -> Result<reqwest::Response, AdapterError> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .post(&url)
            .headers(self.outgoing_headers(caller))
            .json(body)
            .send()
            .await
            .map_err(|e| transport_error(&e))?;

        let status = resp.status().as_u16();
        if status == 200 {
            return Ok(resp);
        }
        let text = resp.text().await.unwrap_or_default();
        Err(classify_status(status, &text))
    }

    /// `POST /v1/messages/count_tokens`.
    pub async fn count_tokens(
        &self,
        caller: &HeaderMap,
        request: &MessagesRequest,
    ) -> Result<CountTokensResponse, AdapterError> {
        let mut body = serde_json::to_value(request).map_err(|e| {
            AdapterError::new(ErrorType::ClientError, 400, format!("Invalid request: {}", e))
        })?;
        if let Some(obj) = body.as_object_mut() {
            // not accepted by the counting endpoint
            obj.remove("max_tokens");
            obj.remove("stream");
        }

        let resp = self.post("/v1/messages/count_tokens", caller, &body).await?;
        let bytes = resp.bytes().await.map_err(|e| transport_error(&e))?;
        serde_json::from_slice(&bytes).map_err(|_| invalid_json())
    }
}

#[async_trait]
impl Adapter for PlanAdapter {
    async fn invoke(&self, call: &AdapterCall<'_>) -> Result<AdapterResponse, AdapterError> {
        let mut body = request_body(call.request)?;
        body["stream"] = Value::Bool(false);

        let resp = self.post("/v1/messages", call.headers, &body).await?;
        let bytes = resp.bytes().await.map_err(|e| transport_error(&e))?;
        let response: MessagesResponse =
            serde_json::from_slice(&bytes).map_err(|_| invalid_json())?;

        Ok(AdapterResponse {
            usage: response.usage,
            response,
        })
    }

    async fn stream(&self, call: &AdapterCall<'_>) -> Result<ByteStream, AdapterError> {
        let mut body = request_body(call.request)?;
        body["stream"] = Value::Bool(true);

        let resp = self.post("/v1/messages", call.headers, &body).await?;
        Ok(resp
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| StreamError::Transport(e.to_string())))
            .boxed())
    }
}

fn request_body(request: &MessagesRequest) -> Result<Value, AdapterError> {
    serde_json::to_value(request).map_err(|e| {
        AdapterError::new(ErrorType::ClientError, 400, format!("Invalid request: {}", e))
    })
}

fn invalid_json() -> AdapterError {
    AdapterError::new(ErrorType::ServerError, 502, "Upstream returned invalid JSON")
}

fn transport_error(err: &reqwest::Error) -> AdapterError {
    match classify_transport(err) {
        TransportFailure::Timeout => AdapterError::new(ErrorType::Timeout, 504, "Request timeout"),
        TransportFailure::Network => {
            AdapterError::new(ErrorType::NetworkError, 503, format!("Network error: {}", err))
        }
    }
}

/// Map a non-200 Plan response to an adapter error.
pub fn classify_status(status: u16, body: &str) -> AdapterError {
    match status {
        429 => {
            if body.to_lowercase().contains("usage") {
                AdapterError::new(ErrorType::UsageLimit, 429, "Usage limit exceeded")
            } else {
                AdapterError::new(ErrorType::RateLimit, 429, "Rate limit exceeded")
            }
        }
        s if s >= 500 => {
            AdapterError::new(ErrorType::ServerError, s, format!("Server error: {}", s))
        }
        s => AdapterError::new(ErrorType::ClientError, s, truncate_body(body, ERROR_BODY_LIMIT)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter(api_key: Option<&str>) -> PlanAdapter {
        PlanAdapter::new(
            reqwest::Client::new(),
            "https://plan.example/",
            api_key.map(String::from),
        )
    }

    #[test]
    fn test_classify_status() {
        let e = classify_status(429, r#"{"error":{"message":"Daily usage cap reached"}}"#);
        assert_eq!(e.error_type, ErrorType::UsageLimit);
        assert!(e.retryable);

        let e = classify_status(429, "slow down");
        assert_eq!(e.error_type, ErrorType::RateLimit);

        let e = classify_status(529, "");
        assert_eq!(e.error_type, ErrorType::ServerError);
        assert_eq!(e.status_code, 529);

        let long = "x".repeat(500);
        let e = classify_status(400, &long);
        assert_eq!(e.error_type, ErrorType::ClientError);
        assert_eq!(e.message.len(), 200);
        assert!(!e.retryable);
    }

    #[test]
    fn test_default_api_key_only_without_caller_credentials() {
        let plan = adapter(Some("sk-default"));

        let headers = plan.outgoing_headers(&HeaderMap::new());
        assert_eq!(headers["x-api-key"], "sk-default");
        assert_eq!(headers["anthropic-version"], ANTHROPIC_VERSION);
        assert_eq!(headers["content-type"], "application/json");

        let mut caller = HeaderMap::new();
        caller.insert("authorization", HeaderValue::from_static("Bearer caller"));
        caller.insert("anthropic-beta", HeaderValue::from_static("tools-2024"));
        caller.insert("cookie", HeaderValue::from_static("nope"));
        let headers = plan.outgoing_headers(&caller);
        assert!(!headers.contains_key("x-api-key"));
        assert_eq!(headers["authorization"], "Bearer caller");
        assert_eq!(headers["anthropic-beta"], "tools-2024");
        assert!(!headers.contains_key("cookie"));
    }

    #[test]
    fn test_has_credentials() {
        assert!(!adapter(None).has_credentials(&HeaderMap::new()));
        assert!(adapter(Some("sk")).has_credentials(&HeaderMap::new()));

        let mut caller = HeaderMap::new();
        caller.insert("x-api-key", HeaderValue::from_static("sk-caller"));
        assert!(adapter(None).has_credentials(&caller));
    }
}
