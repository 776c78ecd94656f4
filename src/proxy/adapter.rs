//! Upstream adapter seam shared by the Plan and Bedrock backends.

use async_trait::async_trait;
use axum::http::HeaderMap;
use bytes::Bytes;
use futures::stream::BoxStream;

use crate::models::error_type::ErrorType;
use crate::models::messages::{MessagesRequest, MessagesResponse, Usage};
use crate::proxy::context::RequestContext;
use crate::proxy::converse::eventstream::EventStreamError;

/// A classified upstream failure.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{error_type} ({status_code}): {message}")]
pub struct AdapterError {
    pub error_type: ErrorType,
    pub status_code: u16,
    pub message: String,
    pub retryable: bool,
}

impl AdapterError {
    /// Retryability defaults to the error type's.
    pub fn new(error_type: ErrorType, status_code: u16, message: impl Into<String>) -> Self {
        Self {
            error_type,
            status_code,
            message: message.into(),
            retryable: error_type.is_retryable(),
        }
    }

    pub fn non_retryable(mut self) -> Self {
        self.retryable = false;
        self
    }
}

#[derive(Debug, Clone)]
pub struct AdapterResponse {
    pub response: MessagesResponse,
    pub usage: Usage,
}

/// Failure after the stream has started; the HTTP status is already sent.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("upstream transport error: {0}")]
    Transport(String),
    #[error(transparent)]
    EventStream(#[from] EventStreamError),
    #[error("upstream stream exception {kind}: {message}")]
    Exception { kind: String, message: String },
}

/// Anthropic SSE bytes ready to forward to the client.
pub type ByteStream = BoxStream<'static, Result<Bytes, StreamError>>;

/// Everything an adapter needs for one upstream call.
pub struct AdapterCall<'a> {
    pub ctx: &'a RequestContext,
    pub request: &'a MessagesRequest,
    /// Caller headers eligible for passthrough to the Plan API.
    pub headers: &'a HeaderMap,
}

#[async_trait]
pub trait Adapter: Send + Sync {
    async fn invoke(&self, call: &AdapterCall<'_>) -> Result<AdapterResponse, AdapterError>;

    /// Resolves once the upstream has accepted the request, so routing can
    /// still fall back on an error status.
    async fn stream(&self, call: &AdapterCall<'_>) -> Result<ByteStream, AdapterError>;
}

/// First `max` characters of an upstream error body.
pub fn truncate_body(body: &str, max: usize) -> String {
    body.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_follows_error_type() {
        assert!(AdapterError::new(ErrorType::ServerError, 500, "x").retryable);
        assert!(!AdapterError::new(ErrorType::ClientError, 400, "x").retryable);
        assert!(!AdapterError::new(ErrorType::Timeout, 504, "x").non_retryable().retryable);
    }

    #[test]
    fn test_truncate_body_counts_chars() {
        assert_eq!(truncate_body("héllo", 2), "hé");
        assert_eq!(truncate_body("ok", 200), "ok");
    }
}
