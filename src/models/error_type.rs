use serde::{Deserialize, Serialize};

/// Internal error kinds reported by upstream adapters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    RateLimit,
    UsageLimit,
    ServerError,
    ClientError,
    Timeout,
    NetworkError,
    BedrockAuthError,
    BedrockQuotaExceeded,
    BedrockValidation,
    BedrockModelError,
    BedrockUnavailable,
}

/// Kinds eligible for Plan → Bedrock fallback.
pub const RETRYABLE_ERRORS: &[ErrorType] = &[
    ErrorType::RateLimit,
    ErrorType::UsageLimit,
    ErrorType::ServerError,
    ErrorType::Timeout,
    ErrorType::NetworkError,
];

/// Kinds counted by the circuit breaker.
pub const CIRCUIT_TRIGGERS: &[ErrorType] = &[ErrorType::RateLimit, ErrorType::ServerError];

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::RateLimit => "rate_limit",
            ErrorType::UsageLimit => "usage_limit",
            ErrorType::ServerError => "server_error",
            ErrorType::ClientError => "client_error",
            ErrorType::Timeout => "timeout",
            ErrorType::NetworkError => "network_error",
            ErrorType::BedrockAuthError => "bedrock_auth_error",
            ErrorType::BedrockQuotaExceeded => "bedrock_quota_exceeded",
            ErrorType::BedrockValidation => "bedrock_validation",
            ErrorType::BedrockModelError => "bedrock_model_error",
            ErrorType::BedrockUnavailable => "bedrock_unavailable",
        }
    }

    pub fn is_retryable(&self) -> bool {
        RETRYABLE_ERRORS.contains(self)
    }

    pub fn trips_circuit(&self) -> bool {
        CIRCUIT_TRIGGERS.contains(self)
    }

    /// The `error.type` reported to Anthropic API clients.
    pub fn anthropic_type(&self) -> &'static str {
        match self {
            ErrorType::RateLimit | ErrorType::UsageLimit => "rate_limit_error",
            ErrorType::ServerError => "api_error",
            ErrorType::ClientError => "invalid_request_error",
            ErrorType::Timeout => "overloaded_error",
            ErrorType::NetworkError => "api_error",
            ErrorType::BedrockAuthError => "authentication_error",
            ErrorType::BedrockQuotaExceeded => "rate_limit_error",
            ErrorType::BedrockValidation => "invalid_request_error",
            ErrorType::BedrockModelError => "api_error",
            ErrorType::BedrockUnavailable => "overloaded_error",
        }
    }
}

impl std::fmt::Display for ErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
