//! Plan-first routing with Bedrock fallback.
//!
//! Decision table per request:
//!
//! | strategy     | breaker | Plan result          | Bedrock key | outcome                    |
//! |--------------|---------|----------------------|-------------|----------------------------|
//! | bedrock_only | -       | -                    | no          | 503 api_error              |
//! | bedrock_only | -       | -                    | yes         | budget, then Bedrock       |
//! | plan_first   | closed  | ok                   | -           | Plan response              |
//! | plan_first   | closed  | non-retryable error  | -           | Plan error                 |
//! | plan_first   | closed  | retryable error      | yes         | budget, then Bedrock (fb)  |
//! | plan_first   | open    | not called           | yes         | budget, then Bedrock       |
//! | plan_first   | any     | retryable / skipped  | no          | 503 overloaded_error       |

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::HeaderMap;
use serde::Serialize;

use crate::middleware::metrics::MetricsSink;
use crate::models::entities::{Provider, RoutingStrategy};
use crate::models::error_type::ErrorType;
use crate::models::messages::{MessagesRequest, MessagesResponse, Usage};
use crate::proxy::adapter::{Adapter, AdapterCall, AdapterError, AdapterResponse, ByteStream};
use crate::proxy::budget::{format_budget_exceeded_message, BudgetService};
use crate::proxy::circuit_breaker::CircuitBreaker;
use crate::proxy::context::RequestContext;

/// Outcome of a buffered (non-streaming) request.
#[derive(Debug, Clone, Serialize)]
pub struct ProxyResponse {
    pub success: bool,
    pub response: Option<MessagesResponse>,
    pub usage: Option<Usage>,
    pub provider: Provider,
    pub is_fallback: bool,
    pub status_code: u16,
    /// Anthropic error type, e.g. `rate_limit_error`.
    pub error_type: Option<String>,
    pub error_message: Option<String>,
}

/// A failure surfaced to the client.
#[derive(Debug, Clone)]
pub struct RouteError {
    pub status_code: u16,
    pub error_type: &'static str,
    pub message: String,
    /// Adapter classification when the error came from an upstream.
    pub kind: Option<ErrorType>,
}

impl RouteError {
    fn new(status_code: u16, error_type: &'static str, message: impl Into<String>) -> Self {
        Self {
            status_code,
            error_type,
            message: message.into(),
            kind: None,
        }
    }

    /// Label for the errors metric.
    pub fn metric_label(&self) -> &str {
        match self.kind {
            Some(kind) => kind.as_str(),
            None => self.error_type,
        }
    }
}

impl From<AdapterError> for RouteError {
    fn from(e: AdapterError) -> Self {
        Self {
            status_code: e.status_code,
            error_type: e.error_type.anthropic_type(),
            message: e.message,
            kind: Some(e.error_type),
        }
    }
}

/// Where a request ended up and what came back.
pub struct Routed<T> {
    pub provider: Provider,
    pub is_fallback: bool,
    pub result: Result<T, RouteError>,
}

/// Outcome of a streaming request. On success the stream already carries
/// Anthropic SSE.
pub type StreamRoute = Routed<ByteStream>;

/// The per-mode upstream call used by the shared dispatch.
#[async_trait]
trait Dispatch: Send + Sync {
    type Output: Send;

    async fn call(
        &self,
        adapter: &dyn Adapter,
        call: &AdapterCall<'_>,
    ) -> Result<Self::Output, AdapterError>;
}

struct Invoke;
struct Stream;

#[async_trait]
impl Dispatch for Invoke {
    type Output = AdapterResponse;

    async fn call(
        &self,
        adapter: &dyn Adapter,
        call: &AdapterCall<'_>,
    ) -> Result<AdapterResponse, AdapterError> {
        adapter.invoke(call).await
    }
}

#[async_trait]
impl Dispatch for Stream {
    type Output = ByteStream;

    async fn call(
        &self,
        adapter: &dyn Adapter,
        call: &AdapterCall<'_>,
    ) -> Result<ByteStream, AdapterError> {
        adapter.stream(call).await
    }
}

pub struct ProxyRouter {
    plan: Arc<dyn Adapter>,
    bedrock: Arc<dyn Adapter>,
    breaker: Arc<CircuitBreaker>,
    budget: BudgetService,
    metrics: Arc<dyn MetricsSink>,
}

impl ProxyRouter {
    pub fn new(
        plan: Arc<dyn Adapter>,
        bedrock: Arc<dyn Adapter>,
        breaker: Arc<CircuitBreaker>,
        budget: BudgetService,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            plan,
            bedrock,
            breaker,
            budget,
            metrics,
        }
    }

    pub async fn route(
        &self,
        ctx: &RequestContext,
        request: &MessagesRequest,
        headers: &HeaderMap,
    ) -> ProxyResponse {
        let routed = self.dispatch(&Invoke, ctx, request, headers).await;
        match routed.result {
            Ok(out) => ProxyResponse {
                success: true,
                response: Some(out.response),
                usage: Some(out.usage),
                provider: routed.provider,
                is_fallback: routed.is_fallback,
                status_code: 200,
                error_type: None,
                error_message: None,
            },
            Err(e) => ProxyResponse {
                success: false,
                response: None,
                usage: None,
                provider: routed.provider,
                is_fallback: routed.is_fallback,
                status_code: e.status_code,
                error_type: Some(e.error_type.to_string()),
                error_message: Some(e.message),
            },
        }
    }

    pub async fn route_stream(
        &self,
        ctx: &RequestContext,
        request: &MessagesRequest,
        headers: &HeaderMap,
    ) -> StreamRoute {
        self.dispatch(&Stream, ctx, request, headers).await
    }

    async fn dispatch<D: Dispatch>(
        &self,
        mode: &D,
        ctx: &RequestContext,
        request: &MessagesRequest,
        headers: &HeaderMap,
    ) -> Routed<D::Output> {
        let call = AdapterCall {
            ctx,
            request,
            headers,
        };

        if ctx.routing_strategy == RoutingStrategy::BedrockOnly {
            if !ctx.has_bedrock_key {
                return Routed {
                    provider: Provider::Bedrock,
                    is_fallback: false,
                    result: Err(RouteError::new(
                        503,
                        "api_error",
                        "Bedrock key not configured for bedrock_only routing",
                    )),
                };
            }
            tracing::info!(
                request_id = %ctx.request_id,
                access_key_prefix = %ctx.access_key_prefix,
                "routing_bedrock_only"
            );
            return self.call_bedrock(mode, &call, false).await;
        }

        let key = ctx.access_key_id;
        let mut plan_attempted = false;
        let fallback_reason: &'static str;

        if self.breaker.is_open(key) {
            tracing::info!(
                request_id = %ctx.request_id,
                access_key_prefix = %ctx.access_key_prefix,
                "plan_skipped_circuit_open"
            );
            fallback_reason = "plan_skipped";
        } else {
            plan_attempted = true;
            match mode.call(self.plan.as_ref(), &call).await {
                Ok(out) => {
                    self.breaker.record_success(key);
                    return Routed {
                        provider: Provider::Plan,
                        is_fallback: false,
                        result: Ok(out),
                    };
                }
                Err(e) => {
                    self.breaker.record_failure(key, e.error_type);
                    if !(e.retryable && e.error_type.is_retryable()) {
                        return Routed {
                            provider: Provider::Plan,
                            is_fallback: false,
                            result: Err(e.into()),
                        };
                    }
                    tracing::warn!(
                        request_id = %ctx.request_id,
                        error_type = %e.error_type,
                        status = e.status_code,
                        "plan_failed_retryable"
                    );
                    fallback_reason = e.error_type.as_str();
                }
            }
        }

        if !ctx.has_bedrock_key {
            return Routed {
                provider: Provider::Plan,
                is_fallback: false,
                result: Err(RouteError::new(
                    503,
                    "overloaded_error",
                    "Service unavailable and no fallback configured",
                )),
            };
        }

        if let Err(e) = self
            .metrics
            .record_fallback(Provider::Plan, Provider::Bedrock, fallback_reason)
        {
            tracing::warn!(error = %e, "metrics emission failed");
        }
        self.call_bedrock(mode, &call, plan_attempted).await
    }

    async fn call_bedrock<D: Dispatch>(
        &self,
        mode: &D,
        call: &AdapterCall<'_>,
        is_fallback: bool,
    ) -> Routed<D::Output> {
        let budget = self.budget.check_budget_fail_open(call.ctx.user_id).await;
        if !budget.allowed {
            tracing::info!(
                request_id = %call.ctx.request_id,
                user_id = %call.ctx.user_id,
                current_usage = %budget.current_usage,
                "budget_exceeded"
            );
            return Routed {
                provider: Provider::Bedrock,
                is_fallback,
                result: Err(RouteError::new(
                    429,
                    "rate_limit_error",
                    format_budget_exceeded_message(&budget),
                )),
            };
        }

        Routed {
            provider: Provider::Bedrock,
            is_fallback,
            result: mode
                .call(self.bedrock.as_ref(), call)
                .await
                .map_err(RouteError::from),
        }
    }
}
