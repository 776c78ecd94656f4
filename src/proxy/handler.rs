//! Anthropic-compatible proxy endpoints under `/ak/:access_key/v1`.

use std::sync::Arc;
use std::time::Instant;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::errors::anthropic_error;
use crate::models::messages::MessagesRequest;
use crate::proxy::context::RequestContext;
use crate::proxy::plan::passthrough_headers;
use crate::proxy::stream_bridge::tee_usage_stream;
use crate::proxy::thinking;
use crate::vault::KeyMasker;
use crate::AppState;

/// Authenticate the path key; unknown or unusable keys are a plain 404.
async fn resolve_context(state: &AppState, access_key: &str) -> Result<RequestContext, Response> {
    match state.auth.authenticate(access_key).await {
        Ok(Some(ctx)) => Ok(ctx),
        Ok(None) => {
            tracing::info!(key = %KeyMasker::mask(access_key), "access key rejected");
            Err(anthropic_error(404, "not_found_error", "Not found", None))
        }
        Err(e) => {
            tracing::error!(error = %e, "access key lookup failed");
            Err(anthropic_error(500, "api_error", "Internal server error", None))
        }
    }
}

fn parse_request(body: &[u8], request_id: &str) -> Result<MessagesRequest, Response> {
    serde_json::from_slice(body).map_err(|e| {
        anthropic_error(
            400,
            "invalid_request_error",
            &format!("Invalid request body: {}", e),
            Some(request_id),
        )
    })
}

/// `POST /ak/:access_key/v1/messages`
pub async fn messages(
    State(state): State<Arc<AppState>>,
    Path(access_key): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let start = Instant::now();
    let ctx = match resolve_context(&state, &access_key).await {
        Ok(ctx) => ctx,
        Err(resp) => return resp,
    };
    let mut request = match parse_request(&body, &ctx.request_id) {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    thinking::normalize(&mut request);
    let outbound = passthrough_headers(&headers);

    tracing::info!(
        request_id = %ctx.request_id,
        access_key_prefix = %ctx.access_key_prefix,
        model = %request.model,
        stream = request.stream,
        routing_strategy = %ctx.routing_strategy,
        "proxy_request_received"
    );

    if request.stream {
        return stream_messages(state, ctx, request, outbound, start).await;
    }

    let response = state.router.route(&ctx, &request, &outbound).await;
    let latency_ms = start.elapsed().as_millis() as u64;

    tracing::info!(
        request_id = %ctx.request_id,
        provider = %response.provider,
        success = response.success,
        status = response.status_code,
        is_fallback = response.is_fallback,
        latency_ms,
        "proxy_route_result"
    );

    // Recording outlives the client connection.
    let recorder = state.recorder.clone();
    let (rec_ctx, rec_response, model) = (ctx.clone(), response.clone(), request.model.clone());
    tokio::spawn(async move {
        let _ = recorder
            .record(&rec_ctx, &rec_response, latency_ms, &model)
            .await;
    });

    match (response.success, response.response) {
        (true, Some(body)) => with_request_id(Json(body).into_response(), &ctx.request_id),
        _ => anthropic_error(
            response.status_code,
            response.error_type.as_deref().unwrap_or("api_error"),
            response.error_message.as_deref().unwrap_or("Unknown error"),
            Some(&ctx.request_id),
        ),
    }
}

async fn stream_messages(
    state: Arc<AppState>,
    ctx: RequestContext,
    request: MessagesRequest,
    outbound: HeaderMap,
    start: Instant,
) -> Response {
    let routed = state.router.route_stream(&ctx, &request, &outbound).await;

    tracing::info!(
        request_id = %ctx.request_id,
        provider = %routed.provider,
        success = routed.result.is_ok(),
        is_fallback = routed.is_fallback,
        "proxy_route_result"
    );

    let upstream = match routed.result {
        Ok(stream) => stream,
        Err(e) => {
            state.recorder.record_failure(
                routed.provider,
                &request.model,
                true,
                start.elapsed().as_millis() as u64,
                e.metric_label(),
            );
            return anthropic_error(e.status_code, e.error_type, &e.message, Some(&ctx.request_id));
        }
    };

    let (body, done) = tee_usage_stream(upstream, start, ctx.request_id.clone());

    let recorder = state.recorder.clone();
    let (provider, is_fallback, model) = (routed.provider, routed.is_fallback, request.model);
    let rec_ctx = ctx.clone();
    tokio::spawn(async move {
        let Ok(outcome) = done.await else {
            return;
        };
        let latency_ms = start.elapsed().as_millis() as u64;
        match outcome.usage {
            Some(usage) => {
                let _ = recorder
                    .record_streaming_usage(
                        &rec_ctx,
                        &usage,
                        latency_ms,
                        outcome.ttft_ms,
                        &model,
                        provider,
                        is_fallback,
                    )
                    .await;
            }
            None => {
                tracing::warn!(
                    request_id = %rec_ctx.request_id,
                    provider = %provider,
                    client_disconnected = outcome.client_disconnected,
                    "streaming_usage_missing"
                );
                if outcome.upstream_error.is_some() {
                    recorder.record_failure(provider, &model, true, latency_ms, "stream_error");
                }
            }
        }
    });

    let built = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .header("x-request-id", ctx.request_id.as_str())
        .body(body);
    match built {
        Ok(resp) => resp.into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to build streaming response");
            anthropic_error(500, "api_error", "Internal server error", Some(&ctx.request_id))
        }
    }
}

/// `POST /ak/:access_key/v1/messages/count_tokens`
pub async fn count_tokens(
    State(state): State<Arc<AppState>>,
    Path(access_key): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let ctx = match resolve_context(&state, &access_key).await {
        Ok(ctx) => ctx,
        Err(resp) => return resp,
    };
    let request = match parse_request(&body, &ctx.request_id) {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    let outbound = passthrough_headers(&headers);

    if !state.plan.has_credentials(&outbound) {
        return anthropic_error(
            401,
            "authentication_error",
            "Missing API key for count_tokens",
            Some(&ctx.request_id),
        );
    }

    match state.plan.count_tokens(&outbound, &request).await {
        Ok(counted) => with_request_id(Json(counted).into_response(), &ctx.request_id),
        Err(e) => {
            tracing::warn!(
                request_id = %ctx.request_id,
                error_type = %e.error_type,
                status = e.status_code,
                "count_tokens failed"
            );
            anthropic_error(
                e.status_code,
                e.error_type.anthropic_type(),
                &e.message,
                Some(&ctx.request_id),
            )
        }
    }
}

fn with_request_id(mut resp: Response, request_id: &str) -> Response {
    if let Ok(value) = header::HeaderValue::from_str(request_id) {
        resp.headers_mut().insert("x-request-id", value);
    }
    resp
}
