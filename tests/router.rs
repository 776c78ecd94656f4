//! Plan-first routing: fallback decisions, breaker interplay and the
//! Bedrock budget gate, against fake adapters and stores.

mod common;

use std::sync::Arc;
use std::time::Duration;

use axum::http::HeaderMap;
use futures::StreamExt;
use rust_decimal::Decimal;

use common::*;
use plan_proxy::models::entities::{Provider, RoutingStrategy};
use plan_proxy::models::error_type::ErrorType;
use plan_proxy::proxy::adapter::AdapterError;
use plan_proxy::proxy::circuit_breaker::{CircuitBreaker, CircuitState};
use plan_proxy::proxy::router::ProxyRouter;

struct Harness {
    plan: Arc<FakeAdapter>,
    bedrock: Arc<FakeAdapter>,
    breaker: Arc<CircuitBreaker>,
    metrics: Arc<RecordingMetrics>,
    router: ProxyRouter,
}

fn harness(plan: Arc<FakeAdapter>, budget: Arc<FakeBudgetStore>, threshold: u32) -> Harness {
    let bedrock = FakeAdapter::ok("bedrock");
    let breaker = Arc::new(CircuitBreaker::new(
        threshold,
        Duration::from_secs(60),
        Duration::from_secs(1800),
    ));
    let metrics = RecordingMetrics::new();
    let router = ProxyRouter::new(
        plan.clone(),
        bedrock.clone(),
        breaker.clone(),
        budget_service(budget),
        metrics.clone(),
    );
    Harness {
        plan,
        bedrock,
        breaker,
        metrics,
        router,
    }
}

fn no_budget() -> Arc<FakeBudgetStore> {
    FakeBudgetStore::with(None, Decimal::ZERO)
}

#[tokio::test]
async fn test_plan_success_is_served_by_plan() {
    let h = harness(FakeAdapter::ok("plan"), no_budget(), 3);
    let ctx = ctx(RoutingStrategy::PlanFirst, true);

    let resp = h
        .router
        .route(&ctx, &request("claude-sonnet-4-5", false), &HeaderMap::new())
        .await;

    assert!(resp.success);
    assert_eq!(resp.provider, Provider::Plan);
    assert!(!resp.is_fallback);
    assert_eq!(resp.status_code, 200);
    assert_eq!(resp.usage.unwrap().input_tokens, 10);
    assert_eq!(h.bedrock.calls(), 0);
    assert!(h.metrics.fallbacks.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_retryable_plan_error_falls_back_to_bedrock() {
    let h = harness(
        FakeAdapter::failing("plan", ErrorType::RateLimit, 429),
        no_budget(),
        3,
    );
    let ctx = ctx(RoutingStrategy::PlanFirst, true);

    let resp = h
        .router
        .route(&ctx, &request("claude-sonnet-4-5", false), &HeaderMap::new())
        .await;

    assert!(resp.success);
    assert_eq!(resp.provider, Provider::Bedrock);
    assert!(resp.is_fallback);
    assert_eq!(h.plan.calls(), 1);
    assert_eq!(h.bedrock.calls(), 1);
    assert_eq!(
        h.metrics.fallbacks.lock().unwrap().as_slice(),
        &[(Provider::Plan, Provider::Bedrock, "rate_limit".to_string())]
    );
    // One trigger is below the threshold.
    assert_eq!(h.breaker.state(ctx.access_key_id), CircuitState::Closed);
    let snap = h
        .breaker
        .snapshot()
        .into_iter()
        .find(|s| s.access_key_id == ctx.access_key_id)
        .unwrap();
    assert_eq!(snap.failure_count, 1);
}

#[tokio::test]
async fn test_non_retryable_plan_error_is_returned() {
    let h = harness(
        FakeAdapter::failing("plan", ErrorType::ClientError, 400),
        no_budget(),
        3,
    );
    let ctx = ctx(RoutingStrategy::PlanFirst, true);

    let resp = h
        .router
        .route(&ctx, &request("claude-sonnet-4-5", false), &HeaderMap::new())
        .await;

    assert!(!resp.success);
    assert_eq!(resp.provider, Provider::Plan);
    assert_eq!(resp.status_code, 400);
    assert_eq!(resp.error_type.as_deref(), Some("invalid_request_error"));
    assert_eq!(h.bedrock.calls(), 0);
}

#[tokio::test]
async fn test_fallback_needs_both_flag_and_type() {
    // Retryable type, flag cleared.
    let cleared = AdapterError::new(ErrorType::Timeout, 504, "slow").non_retryable();
    // Flag set on a type outside the retryable set.
    let mut flagged = AdapterError::new(ErrorType::ClientError, 400, "bad");
    flagged.retryable = true;

    for err in [cleared, flagged] {
        let status = err.status_code;
        let h = harness(FakeAdapter::with_error("plan", err), no_budget(), 3);
        let ctx = ctx(RoutingStrategy::PlanFirst, true);

        let resp = h
            .router
            .route(&ctx, &request("claude-sonnet-4-5", false), &HeaderMap::new())
            .await;

        assert!(!resp.success);
        assert_eq!(resp.provider, Provider::Plan);
        assert_eq!(resp.status_code, status);
        assert_eq!(h.bedrock.calls(), 0);
    }
}

#[tokio::test]
async fn test_retryable_error_without_bedrock_key_is_overloaded() {
    let h = harness(
        FakeAdapter::failing("plan", ErrorType::ServerError, 500),
        no_budget(),
        3,
    );
    let ctx = ctx(RoutingStrategy::PlanFirst, false);

    let resp = h
        .router
        .route(&ctx, &request("claude-sonnet-4-5", false), &HeaderMap::new())
        .await;

    assert!(!resp.success);
    assert_eq!(resp.status_code, 503);
    assert_eq!(resp.error_type.as_deref(), Some("overloaded_error"));
    assert_eq!(h.bedrock.calls(), 0);
}

#[tokio::test]
async fn test_open_circuit_skips_plan() {
    let h = harness(
        FakeAdapter::failing("plan", ErrorType::ServerError, 503),
        no_budget(),
        1,
    );
    let ctx = ctx(RoutingStrategy::PlanFirst, true);
    let req = request("claude-sonnet-4-5", false);

    let first = h.router.route(&ctx, &req, &HeaderMap::new()).await;
    assert!(first.is_fallback);
    assert_eq!(h.breaker.state(ctx.access_key_id), CircuitState::Open);

    let second = h.router.route(&ctx, &req, &HeaderMap::new()).await;
    assert!(second.success);
    assert_eq!(second.provider, Provider::Bedrock);
    // Plan was never attempted, so this is not a fallback.
    assert!(!second.is_fallback);
    assert_eq!(h.plan.calls(), 1);
    assert_eq!(h.bedrock.calls(), 2);

    let reasons: Vec<String> = h
        .metrics
        .fallbacks
        .lock()
        .unwrap()
        .iter()
        .map(|(_, _, r)| r.clone())
        .collect();
    assert_eq!(reasons, vec!["server_error", "plan_skipped"]);
}

#[tokio::test]
async fn test_open_circuit_without_bedrock_key_is_overloaded() {
    let h = harness(
        FakeAdapter::failing("plan", ErrorType::ServerError, 503),
        no_budget(),
        1,
    );
    let ctx = ctx(RoutingStrategy::PlanFirst, false);
    h.breaker.record_failure(ctx.access_key_id, ErrorType::ServerError);
    assert_eq!(h.breaker.state(ctx.access_key_id), CircuitState::Open);

    let resp = h
        .router
        .route(&ctx, &request("claude-sonnet-4-5", false), &HeaderMap::new())
        .await;

    assert!(!resp.success);
    assert_eq!(resp.status_code, 503);
    assert_eq!(resp.error_type.as_deref(), Some("overloaded_error"));
    assert_eq!(resp.provider, Provider::Plan);
    assert!(!resp.is_fallback);
    assert_eq!(h.plan.calls(), 0);
    assert_eq!(h.bedrock.calls(), 0);
    assert!(h.metrics.fallbacks.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_breaker_is_per_access_key() {
    let h = harness(
        FakeAdapter::failing("plan", ErrorType::RateLimit, 429),
        no_budget(),
        1,
    );
    let a = ctx(RoutingStrategy::PlanFirst, true);
    let b = ctx(RoutingStrategy::PlanFirst, true);
    let req = request("claude-sonnet-4-5", false);

    h.router.route(&a, &req, &HeaderMap::new()).await;
    h.router.route(&b, &req, &HeaderMap::new()).await;

    // Both keys tried Plan once; neither was skipped because of the other.
    assert_eq!(h.plan.calls(), 2);
}

#[tokio::test]
async fn test_bedrock_only_never_calls_plan() {
    let h = harness(FakeAdapter::ok("plan"), no_budget(), 3);
    let ctx = ctx(RoutingStrategy::BedrockOnly, true);

    let resp = h
        .router
        .route(&ctx, &request("claude-opus-4-5", false), &HeaderMap::new())
        .await;

    assert!(resp.success);
    assert_eq!(resp.provider, Provider::Bedrock);
    assert!(!resp.is_fallback);
    assert_eq!(h.plan.calls(), 0);
}

#[tokio::test]
async fn test_bedrock_only_without_key_is_unavailable() {
    let h = harness(FakeAdapter::ok("plan"), no_budget(), 3);
    let ctx = ctx(RoutingStrategy::BedrockOnly, false);

    let resp = h
        .router
        .route(&ctx, &request("claude-opus-4-5", false), &HeaderMap::new())
        .await;

    assert_eq!(resp.status_code, 503);
    assert_eq!(resp.error_type.as_deref(), Some("api_error"));
    assert_eq!(h.plan.calls() + h.bedrock.calls(), 0);
}

#[tokio::test]
async fn test_exhausted_budget_blocks_bedrock() {
    let budget = FakeBudgetStore::with(Some(Decimal::new(1000, 2)), Decimal::new(1000, 2));
    let h = harness(
        FakeAdapter::failing("plan", ErrorType::UsageLimit, 429),
        budget,
        3,
    );
    let ctx = ctx(RoutingStrategy::PlanFirst, true);

    let resp = h
        .router
        .route(&ctx, &request("claude-sonnet-4-5", false), &HeaderMap::new())
        .await;

    assert!(!resp.success);
    assert_eq!(resp.provider, Provider::Bedrock);
    assert_eq!(resp.status_code, 429);
    assert_eq!(resp.error_type.as_deref(), Some("rate_limit_error"));
    assert!(resp
        .error_message
        .unwrap()
        .starts_with("Monthly budget exceeded. Current usage: $10.00, Budget limit: $10.00."));
    assert_eq!(h.bedrock.calls(), 0);
}

#[tokio::test]
async fn test_budget_lookup_failure_fails_open() {
    let h = harness(
        FakeAdapter::failing("plan", ErrorType::Timeout, 504),
        FakeBudgetStore::broken(),
        3,
    );
    let ctx = ctx(RoutingStrategy::PlanFirst, true);

    let resp = h
        .router
        .route(&ctx, &request("claude-sonnet-4-5", false), &HeaderMap::new())
        .await;

    assert!(resp.success);
    assert_eq!(resp.provider, Provider::Bedrock);
}

#[tokio::test]
async fn test_budget_not_checked_for_plan_traffic() {
    let budget = FakeBudgetStore::with(Some(Decimal::ONE), Decimal::ONE_HUNDRED);
    let h = harness(FakeAdapter::ok("plan"), budget.clone(), 3);
    let ctx = ctx(RoutingStrategy::PlanFirst, true);

    let resp = h
        .router
        .route(&ctx, &request("claude-sonnet-4-5", false), &HeaderMap::new())
        .await;

    assert!(resp.success);
    assert_eq!(
        budget.lookups.load(std::sync::atomic::Ordering::SeqCst),
        0
    );
}

#[tokio::test]
async fn test_stream_falls_back_before_first_byte() {
    let h = harness(
        FakeAdapter::failing("plan", ErrorType::RateLimit, 429),
        no_budget(),
        3,
    );
    let ctx = ctx(RoutingStrategy::PlanFirst, true);

    let routed = h
        .router
        .route_stream(&ctx, &request("claude-sonnet-4-5", true), &HeaderMap::new())
        .await;

    assert_eq!(routed.provider, Provider::Bedrock);
    assert!(routed.is_fallback);
    let chunks: Vec<_> = routed.result.unwrap().collect().await;
    assert_eq!(chunks.len(), 4);
    assert!(chunks.iter().all(|c| c.is_ok()));
    assert_eq!(h.bedrock.streams.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_stream_non_retryable_error_surfaces() {
    let h = harness(
        FakeAdapter::failing("plan", ErrorType::ClientError, 413),
        no_budget(),
        3,
    );
    let ctx = ctx(RoutingStrategy::PlanFirst, true);

    let routed = h
        .router
        .route_stream(&ctx, &request("claude-sonnet-4-5", true), &HeaderMap::new())
        .await;

    let err = routed.result.err().unwrap();
    assert_eq!(err.status_code, 413);
    assert_eq!(err.metric_label(), "client_error");
    assert_eq!(h.bedrock.calls(), 0);
}
