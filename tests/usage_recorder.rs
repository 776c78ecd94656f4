//! Usage recorder: pricing, idempotency, bucket fan-out, budget
//! invalidation and metrics emission.

mod common;

use std::sync::Arc;

use rust_decimal::Decimal;

use common::*;
use plan_proxy::models::entities::{Provider, RoutingStrategy};
use plan_proxy::models::messages::Usage;
use plan_proxy::models::pricing::PricingConfig;
use plan_proxy::proxy::budget::BudgetService;
use plan_proxy::proxy::router::ProxyResponse;
use plan_proxy::proxy::usage::UsageRecorder;

struct Harness {
    store: Arc<FakeUsageStore>,
    metrics: Arc<RecordingMetrics>,
    budget: BudgetService,
    recorder: UsageRecorder,
}

fn harness(store: Arc<FakeUsageStore>) -> Harness {
    let metrics = RecordingMetrics::new();
    let budget = budget_service(FakeBudgetStore::with(None, Decimal::ZERO));
    let recorder = UsageRecorder::new(
        store.clone(),
        PricingConfig::defaults(),
        budget.clone(),
        metrics.clone(),
    );
    Harness {
        store,
        metrics,
        budget,
        recorder,
    }
}

fn success(provider: Provider, usage: Usage, is_fallback: bool) -> ProxyResponse {
    ProxyResponse {
        success: true,
        response: None,
        usage: Some(usage),
        provider,
        is_fallback,
        status_code: 200,
        error_type: None,
        error_message: None,
    }
}

#[tokio::test]
async fn test_successful_request_is_priced_and_bucketed() {
    let h = harness(FakeUsageStore::new());
    let ctx = ctx(RoutingStrategy::PlanFirst, false);

    let inserted = h
        .recorder
        .record(&ctx, &success(Provider::Plan, usage(1000, 500), false), 120, "claude-sonnet-4-5-20250929")
        .await
        .unwrap();

    assert!(inserted);
    let records = h.store.records.lock().unwrap();
    assert_eq!(records.len(), 1);
    let r = &records[0];
    assert_eq!(r.request_id, ctx.request_id);
    assert_eq!(r.provider, "plan");
    assert!(!r.is_fallback);
    assert_eq!(r.total_tokens, 1500);
    assert_eq!(r.pricing_model_id, "claude-sonnet-4-5");
    assert_eq!(r.input_cost_usd, Decimal::new(3000, 6));
    assert_eq!(r.output_cost_usd, Decimal::new(7500, 6));
    assert_eq!(r.estimated_cost_usd, Decimal::new(10500, 6));
    assert_eq!(r.latency_ms, 120);
    assert_eq!(h.store.buckets.lock().unwrap().len(), 5);

    let seen = h.metrics.requests.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert!(seen[0].success);
    assert_eq!(seen[0].cost_usd, Some(Decimal::new(10500, 6)));
}

#[tokio::test]
async fn test_same_request_id_recorded_once() {
    let h = harness(FakeUsageStore::new());
    let ctx = ctx(RoutingStrategy::PlanFirst, false);
    let resp = success(Provider::Plan, usage(10, 10), false);

    assert!(h.recorder.record(&ctx, &resp, 10, "claude-haiku-4-5").await.unwrap());
    assert!(!h.recorder.record(&ctx, &resp, 10, "claude-haiku-4-5").await.unwrap());

    assert_eq!(h.store.records.lock().unwrap().len(), 1);
    assert_eq!(h.store.buckets.lock().unwrap().len(), 5);
}

#[tokio::test]
async fn test_failed_request_emits_metrics_only() {
    let h = harness(FakeUsageStore::new());
    let ctx = ctx(RoutingStrategy::PlanFirst, true);
    let resp = ProxyResponse {
        success: false,
        response: None,
        usage: None,
        provider: Provider::Bedrock,
        is_fallback: true,
        status_code: 429,
        error_type: Some("rate_limit_error".into()),
        error_message: Some("Monthly budget exceeded.".into()),
    };

    let inserted = h.recorder.record(&ctx, &resp, 5, "claude-sonnet-4-5").await.unwrap();

    assert!(!inserted);
    assert!(h.store.records.lock().unwrap().is_empty());
    let seen = h.metrics.requests.lock().unwrap();
    assert!(!seen[0].success);
    assert_eq!(seen[0].error_type.as_deref(), Some("rate_limit_error"));
}

#[tokio::test]
async fn test_recording_invalidates_budget_cache() {
    let h = harness(FakeUsageStore::new());
    let ctx = ctx(RoutingStrategy::PlanFirst, true);

    h.budget.check_budget(ctx.user_id).await.unwrap();
    assert_eq!(h.budget.cache().len(), 1);

    h.recorder
        .record(&ctx, &success(Provider::Bedrock, usage(1, 1), true), 1, "claude-sonnet-4-5")
        .await
        .unwrap();

    assert!(h.budget.cache().is_empty());
}

#[tokio::test]
async fn test_store_failure_is_reported() {
    let h = harness(FakeUsageStore::broken());
    let ctx = ctx(RoutingStrategy::PlanFirst, false);

    let result = h
        .recorder
        .record(&ctx, &success(Provider::Plan, usage(1, 1), false), 1, "claude-sonnet-4-5")
        .await;

    assert!(result.is_err());
    // Metrics go out before persistence.
    assert_eq!(h.metrics.requests.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_streaming_usage_for_bedrock_fallback() {
    let h = harness(FakeUsageStore::new());
    let ctx = ctx(RoutingStrategy::PlanFirst, true);
    let usage = Usage {
        input_tokens: 2000,
        output_tokens: 100,
        cache_read_input_tokens: Some(1_000_000),
        cache_creation_input_tokens: None,
    };

    let inserted = h
        .recorder
        .record_streaming_usage(&ctx, &usage, 900, Some(80), "claude-opus-4-5", Provider::Bedrock, true)
        .await
        .unwrap();

    assert!(inserted);
    let records = h.store.records.lock().unwrap();
    let r = &records[0];
    assert_eq!(r.provider, "bedrock");
    assert!(r.is_fallback);
    assert_eq!(r.pricing_region, "ap-northeast-2");
    assert_eq!(r.cache_read_tokens, 1_000_000);
    // 0.01 input + 0.0025 output + 0.50 cache read
    assert_eq!(r.estimated_cost_usd, Decimal::new(512500, 6));

    let seen = h.metrics.requests.lock().unwrap();
    assert!(seen[0].stream);
    assert_eq!(seen[0].provider, Provider::Bedrock);
}

#[tokio::test]
async fn test_unknown_model_costs_nothing() {
    let h = harness(FakeUsageStore::new());
    let ctx = ctx(RoutingStrategy::PlanFirst, false);

    h.recorder
        .record(&ctx, &success(Provider::Plan, usage(500, 500), false), 1, "claude-3-haiku")
        .await
        .unwrap();

    let records = h.store.records.lock().unwrap();
    assert_eq!(records[0].estimated_cost_usd, Decimal::ZERO);
    assert_eq!(records[0].pricing_model_id, "claude-3-haiku");
    assert_eq!(records[0].pricing_effective_date, None);
}

#[tokio::test]
async fn test_record_failure_counts_error() {
    let h = harness(FakeUsageStore::new());

    h.recorder
        .record_failure(Provider::Plan, "claude-sonnet-4-5", true, 30, "stream_error");

    let seen = h.metrics.requests.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert!(seen[0].stream);
    assert_eq!(seen[0].error_type.as_deref(), Some("stream_error"));
}
