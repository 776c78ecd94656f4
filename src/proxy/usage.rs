//! Usage and cost accounting for completed requests.

use std::sync::Arc;

use chrono::Utc;

use crate::middleware::metrics::{MetricsSink, RequestMetrics};
use crate::models::buckets::all_bucket_starts;
use crate::models::cost::calculate_cost;
use crate::models::entities::Provider;
use crate::models::messages::Usage;
use crate::models::pricing::{normalize_model_id, PricingConfig};
use crate::proxy::budget::BudgetService;
use crate::proxy::context::RequestContext;
use crate::proxy::router::ProxyResponse;
use crate::store::{TokenUsageRecord, UsageStore};

/// Pricing region used for Plan traffic.
const PLAN_PRICING_REGION: &str = "global";

pub struct UsageRecorder {
    store: Arc<dyn UsageStore>,
    pricing: PricingConfig,
    budget: BudgetService,
    metrics: Arc<dyn MetricsSink>,
}

impl UsageRecorder {
    pub fn new(
        store: Arc<dyn UsageStore>,
        pricing: PricingConfig,
        budget: BudgetService,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            store,
            pricing,
            budget,
            metrics,
        }
    }

    /// Emit metrics for a buffered response and persist its usage when it
    /// succeeded. Returns whether a new usage row was written.
    pub async fn record(
        &self,
        ctx: &RequestContext,
        response: &ProxyResponse,
        latency_ms: u64,
        model: &str,
    ) -> anyhow::Result<bool> {
        let usage = response.usage.filter(|_| response.success);
        let cost = match &usage {
            Some(u) => Some(
                calculate_cost(
                    u,
                    self.pricing
                        .get_pricing(model, pricing_region(ctx, response.provider))
                        .await
                        .as_ref(),
                )
                .total_cost,
            ),
            None => None,
        };

        self.emit(RequestMetrics {
            provider: response.provider,
            model,
            success: response.success,
            stream: false,
            latency_ms,
            ttft_ms: None,
            usage: usage.as_ref(),
            cost_usd: cost,
            error_type: response.error_type.as_deref(),
        });

        match usage {
            Some(usage) => {
                self.persist(ctx, &usage, latency_ms, model, response.provider, response.is_fallback)
                    .await
            }
            None => Ok(false),
        }
    }

    /// Persist usage collected from a finished stream.
    #[allow(clippy::too_many_arguments)]
    pub async fn record_streaming_usage(
        &self,
        ctx: &RequestContext,
        usage: &Usage,
        latency_ms: u64,
        ttft_ms: Option<u64>,
        model: &str,
        provider: Provider,
        is_fallback: bool,
    ) -> anyhow::Result<bool> {
        let pricing = self
            .pricing
            .get_pricing(model, pricing_region(ctx, provider))
            .await;
        let cost = calculate_cost(usage, pricing.as_ref());

        self.emit(RequestMetrics {
            provider,
            model,
            success: true,
            stream: true,
            latency_ms,
            ttft_ms,
            usage: Some(usage),
            cost_usd: Some(cost.total_cost),
            error_type: None,
        });

        self.persist(ctx, usage, latency_ms, model, provider, is_fallback)
            .await
    }

    /// Count a request that produced no usage (failed before or during the stream).
    pub fn record_failure(
        &self,
        provider: Provider,
        model: &str,
        stream: bool,
        latency_ms: u64,
        error_type: &str,
    ) {
        self.emit(RequestMetrics {
            provider,
            model,
            success: false,
            stream,
            latency_ms,
            ttft_ms: None,
            usage: None,
            cost_usd: None,
            error_type: Some(error_type),
        });
    }

    fn emit(&self, m: RequestMetrics<'_>) {
        if let Err(e) = self.metrics.record_request(&m) {
            tracing::warn!(error = %e, "metrics emission failed");
        }
    }

    async fn persist(
        &self,
        ctx: &RequestContext,
        usage: &Usage,
        latency_ms: u64,
        model: &str,
        provider: Provider,
        is_fallback: bool,
    ) -> anyhow::Result<bool> {
        let now = Utc::now();
        let region = pricing_region(ctx, provider);
        let pricing = self.pricing.get_pricing(model, region).await;
        let cost = calculate_cost(usage, pricing.as_ref());

        let record = TokenUsageRecord {
            request_id: ctx.request_id.clone(),
            user_id: ctx.user_id,
            access_key_id: ctx.access_key_id,
            model: model.to_string(),
            input_tokens: usage.input_tokens as i64,
            output_tokens: usage.output_tokens as i64,
            total_tokens: usage.total_tokens() as i64,
            cache_read_tokens: usage.cache_read() as i64,
            cache_creation_tokens: usage.cache_creation() as i64,
            input_cost_usd: cost.input_cost,
            output_cost_usd: cost.output_cost,
            cache_write_cost_usd: cost.cache_write_cost,
            cache_read_cost_usd: cost.cache_read_cost,
            estimated_cost_usd: cost.total_cost,
            pricing_region: pricing
                .as_ref()
                .map(|p| p.region.clone())
                .unwrap_or_else(|| region.to_string()),
            pricing_model_id: pricing
                .as_ref()
                .map(|p| p.model_id.clone())
                .unwrap_or_else(|| normalize_model_id(model)),
            pricing_effective_date: pricing.as_ref().map(|p| p.effective_date),
            pricing_input_price_per_million: pricing
                .as_ref()
                .map(|p| p.input_price_per_million)
                .unwrap_or_default(),
            pricing_output_price_per_million: pricing
                .as_ref()
                .map(|p| p.output_price_per_million)
                .unwrap_or_default(),
            pricing_cache_write_price_per_million: pricing
                .as_ref()
                .map(|p| p.cache_write_price_per_million)
                .unwrap_or_default(),
            pricing_cache_read_price_per_million: pricing
                .as_ref()
                .map(|p| p.cache_read_price_per_million)
                .unwrap_or_default(),
            provider: provider.as_str().to_string(),
            is_fallback,
            latency_ms: latency_ms as i64,
            created_at: now,
        };

        match self.store.record_usage(&record, &all_bucket_starts(now)).await {
            Ok(inserted) => {
                self.budget.invalidate_cache(ctx.user_id);
                if !inserted {
                    tracing::debug!(request_id = %ctx.request_id, "usage already recorded");
                }
                Ok(inserted)
            }
            Err(e) => {
                tracing::error!(
                    request_id = %ctx.request_id,
                    user_id = %ctx.user_id,
                    error = %e,
                    "usage_record_failed"
                );
                Err(e)
            }
        }
    }
}

fn pricing_region(ctx: &RequestContext, provider: Provider) -> &str {
    match provider {
        Provider::Bedrock => &ctx.bedrock_region,
        Provider::Plan => PLAN_PRICING_REGION,
    }
}
