//! Prometheus metrics for the proxy.
//!
//! Every recorder owns its own `Registry`, so tests can build as many as
//! they like. `/metrics` renders the one held in `AppState`.

use dashmap::DashSet;
use prometheus::{
    histogram_opts, opts, CounterVec, Encoder, HistogramVec, Registry, TextEncoder,
};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::models::entities::Provider;
use crate::models::messages::Usage;
use crate::models::pricing::normalize_model_id;

/// Distinct model labels kept before bucketing to "other".
const MAX_MODEL_LABELS: usize = 200;

/// One finished proxy request, as seen by the metrics sink.
#[derive(Debug, Clone)]
pub struct RequestMetrics<'a> {
    pub provider: Provider,
    pub model: &'a str,
    pub success: bool,
    pub stream: bool,
    pub latency_ms: u64,
    pub ttft_ms: Option<u64>,
    pub usage: Option<&'a Usage>,
    pub cost_usd: Option<Decimal>,
    pub error_type: Option<&'a str>,
}

/// Where request metrics go. Emission is best-effort: callers log and drop
/// the error.
pub trait MetricsSink: Send + Sync {
    fn record_request(&self, m: &RequestMetrics<'_>) -> anyhow::Result<()>;

    fn record_fallback(&self, from: Provider, to: Provider, reason: &str) -> anyhow::Result<()>;
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record_request(&self, _m: &RequestMetrics<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    fn record_fallback(&self, _from: Provider, _to: Provider, _reason: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

pub struct PrometheusRecorder {
    registry: Registry,
    requests_total: CounterVec,
    latency_seconds: HistogramVec,
    ttft_seconds: HistogramVec,
    tokens_total: CounterVec,
    cost_usd_total: CounterVec,
    errors_total: CounterVec,
    fallbacks_total: CounterVec,
    seen_models: DashSet<String>,
}

impl PrometheusRecorder {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let requests_total = CounterVec::new(
            opts!("proxy_requests_total", "Total proxied requests"),
            &["provider", "model", "status", "stream"],
        )?;
        let latency_seconds = HistogramVec::new(
            histogram_opts!(
                "proxy_latency_seconds",
                "End-to-end request latency in seconds",
                // LLM-sized buckets: 100ms to 120s
                vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]
            ),
            &["provider", "model", "stream"],
        )?;
        let ttft_seconds = HistogramVec::new(
            histogram_opts!(
                "proxy_ttft_seconds",
                "Time to first byte in seconds (streaming only)",
                vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0, 10.0]
            ),
            &["provider", "model"],
        )?;
        let tokens_total = CounterVec::new(
            opts!("proxy_tokens_total", "Tokens processed"),
            &["provider", "model", "token_type"],
        )?;
        let cost_usd_total = CounterVec::new(
            opts!("proxy_cost_usd_total", "Estimated cost in USD"),
            &["provider", "model"],
        )?;
        let errors_total = CounterVec::new(
            opts!("proxy_errors_total", "Failed requests by error type"),
            &["provider", "error_type"],
        )?;
        let fallbacks_total = CounterVec::new(
            opts!("proxy_fallbacks_total", "Requests that moved to another provider"),
            &["from_provider", "to_provider", "reason"],
        )?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(latency_seconds.clone()))?;
        registry.register(Box::new(ttft_seconds.clone()))?;
        registry.register(Box::new(tokens_total.clone()))?;
        registry.register(Box::new(cost_usd_total.clone()))?;
        registry.register(Box::new(errors_total.clone()))?;
        registry.register(Box::new(fallbacks_total.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            latency_seconds,
            ttft_seconds,
            tokens_total,
            cost_usd_total,
            errors_total,
            fallbacks_total,
            seen_models: DashSet::new(),
        })
    }

    /// Normalized model id, or "other" once the label budget is spent.
    fn model_label(&self, model: &str) -> String {
        if model.is_empty() {
            return "unknown".to_string();
        }
        let normalized = normalize_model_id(model);
        if self.seen_models.contains(&normalized) {
            return normalized;
        }
        if self.seen_models.len() >= MAX_MODEL_LABELS {
            return "other".to_string();
        }
        self.seen_models.insert(normalized.clone());
        normalized
    }

    /// Prometheus text exposition of this recorder's registry.
    pub fn encode(&self) -> anyhow::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

impl MetricsSink for PrometheusRecorder {
    fn record_request(&self, m: &RequestMetrics<'_>) -> anyhow::Result<()> {
        let provider = m.provider.as_str();
        let model = self.model_label(m.model);
        let status = if m.success { "success" } else { "error" };
        let stream = if m.stream { "true" } else { "false" };

        self.requests_total
            .get_metric_with_label_values(&[provider, &model, status, stream])?
            .inc();
        self.latency_seconds
            .get_metric_with_label_values(&[provider, &model, stream])?
            .observe(m.latency_ms as f64 / 1000.0);

        if let Some(ttft_ms) = m.ttft_ms {
            self.ttft_seconds
                .get_metric_with_label_values(&[provider, &model])?
                .observe(ttft_ms as f64 / 1000.0);
        }

        if let Some(usage) = m.usage {
            let counts = [
                ("input", usage.input_tokens),
                ("output", usage.output_tokens),
                ("cache_read", usage.cache_read()),
                ("cache_creation", usage.cache_creation()),
            ];
            for (token_type, count) in counts {
                if count > 0 {
                    self.tokens_total
                        .get_metric_with_label_values(&[provider, &model, token_type])?
                        .inc_by(count as f64);
                }
            }
        }

        if let Some(cost) = m.cost_usd.and_then(|c| c.to_f64()) {
            if cost > 0.0 {
                self.cost_usd_total
                    .get_metric_with_label_values(&[provider, &model])?
                    .inc_by(cost);
            }
        }

        if !m.success {
            self.errors_total
                .get_metric_with_label_values(&[provider, m.error_type.unwrap_or("unknown")])?
                .inc();
        }
        Ok(())
    }

    fn record_fallback(&self, from: Provider, to: Provider, reason: &str) -> anyhow::Result<()> {
        self.fallbacks_total
            .get_metric_with_label_values(&[from.as_str(), to.as_str(), reason])?
            .inc();
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────
