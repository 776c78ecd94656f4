//! In-memory stand-ins for Postgres, the upstream adapters and the metrics
//! sink, shared by the integration suites.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use rust_decimal::Decimal;
use serde_json::json;
use uuid::Uuid;

use plan_proxy::middleware::metrics::{MetricsSink, RequestMetrics};
use plan_proxy::models::buckets::BucketType;
use plan_proxy::models::entities::{Provider, RoutingStrategy};
use plan_proxy::models::error_type::ErrorType;
use plan_proxy::models::messages::{Message, MessagesRequest, MessagesResponse, Usage};
use plan_proxy::proxy::adapter::{
    Adapter, AdapterCall, AdapterError, AdapterResponse, ByteStream, StreamError,
};
use plan_proxy::proxy::budget::BudgetService;
use plan_proxy::proxy::context::RequestContext;
use plan_proxy::store::{BudgetStore, TokenUsageRecord, UsageStore};

// ── Fixtures ─────────────────────────────────────────────────

pub fn ctx(strategy: RoutingStrategy, has_bedrock_key: bool) -> RequestContext {
    RequestContext {
        request_id: format!("req_{}", &Uuid::new_v4().simple().to_string()[..16]),
        user_id: Uuid::new_v4(),
        access_key_id: Uuid::new_v4(),
        access_key_prefix: "ak_test1".into(),
        bedrock_region: "ap-northeast-2".into(),
        bedrock_model: "global.anthropic.claude-sonnet-4-5-20250929-v1:0".into(),
        has_bedrock_key,
        routing_strategy: strategy,
    }
}

pub fn request(model: &str, stream: bool) -> MessagesRequest {
    serde_json::from_value(json!({
        "model": model,
        "max_tokens": 256,
        "stream": stream,
        "messages": [{"role": "user", "content": "hello"}],
    }))
    .unwrap()
}

pub fn user_message(text: &str) -> Message {
    Message {
        role: "user".into(),
        content: json!(text),
    }
}

pub fn usage(input: u64, output: u64) -> Usage {
    Usage {
        input_tokens: input,
        output_tokens: output,
        ..Default::default()
    }
}

pub fn sse_with_usage(input: u64, output: u64) -> Vec<Bytes> {
    vec![
        Bytes::from(format!(
            "event: message_start\ndata: {{\"type\":\"message_start\",\"message\":{{\"usage\":{{\"input_tokens\":{}}}}}}}\n\n",
            input
        )),
        Bytes::from_static(
            b"event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"hi\"}}\n\n",
        ),
        Bytes::from(format!(
            "event: message_delta\ndata: {{\"type\":\"message_delta\",\"delta\":{{\"stop_reason\":\"end_turn\"}},\"usage\":{{\"output_tokens\":{}}}}}\n\n",
            output
        )),
        Bytes::from_static(b"event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n"),
    ]
}

// ── Adapters ─────────────────────────────────────────────────

/// Adapter that always answers the same way and counts its calls.
pub struct FakeAdapter {
    name: &'static str,
    failure: Option<AdapterError>,
    usage: Usage,
    pub invokes: AtomicUsize,
    pub streams: AtomicUsize,
}

impl FakeAdapter {
    pub fn ok(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            failure: None,
            usage: usage(10, 5),
            invokes: AtomicUsize::new(0),
            streams: AtomicUsize::new(0),
        })
    }

    pub fn failing(name: &'static str, error_type: ErrorType, status: u16) -> Arc<Self> {
        Arc::new(Self {
            name,
            failure: Some(AdapterError::new(error_type, status, format!("{} failed", name))),
            usage: Usage::default(),
            invokes: AtomicUsize::new(0),
            streams: AtomicUsize::new(0),
        })
    }

    pub fn with_error(name: &'static str, error: AdapterError) -> Arc<Self> {
        Arc::new(Self {
            name,
            failure: Some(error),
            usage: Usage::default(),
            invokes: AtomicUsize::new(0),
            streams: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.invokes.load(Ordering::SeqCst) + self.streams.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Adapter for FakeAdapter {
    async fn invoke(&self, call: &AdapterCall<'_>) -> Result<AdapterResponse, AdapterError> {
        self.invokes.fetch_add(1, Ordering::SeqCst);
        if let Some(e) = &self.failure {
            return Err(e.clone());
        }
        Ok(AdapterResponse {
            response: MessagesResponse {
                id: format!("msg_{}", self.name),
                kind: "message".into(),
                role: "assistant".into(),
                content: vec![json!({"type": "text", "text": self.name})],
                model: call.request.model.clone(),
                stop_reason: Some("end_turn".into()),
                stop_sequence: None,
                usage: self.usage,
            },
            usage: self.usage,
        })
    }

    async fn stream(&self, _call: &AdapterCall<'_>) -> Result<ByteStream, AdapterError> {
        self.streams.fetch_add(1, Ordering::SeqCst);
        if let Some(e) = &self.failure {
            return Err(e.clone());
        }
        let chunks: Vec<Result<Bytes, StreamError>> = sse_with_usage(self.usage.input_tokens, self.usage.output_tokens)
            .into_iter()
            .map(Ok)
            .collect();
        Ok(futures::stream::iter(chunks).boxed())
    }
}

// ── Stores ───────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeBudgetStore {
    pub budget: Mutex<Option<Decimal>>,
    pub usage: Mutex<Decimal>,
    pub fail: bool,
    pub lookups: AtomicUsize,
}

impl FakeBudgetStore {
    pub fn with(budget: Option<Decimal>, usage: Decimal) -> Arc<Self> {
        Arc::new(Self {
            budget: Mutex::new(budget),
            usage: Mutex::new(usage),
            ..Default::default()
        })
    }

    pub fn broken() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            ..Default::default()
        })
    }
}

#[async_trait]
impl BudgetStore for FakeBudgetStore {
    async fn get_user_budget(&self, _user_id: Uuid) -> anyhow::Result<Option<Decimal>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            anyhow::bail!("connection refused");
        }
        Ok(*self.budget.lock().unwrap())
    }

    async fn get_monthly_usage_total(
        &self,
        _user_id: Uuid,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
    ) -> anyhow::Result<Decimal> {
        if self.fail {
            anyhow::bail!("connection refused");
        }
        Ok(*self.usage.lock().unwrap())
    }
}

pub fn budget_service(store: Arc<FakeBudgetStore>) -> BudgetService {
    BudgetService::new(store, Duration::from_secs(60))
}

#[derive(Default)]
pub struct FakeUsageStore {
    pub records: Mutex<Vec<TokenUsageRecord>>,
    pub buckets: Mutex<Vec<(BucketType, DateTime<Utc>)>>,
    seen: Mutex<HashSet<String>>,
    pub fail: bool,
}

impl FakeUsageStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn broken() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            ..Default::default()
        })
    }
}

#[async_trait]
impl UsageStore for FakeUsageStore {
    async fn record_usage(
        &self,
        record: &TokenUsageRecord,
        buckets: &[(BucketType, DateTime<Utc>)],
    ) -> anyhow::Result<bool> {
        if self.fail {
            anyhow::bail!("insert failed");
        }
        if !self.seen.lock().unwrap().insert(record.request_id.clone()) {
            return Ok(false);
        }
        self.records.lock().unwrap().push(record.clone());
        self.buckets.lock().unwrap().extend_from_slice(buckets);
        Ok(true)
    }
}

// ── Metrics ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct SeenRequest {
    pub provider: Provider,
    pub model: String,
    pub success: bool,
    pub stream: bool,
    pub error_type: Option<String>,
    pub cost_usd: Option<Decimal>,
}

#[derive(Default)]
pub struct RecordingMetrics {
    pub requests: Mutex<Vec<SeenRequest>>,
    pub fallbacks: Mutex<Vec<(Provider, Provider, String)>>,
}

impl RecordingMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl MetricsSink for RecordingMetrics {
    fn record_request(&self, m: &RequestMetrics<'_>) -> anyhow::Result<()> {
        self.requests.lock().unwrap().push(SeenRequest {
            provider: m.provider,
            model: m.model.to_string(),
            success: m.success,
            stream: m.stream,
            error_type: m.error_type.map(String::from),
            cost_usd: m.cost_usd,
        });
        Ok(())
    }

    fn record_fallback(&self, from: Provider, to: Provider, reason: &str) -> anyhow::Result<()> {
        self.fallbacks
            .lock()
            .unwrap()
            .push((from, to, reason.to_string()));
        Ok(())
    }
}
