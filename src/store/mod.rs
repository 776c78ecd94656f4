//! Storage seams used by the routing core.
//!
//! `PgStore` implements every trait; tests substitute in-memory fakes.

pub mod postgres;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

use crate::models::buckets::BucketType;

/// Access key joined with its owner, as needed to build a request context.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AuthKeyRow {
    pub access_key_id: Uuid,
    pub user_id: Uuid,
    pub key_prefix: String,
    pub bedrock_region: String,
    pub bedrock_model: String,
    pub routing_strategy: String,
    pub has_bedrock_key: bool,
}

/// One completed request, fully priced.
#[derive(Debug, Clone, Serialize)]
pub struct TokenUsageRecord {
    pub request_id: String,
    pub user_id: Uuid,
    pub access_key_id: Uuid,
    pub model: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_tokens: i64,
    pub cache_read_tokens: i64,
    pub cache_creation_tokens: i64,
    pub input_cost_usd: Decimal,
    pub output_cost_usd: Decimal,
    pub cache_write_cost_usd: Decimal,
    pub cache_read_cost_usd: Decimal,
    pub estimated_cost_usd: Decimal,
    pub pricing_region: String,
    pub pricing_model_id: String,
    pub pricing_effective_date: Option<NaiveDate>,
    pub pricing_input_price_per_million: Decimal,
    pub pricing_output_price_per_million: Decimal,
    pub pricing_cache_write_price_per_million: Decimal,
    pub pricing_cache_read_price_per_million: Decimal,
    pub provider: String,
    pub is_fallback: bool,
    pub latency_ms: i64,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait AccessKeyStore: Send + Sync {
    /// Usable key by hash: active, or rotating within its grace period,
    /// owned by an active user.
    async fn find_auth_key(&self, key_hash: &str) -> anyhow::Result<Option<AuthKeyRow>>;
}

#[async_trait]
pub trait BedrockKeyStore: Send + Sync {
    async fn get_encrypted_bedrock_key(&self, access_key_id: Uuid) -> anyhow::Result<Option<Vec<u8>>>;
}

#[async_trait]
pub trait BudgetStore: Send + Sync {
    /// `None` when the user has no budget (or does not exist).
    async fn get_user_budget(&self, user_id: Uuid) -> anyhow::Result<Option<Decimal>>;

    /// Sum of month-bucket cost with `bucket_start` in `[start, end)`.
    async fn get_monthly_usage_total(
        &self,
        user_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> anyhow::Result<Decimal>;
}

#[async_trait]
pub trait UsageStore: Send + Sync {
    /// Insert the usage row and increment each bucket, all or nothing.
    /// Returns `false` when `request_id` was already recorded; aggregates
    /// are left untouched in that case.
    async fn record_usage(
        &self,
        record: &TokenUsageRecord,
        buckets: &[(BucketType, DateTime<Utc>)],
    ) -> anyhow::Result<bool>;
}

#[async_trait]
pub trait ModelMappingStore: Send + Sync {
    /// Active mappings, keyed by requested model name.
    async fn active_model_mappings(&self) -> anyhow::Result<HashMap<String, String>>;
}
