use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use super::{
    AccessKeyStore, AuthKeyRow, BedrockKeyStore, BudgetStore, ModelMappingStore, TokenUsageRecord, UsageStore,
};
use crate::models::buckets::BucketType;
use crate::models::entities::{KeyStatus, RoutingStrategy, UserStatus};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    /// Pool that connects on first use.
    pub fn connect_lazy(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPool::connect_lazy(database_url)?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run pending migrations from the migrations/ directory.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    // -- User Operations --

    pub async fn list_users(&self, limit: i64, offset: i64) -> anyhow::Result<Vec<UserRow>> {
        let rows = sqlx::query_as::<_, UserRow>(
            "SELECT id, name, description, status, routing_strategy, monthly_budget_usd, created_at, updated_at
             FROM users WHERE status != 'deleted' ORDER BY created_at DESC LIMIT $1 OFFSET $2",
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn create_user(&self, user: &NewUser) -> anyhow::Result<UserRow> {
        let row = sqlx::query_as::<_, UserRow>(
            r#"INSERT INTO users (id, name, description, status, routing_strategy, monthly_budget_usd)
               VALUES ($1, $2, $3, $4, $5, $6)
               RETURNING id, name, description, status, routing_strategy, monthly_budget_usd, created_at, updated_at"#,
        )
        .bind(Uuid::new_v4())
        .bind(&user.name)
        .bind(&user.description)
        .bind(UserStatus::Active.as_str())
        .bind(user.routing_strategy.as_str())
        .bind(user.monthly_budget_usd)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn get_user(&self, id: Uuid) -> anyhow::Result<Option<UserRow>> {
        let row = sqlx::query_as::<_, UserRow>(
            "SELECT id, name, description, status, routing_strategy, monthly_budget_usd, created_at, updated_at
             FROM users WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn update_user_budget(&self, id: Uuid, budget: Option<Decimal>) -> anyhow::Result<bool> {
        let result = sqlx::query(
            "UPDATE users SET monthly_budget_usd = $2, updated_at = NOW() WHERE id = $1 AND status != 'deleted'",
        )
        .bind(id)
        .bind(budget)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn update_routing_strategy(&self, id: Uuid, strategy: RoutingStrategy) -> anyhow::Result<bool> {
        let result = sqlx::query(
            "UPDATE users SET routing_strategy = $2, updated_at = NOW() WHERE id = $1 AND status != 'deleted'",
        )
        .bind(id)
        .bind(strategy.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Move a user to `inactive` or `deleted` and revoke every live key.
    /// Returns the hashes of all the user's keys for cache invalidation.
    pub async fn retire_user(&self, id: Uuid, status: UserStatus) -> anyhow::Result<Vec<String>> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"UPDATE users
               SET status = $2, updated_at = NOW(),
                   deleted_at = CASE WHEN $2 = 'deleted' THEN NOW() ELSE deleted_at END
               WHERE id = $1"#,
        )
        .bind(id)
        .bind(status.as_str())
        .execute(&mut *tx)
        .await?;

        let hashes = sqlx::query_scalar::<_, String>("SELECT key_hash FROM access_keys WHERE user_id = $1")
            .bind(id)
            .fetch_all(&mut *tx)
            .await?;

        sqlx::query(
            "UPDATE access_keys SET status = 'revoked', revoked_at = NOW() WHERE user_id = $1 AND status != 'revoked'",
        )
        .bind(id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(hashes)
    }

    // -- Access Key Operations --

    const ACCESS_KEY_COLUMNS: &'static str = r#"a.id, a.user_id, a.key_hash, a.key_prefix, a.status,
        a.bedrock_region, a.bedrock_model, a.created_at, a.revoked_at, a.rotation_expires_at,
        EXISTS(SELECT 1 FROM bedrock_keys b WHERE b.access_key_id = a.id) AS has_bedrock_key"#;

    pub async fn list_access_keys(&self, user_id: Uuid) -> anyhow::Result<Vec<AccessKeyRow>> {
        let sql = format!(
            "SELECT {} FROM access_keys a WHERE a.user_id = $1 ORDER BY a.created_at DESC",
            Self::ACCESS_KEY_COLUMNS
        );
        let rows = sqlx::query_as::<_, AccessKeyRow>(&sql)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    pub async fn get_access_key(&self, id: Uuid) -> anyhow::Result<Option<AccessKeyRow>> {
        let sql = format!("SELECT {} FROM access_keys a WHERE a.id = $1", Self::ACCESS_KEY_COLUMNS);
        let row = sqlx::query_as::<_, AccessKeyRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn create_access_key(&self, key: &NewAccessKey) -> anyhow::Result<AccessKeyRow> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"INSERT INTO access_keys (id, user_id, key_hash, key_prefix, status, bedrock_region, bedrock_model)
               VALUES ($1, $2, $3, $4, 'active', $5, $6)"#,
        )
        .bind(id)
        .bind(key.user_id)
        .bind(&key.key_hash)
        .bind(&key.key_prefix)
        .bind(&key.bedrock_region)
        .bind(&key.bedrock_model)
        .execute(&self.pool)
        .await?;

        self.get_access_key(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("access key {} vanished after insert", id))
    }

    /// Revoke a key and drop its Bedrock credential.
    pub async fn revoke_access_key(&self, id: Uuid) -> anyhow::Result<bool> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            "UPDATE access_keys SET status = 'revoked', revoked_at = NOW() WHERE id = $1 AND status != 'revoked'",
        )
        .bind(id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM bedrock_keys WHERE access_key_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    /// Put `old` into its rotation grace period and issue a replacement that
    /// inherits its Bedrock settings and credential.
    pub async fn rotate_access_key(
        &self,
        old: &AccessKeyRow,
        new_hash: &str,
        new_prefix: &str,
        grace_expires_at: DateTime<Utc>,
    ) -> anyhow::Result<AccessKeyRow> {
        let new_id = Uuid::new_v4();
        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE access_keys SET status = 'rotating', rotation_expires_at = $2 WHERE id = $1")
            .bind(old.id)
            .bind(grace_expires_at)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"INSERT INTO access_keys (id, user_id, key_hash, key_prefix, status, bedrock_region, bedrock_model)
               VALUES ($1, $2, $3, $4, 'active', $5, $6)"#,
        )
        .bind(new_id)
        .bind(old.user_id)
        .bind(new_hash)
        .bind(new_prefix)
        .bind(&old.bedrock_region)
        .bind(&old.bedrock_model)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"INSERT INTO bedrock_keys (access_key_id, encrypted_key, key_hash)
               SELECT $2, encrypted_key, key_hash FROM bedrock_keys WHERE access_key_id = $1"#,
        )
        .bind(old.id)
        .bind(new_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        self.get_access_key(new_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("access key {} vanished after rotation", new_id))
    }

    pub async fn upsert_bedrock_key(
        &self,
        access_key_id: Uuid,
        encrypted_key: &[u8],
        key_hash: &str,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"INSERT INTO bedrock_keys (access_key_id, encrypted_key, key_hash)
               VALUES ($1, $2, $3)
               ON CONFLICT (access_key_id) DO UPDATE
               SET encrypted_key = EXCLUDED.encrypted_key,
                   key_hash = EXCLUDED.key_hash,
                   rotated_at = NOW()"#,
        )
        .bind(access_key_id)
        .bind(encrypted_key)
        .bind(key_hash)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// `(access_key_id, has_bedrock_key)` for every active or rotating key.
    pub async fn live_key_bedrock_status(&self, user_id: Uuid) -> anyhow::Result<Vec<(Uuid, bool)>> {
        let rows = sqlx::query_as::<_, (Uuid, bool)>(
            r#"SELECT a.id, EXISTS(SELECT 1 FROM bedrock_keys b WHERE b.access_key_id = a.id)
               FROM access_keys a
               WHERE a.user_id = $1 AND a.status IN ('active', 'rotating')"#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    // -- Usage Queries --

    pub async fn query_bucket_totals(&self, filter: &UsageFilter) -> anyhow::Result<Vec<UsageBucketRow>> {
        let rows = sqlx::query_as::<_, UsageBucketRow>(
            r#"SELECT bucket_start,
                      SUM(total_requests)::BIGINT AS requests,
                      SUM(total_input_tokens)::BIGINT AS input_tokens,
                      SUM(total_output_tokens)::BIGINT AS output_tokens,
                      SUM(total_tokens)::BIGINT AS total_tokens,
                      SUM(total_cache_write_tokens)::BIGINT AS cache_write_tokens,
                      SUM(total_cache_read_tokens)::BIGINT AS cache_read_tokens,
                      SUM(total_input_cost_usd) AS input_cost_usd,
                      SUM(total_output_cost_usd) AS output_cost_usd,
                      SUM(total_cache_write_cost_usd) AS cache_write_cost_usd,
                      SUM(total_cache_read_cost_usd) AS cache_read_cost_usd,
                      SUM(total_estimated_cost_usd) AS estimated_cost_usd
               FROM usage_aggregates
               WHERE bucket_type = $1
                 AND bucket_start >= $2 AND bucket_start < $3
                 AND ($4::uuid IS NULL OR user_id = $4)
                 AND ($5::uuid IS NULL OR access_key_id = $5)
               GROUP BY bucket_start
               ORDER BY bucket_start ASC"#,
        )
        .bind(filter.bucket_type.as_str())
        .bind(filter.start)
        .bind(filter.end)
        .bind(filter.user_id)
        .bind(filter.access_key_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Raw usage rows for provider-filtered queries, which the aggregates
    /// cannot answer.
    pub async fn list_token_usage(&self, filter: &UsageFilter) -> anyhow::Result<Vec<TokenUsageRow>> {
        let rows = sqlx::query_as::<_, TokenUsageRow>(
            r#"SELECT created_at, input_tokens, output_tokens, total_tokens,
                      cache_creation_tokens, cache_read_tokens,
                      input_cost_usd, output_cost_usd, cache_write_cost_usd, cache_read_cost_usd,
                      estimated_cost_usd
               FROM token_usage
               WHERE created_at >= $1 AND created_at < $2
                 AND ($3::uuid IS NULL OR user_id = $3)
                 AND ($4::uuid IS NULL OR access_key_id = $4)
                 AND ($5::text IS NULL OR provider = $5)
               ORDER BY created_at ASC"#,
        )
        .bind(filter.start)
        .bind(filter.end)
        .bind(filter.user_id)
        .bind(filter.access_key_id)
        .bind(filter.provider.as_deref())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn cost_breakdown_by_model(&self, filter: &UsageFilter) -> anyhow::Result<Vec<CostBreakdownRow>> {
        let rows = sqlx::query_as::<_, CostBreakdownRow>(
            r#"SELECT pricing_model_id AS model_id,
                      SUM(estimated_cost_usd) AS total_cost_usd,
                      SUM(input_cost_usd) AS input_cost_usd,
                      SUM(output_cost_usd) AS output_cost_usd,
                      SUM(cache_write_cost_usd) AS cache_write_cost_usd,
                      SUM(cache_read_cost_usd) AS cache_read_cost_usd
               FROM token_usage
               WHERE created_at >= $1 AND created_at < $2
                 AND ($3::uuid IS NULL OR user_id = $3)
                 AND ($4::uuid IS NULL OR access_key_id = $4)
                 AND ($5::text IS NULL OR provider = $5)
               GROUP BY pricing_model_id
               ORDER BY total_cost_usd DESC"#,
        )
        .bind(filter.start)
        .bind(filter.end)
        .bind(filter.user_id)
        .bind(filter.access_key_id)
        .bind(filter.provider.as_deref())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn top_users(
        &self,
        bucket_type: BucketType,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: i64,
    ) -> anyhow::Result<Vec<TopUserRow>> {
        let rows = sqlx::query_as::<_, TopUserRow>(
            r#"SELECT a.user_id, u.name,
                      SUM(a.total_tokens)::BIGINT AS total_tokens,
                      SUM(a.total_requests)::BIGINT AS total_requests,
                      SUM(a.total_estimated_cost_usd) AS estimated_cost_usd
               FROM usage_aggregates a
               JOIN users u ON u.id = a.user_id
               WHERE a.bucket_type = $1 AND a.bucket_start >= $2 AND a.bucket_start < $3
               GROUP BY a.user_id, u.name
               ORDER BY total_tokens DESC
               LIMIT $4"#,
        )
        .bind(bucket_type.as_str())
        .bind(start)
        .bind(end)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Per-bucket token totals for the given users, oldest bucket first.
    pub async fn user_series(
        &self,
        bucket_type: BucketType,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        user_ids: &[Uuid],
    ) -> anyhow::Result<Vec<UserSeriesRow>> {
        if user_ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query_as::<_, UserSeriesRow>(
            r#"SELECT user_id, bucket_start, SUM(total_tokens)::BIGINT AS total_tokens
               FROM usage_aggregates
               WHERE bucket_type = $1 AND bucket_start >= $2 AND bucket_start < $3
                 AND user_id = ANY($4)
               GROUP BY user_id, bucket_start
               ORDER BY bucket_start ASC"#,
        )
        .bind(bucket_type.as_str())
        .bind(start)
        .bind(end)
        .bind(user_ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    // -- Model Mapping Operations --

    pub async fn list_model_mappings(&self, include_inactive: bool) -> anyhow::Result<Vec<ModelMappingRow>> {
        let rows = sqlx::query_as::<_, ModelMappingRow>(
            "SELECT id, claude_model, bedrock_model, description, is_active, created_at, updated_at
             FROM model_mappings WHERE $1 OR is_active ORDER BY claude_model ASC",
        )
        .bind(include_inactive)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn get_model_mapping(&self, id: Uuid) -> anyhow::Result<Option<ModelMappingRow>> {
        let row = sqlx::query_as::<_, ModelMappingRow>(
            "SELECT id, claude_model, bedrock_model, description, is_active, created_at, updated_at
             FROM model_mappings WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// `None` when a mapping for the same Claude model already exists.
    pub async fn create_model_mapping(&self, mapping: &NewModelMapping) -> anyhow::Result<Option<ModelMappingRow>> {
        let row = sqlx::query_as::<_, ModelMappingRow>(
            r#"INSERT INTO model_mappings (id, claude_model, bedrock_model, description, is_active)
               VALUES ($1, $2, $3, $4, $5)
               ON CONFLICT (claude_model) DO NOTHING
               RETURNING id, claude_model, bedrock_model, description, is_active, created_at, updated_at"#,
        )
        .bind(Uuid::new_v4())
        .bind(&mapping.claude_model)
        .bind(&mapping.bedrock_model)
        .bind(&mapping.description)
        .bind(mapping.is_active)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Absent fields keep their stored value.
    pub async fn update_model_mapping(
        &self,
        id: Uuid,
        update: &ModelMappingUpdate,
    ) -> anyhow::Result<Option<ModelMappingRow>> {
        let row = sqlx::query_as::<_, ModelMappingRow>(
            r#"UPDATE model_mappings
               SET bedrock_model = COALESCE($2, bedrock_model),
                   description = COALESCE($3, description),
                   is_active = COALESCE($4, is_active),
                   updated_at = NOW()
               WHERE id = $1
               RETURNING id, claude_model, bedrock_model, description, is_active, created_at, updated_at"#,
        )
        .bind(id)
        .bind(&update.bedrock_model)
        .bind(&update.description)
        .bind(update.is_active)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn delete_model_mapping(&self, id: Uuid) -> anyhow::Result<bool> {
        let result = sqlx::query("DELETE FROM model_mappings WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

// ── Routing-core seams ───────────────────────────────────────

#[async_trait]
impl AccessKeyStore for PgStore {
    async fn find_auth_key(&self, key_hash: &str) -> anyhow::Result<Option<AuthKeyRow>> {
        let row = sqlx::query_as::<_, AuthKeyRow>(
            r#"SELECT a.id AS access_key_id, a.user_id, a.key_prefix,
                      a.bedrock_region, a.bedrock_model, u.routing_strategy,
                      EXISTS(SELECT 1 FROM bedrock_keys b WHERE b.access_key_id = a.id) AS has_bedrock_key
               FROM access_keys a
               JOIN users u ON u.id = a.user_id
               WHERE a.key_hash = $1
                 AND u.status = 'active'
                 AND (a.status = 'active'
                      OR (a.status = 'rotating'
                          AND (a.rotation_expires_at IS NULL OR a.rotation_expires_at > NOW())))"#,
        )
        .bind(key_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }
}

#[async_trait]
impl BedrockKeyStore for PgStore {
    async fn get_encrypted_bedrock_key(&self, access_key_id: Uuid) -> anyhow::Result<Option<Vec<u8>>> {
        let blob = sqlx::query_scalar::<_, Vec<u8>>(
            "SELECT encrypted_key FROM bedrock_keys WHERE access_key_id = $1",
        )
        .bind(access_key_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(blob)
    }
}

#[async_trait]
impl BudgetStore for PgStore {
    async fn get_user_budget(&self, user_id: Uuid) -> anyhow::Result<Option<Decimal>> {
        let budget = sqlx::query_scalar::<_, Option<Decimal>>(
            "SELECT monthly_budget_usd FROM users WHERE id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(budget.flatten())
    }

    async fn get_monthly_usage_total(
        &self,
        user_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> anyhow::Result<Decimal> {
        let total = sqlx::query_scalar::<_, Decimal>(
            r#"SELECT COALESCE(SUM(total_estimated_cost_usd), 0)
               FROM usage_aggregates
               WHERE user_id = $1 AND bucket_type = 'month'
                 AND bucket_start >= $2 AND bucket_start < $3"#,
        )
        .bind(user_id)
        .bind(start)
        .bind(end)
        .fetch_one(&self.pool)
        .await?;
        Ok(total)
    }
}

#[async_trait]
impl UsageStore for PgStore {
    async fn record_usage(
        &self,
        r: &TokenUsageRecord,
        buckets: &[(BucketType, DateTime<Utc>)],
    ) -> anyhow::Result<bool> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query_scalar::<_, Uuid>(
            r#"INSERT INTO token_usage (
                   id, request_id, user_id, access_key_id, model,
                   input_tokens, output_tokens, total_tokens, cache_read_tokens, cache_creation_tokens,
                   input_cost_usd, output_cost_usd, cache_write_cost_usd, cache_read_cost_usd, estimated_cost_usd,
                   pricing_region, pricing_model_id, pricing_effective_date,
                   pricing_input_price_per_million, pricing_output_price_per_million,
                   pricing_cache_write_price_per_million, pricing_cache_read_price_per_million,
                   provider, is_fallback, latency_ms, created_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
                       $16, $17, $18, $19, $20, $21, $22, $23, $24, $25, $26)
               ON CONFLICT (request_id) DO NOTHING
               RETURNING id"#,
        )
        .bind(Uuid::new_v4())
        .bind(&r.request_id)
        .bind(r.user_id)
        .bind(r.access_key_id)
        .bind(&r.model)
        .bind(r.input_tokens)
        .bind(r.output_tokens)
        .bind(r.total_tokens)
        .bind(r.cache_read_tokens)
        .bind(r.cache_creation_tokens)
        .bind(r.input_cost_usd)
        .bind(r.output_cost_usd)
        .bind(r.cache_write_cost_usd)
        .bind(r.cache_read_cost_usd)
        .bind(r.estimated_cost_usd)
        .bind(&r.pricing_region)
        .bind(&r.pricing_model_id)
        .bind(r.pricing_effective_date)
        .bind(r.pricing_input_price_per_million)
        .bind(r.pricing_output_price_per_million)
        .bind(r.pricing_cache_write_price_per_million)
        .bind(r.pricing_cache_read_price_per_million)
        .bind(&r.provider)
        .bind(r.is_fallback)
        .bind(r.latency_ms)
        .bind(r.created_at)
        .fetch_optional(&mut *tx)
        .await?;

        if inserted.is_none() {
            tx.rollback().await?;
            return Ok(false);
        }

        for (bucket_type, bucket_start) in buckets {
            sqlx::query(
                r#"INSERT INTO usage_aggregates (
                       id, bucket_type, bucket_start, user_id, access_key_id,
                       total_requests, total_input_tokens, total_output_tokens, total_tokens,
                       total_cache_write_tokens, total_cache_read_tokens,
                       total_input_cost_usd, total_output_cost_usd, total_cache_write_cost_usd,
                       total_cache_read_cost_usd, total_estimated_cost_usd)
                   VALUES ($1, $2, $3, $4, $5, 1, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
                   ON CONFLICT (bucket_type, bucket_start, user_id, access_key_id) DO UPDATE SET
                       total_requests = usage_aggregates.total_requests + 1,
                       total_input_tokens = usage_aggregates.total_input_tokens + EXCLUDED.total_input_tokens,
                       total_output_tokens = usage_aggregates.total_output_tokens + EXCLUDED.total_output_tokens,
                       total_tokens = usage_aggregates.total_tokens + EXCLUDED.total_tokens,
                       total_cache_write_tokens = usage_aggregates.total_cache_write_tokens + EXCLUDED.total_cache_write_tokens,
                       total_cache_read_tokens = usage_aggregates.total_cache_read_tokens + EXCLUDED.total_cache_read_tokens,
                       total_input_cost_usd = usage_aggregates.total_input_cost_usd + EXCLUDED.total_input_cost_usd,
                       total_output_cost_usd = usage_aggregates.total_output_cost_usd + EXCLUDED.total_output_cost_usd,
                       total_cache_write_cost_usd = usage_aggregates.total_cache_write_cost_usd + EXCLUDED.total_cache_write_cost_usd,
                       total_cache_read_cost_usd = usage_aggregates.total_cache_read_cost_usd + EXCLUDED.total_cache_read_cost_usd,
                       total_estimated_cost_usd = usage_aggregates.total_estimated_cost_usd + EXCLUDED.total_estimated_cost_usd"#,
            )
            .bind(Uuid::new_v4())
            .bind(bucket_type.as_str())
            .bind(*bucket_start)
            .bind(r.user_id)
            .bind(r.access_key_id)
            .bind(r.input_tokens)
            .bind(r.output_tokens)
            .bind(r.total_tokens)
            .bind(r.cache_creation_tokens)
            .bind(r.cache_read_tokens)
            .bind(r.input_cost_usd)
            .bind(r.output_cost_usd)
            .bind(r.cache_write_cost_usd)
            .bind(r.cache_read_cost_usd)
            .bind(r.estimated_cost_usd)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(true)
    }
}

#[async_trait]
impl ModelMappingStore for PgStore {
    async fn active_model_mappings(&self) -> anyhow::Result<HashMap<String, String>> {
        let rows = sqlx::query_as::<_, (String, String)>(
            "SELECT claude_model, bedrock_model FROM model_mappings WHERE is_active",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().collect())
    }
}

// ── Rows ─────────────────────────────────────────────────────

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct UserRow {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub status: String,
    pub routing_strategy: String,
    pub monthly_budget_usd: Option<Decimal>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserRow {
    pub fn is_deleted(&self) -> bool {
        self.status == UserStatus::Deleted.as_str()
    }

    pub fn is_active(&self) -> bool {
        self.status == UserStatus::Active.as_str()
    }
}

pub struct NewUser {
    pub name: String,
    pub description: Option<String>,
    pub routing_strategy: RoutingStrategy,
    pub monthly_budget_usd: Option<Decimal>,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct AccessKeyRow {
    pub id: Uuid,
    pub user_id: Uuid,
    #[serde(skip)]
    pub key_hash: String,
    pub key_prefix: String,
    pub status: String,
    pub bedrock_region: String,
    pub bedrock_model: String,
    pub created_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub rotation_expires_at: Option<DateTime<Utc>>,
    pub has_bedrock_key: bool,
}

impl AccessKeyRow {
    pub fn is_revoked(&self) -> bool {
        self.status == KeyStatus::Revoked.as_str()
    }
}

pub struct NewAccessKey {
    pub user_id: Uuid,
    pub key_hash: String,
    pub key_prefix: String,
    pub bedrock_region: String,
    pub bedrock_model: String,
}

#[derive(Debug, Clone)]
pub struct UsageFilter {
    pub bucket_type: BucketType,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub user_id: Option<Uuid>,
    pub access_key_id: Option<Uuid>,
    pub provider: Option<String>,
}

#[derive(Debug, Clone, Default, sqlx::FromRow, Serialize, PartialEq)]
pub struct UsageBucketRow {
    pub bucket_start: DateTime<Utc>,
    pub requests: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_tokens: i64,
    pub cache_write_tokens: i64,
    pub cache_read_tokens: i64,
    pub input_cost_usd: Decimal,
    pub output_cost_usd: Decimal,
    pub cache_write_cost_usd: Decimal,
    pub cache_read_cost_usd: Decimal,
    pub estimated_cost_usd: Decimal,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TokenUsageRow {
    pub created_at: DateTime<Utc>,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_tokens: i64,
    pub cache_creation_tokens: i64,
    pub cache_read_tokens: i64,
    pub input_cost_usd: Decimal,
    pub output_cost_usd: Decimal,
    pub cache_write_cost_usd: Decimal,
    pub cache_read_cost_usd: Decimal,
    pub estimated_cost_usd: Decimal,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct CostBreakdownRow {
    pub model_id: String,
    pub total_cost_usd: Decimal,
    pub input_cost_usd: Decimal,
    pub output_cost_usd: Decimal,
    pub cache_write_cost_usd: Decimal,
    pub cache_read_cost_usd: Decimal,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct TopUserRow {
    pub user_id: Uuid,
    pub name: String,
    pub total_tokens: i64,
    pub total_requests: i64,
    pub estimated_cost_usd: Decimal,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct UserSeriesRow {
    pub user_id: Uuid,
    pub bucket_start: DateTime<Utc>,
    pub total_tokens: i64,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct ModelMappingRow {
    pub id: Uuid,
    pub claude_model: String,
    pub bedrock_model: String,
    pub description: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub struct NewModelMapping {
    pub claude_model: String,
    pub bedrock_model: String,
    pub description: Option<String>,
    pub is_active: bool,
}

#[derive(Debug, Default)]
pub struct ModelMappingUpdate {
    pub bedrock_model: Option<String>,
    pub description: Option<String>,
    pub is_active: Option<bool>,
}
