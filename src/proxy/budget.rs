use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;
use uuid::Uuid;

use crate::cache::TtlCache;
use crate::models::buckets::{format_local, month_window};
use crate::store::BudgetStore;

#[derive(Debug, thiserror::Error)]
pub enum BudgetError {
    #[error("budget lookup failed: {0}")]
    Store(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Serialize)]
pub struct BudgetCheckResult {
    pub allowed: bool,
    pub monthly_budget: Option<Decimal>,
    pub current_usage: Decimal,
    pub remaining: Option<Decimal>,
    pub usage_percentage: Option<f64>,
    pub period_start: DateTime<Utc>,
    /// Exclusive.
    pub period_end: DateTime<Utc>,
}

impl BudgetCheckResult {
    fn build(
        monthly_budget: Option<Decimal>,
        current_usage: Decimal,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Self {
        let Some(budget) = monthly_budget else {
            return Self {
                allowed: true,
                monthly_budget: None,
                current_usage,
                remaining: None,
                usage_percentage: None,
                period_start,
                period_end,
            };
        };

        let usage_percentage = (budget > Decimal::ZERO)
            .then(|| (current_usage / budget * Decimal::ONE_HUNDRED).to_f64())
            .flatten();

        Self {
            allowed: current_usage < budget,
            monthly_budget: Some(budget),
            current_usage,
            remaining: Some(budget - current_usage),
            usage_percentage,
            period_start,
            period_end,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CachedBudgetInfo {
    pub monthly_budget: Option<Decimal>,
    pub current_usage: Decimal,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub cached_at: DateTime<Utc>,
}

/// Monthly budget enforcement over the `month` usage buckets.
#[derive(Clone)]
pub struct BudgetService {
    store: Arc<dyn BudgetStore>,
    cache: TtlCache<Uuid, CachedBudgetInfo>,
}

impl BudgetService {
    pub fn new(store: Arc<dyn BudgetStore>, ttl: Duration) -> Self {
        Self {
            store,
            cache: TtlCache::new(ttl),
        }
    }

    pub fn cache(&self) -> &TtlCache<Uuid, CachedBudgetInfo> {
        &self.cache
    }

    pub async fn check_budget(&self, user_id: Uuid) -> Result<BudgetCheckResult, BudgetError> {
        self.check_budget_at(user_id, Utc::now()).await
    }

    /// [`check_budget`](Self::check_budget) against an explicit clock.
    pub async fn check_budget_at(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<BudgetCheckResult, BudgetError> {
        let (period_start, period_end) = month_window(now);

        if let Some(cached) = self.cache.get(&user_id) {
            if cached.period_start == period_start {
                return Ok(BudgetCheckResult::build(
                    cached.monthly_budget,
                    cached.current_usage,
                    cached.period_start,
                    cached.period_end,
                ));
            }
        }

        let monthly_budget = self.store.get_user_budget(user_id).await?;
        let current_usage = self
            .store
            .get_monthly_usage_total(user_id, period_start, period_end)
            .await?;

        self.cache.insert(
            user_id,
            CachedBudgetInfo {
                monthly_budget,
                current_usage,
                period_start,
                period_end,
                cached_at: now,
            },
        );

        Ok(BudgetCheckResult::build(
            monthly_budget,
            current_usage,
            period_start,
            period_end,
        ))
    }

    /// Storage failures allow the request with no budget and zero usage.
    pub async fn check_budget_fail_open(&self, user_id: Uuid) -> BudgetCheckResult {
        let now = Utc::now();
        match self.check_budget_at(user_id, now).await {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(user_id = %user_id, error = %e, "budget_check_failed");
                let (period_start, period_end) = month_window(now);
                BudgetCheckResult::build(None, Decimal::ZERO, period_start, period_end)
            }
        }
    }

    pub fn invalidate_cache(&self, user_id: Uuid) {
        self.cache.invalidate(&user_id);
    }
}

fn format_usd(value: Decimal) -> String {
    format!(
        "{:.2}",
        value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
    )
}

pub fn format_budget_exceeded_message(result: &BudgetCheckResult) -> String {
    let reset_at = result.period_end - chrono::Duration::seconds(1);
    format!(
        "Monthly budget exceeded. Current usage: ${}, Budget limit: ${}. Budget resets on {}.",
        format_usd(result.current_usage),
        format_usd(result.monthly_budget.unwrap_or(Decimal::ZERO)),
        format_local(reset_at),
    )
}

// ── Tests ───────────────────────────────────────────────────────
