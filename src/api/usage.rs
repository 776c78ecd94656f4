use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    Json,
};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::buckets::{bucket_start, resolve_time_range, BucketType, Period, RangeError};
use crate::models::entities::Provider;
use crate::store::postgres::{
    CostBreakdownRow, TokenUsageRow, TopUserRow, UsageBucketRow, UsageFilter, UserSeriesRow,
};
use crate::AppState;

#[derive(Deserialize)]
pub struct UsageQuery {
    pub user_id: Option<Uuid>,
    pub access_key_id: Option<Uuid>,
    pub bucket_type: Option<String>,
    pub provider: Option<String>,
    pub period: Option<String>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
}

#[derive(Deserialize)]
pub struct TopUsersQuery {
    pub bucket_type: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct SeriesPoint {
    pub bucket_start: DateTime<Utc>,
    pub total_tokens: i64,
}

/// One top user with their token usage per bucket.
#[derive(Debug, Serialize, PartialEq)]
pub struct TopUserSeries {
    pub user_id: Uuid,
    pub name: String,
    pub buckets: Vec<SeriesPoint>,
}

#[derive(Debug, Default, Serialize, PartialEq)]
pub struct UsageTotals {
    pub total_requests: i64,
    pub total_input_tokens: i64,
    pub total_output_tokens: i64,
    pub total_tokens: i64,
    pub total_cache_write_tokens: i64,
    pub total_cache_read_tokens: i64,
    pub total_input_cost_usd: Decimal,
    pub total_output_cost_usd: Decimal,
    pub total_cache_write_cost_usd: Decimal,
    pub total_cache_read_cost_usd: Decimal,
    pub estimated_cost_usd: Decimal,
}

impl UsageTotals {
    pub fn from_buckets(buckets: &[UsageBucketRow]) -> Self {
        buckets.iter().fold(Self::default(), |mut t, b| {
            t.total_requests += b.requests;
            t.total_input_tokens += b.input_tokens;
            t.total_output_tokens += b.output_tokens;
            t.total_tokens += b.total_tokens;
            t.total_cache_write_tokens += b.cache_write_tokens;
            t.total_cache_read_tokens += b.cache_read_tokens;
            t.total_input_cost_usd += b.input_cost_usd;
            t.total_output_cost_usd += b.output_cost_usd;
            t.total_cache_write_cost_usd += b.cache_write_cost_usd;
            t.total_cache_read_cost_usd += b.cache_read_cost_usd;
            t.estimated_cost_usd += b.estimated_cost_usd;
            t
        })
    }
}

#[derive(Serialize)]
pub struct UsageResponse {
    pub bucket_type: BucketType,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub buckets: Vec<UsageBucketRow>,
    #[serde(flatten)]
    pub totals: UsageTotals,
    pub cost_breakdown: Vec<CostBreakdownRow>,
}

fn parse_bucket_type(raw: Option<&str>) -> Result<BucketType, AppError> {
    match raw {
        None => Ok(BucketType::Hour),
        Some(s) => s.parse().map_err(|_| {
            AppError::bad_request("INVALID_BUCKET_TYPE", format!("Unknown bucket_type: {}", s))
        }),
    }
}

fn parse_period(raw: Option<&str>) -> Result<Option<Period>, AppError> {
    match raw {
        None => Ok(None),
        Some("day") => Ok(Some(Period::Day)),
        Some("week") => Ok(Some(Period::Week)),
        Some("month") => Ok(Some(Period::Month)),
        Some(s) => Err(AppError::bad_request(
            "INVALID_PERIOD",
            format!("Unknown period: {}", s),
        )),
    }
}

/// Bucket raw usage rows the same way the aggregates table does. Used when
/// filtering by provider, which the aggregates do not carry.
pub fn aggregate_token_usage(rows: &[TokenUsageRow], bucket_type: BucketType) -> Vec<UsageBucketRow> {
    let mut buckets: BTreeMap<DateTime<Utc>, UsageBucketRow> = BTreeMap::new();
    for row in rows {
        let start = bucket_start(row.created_at, bucket_type);
        let b = buckets.entry(start).or_insert_with(|| UsageBucketRow {
            bucket_start: start,
            ..Default::default()
        });
        b.requests += 1;
        b.input_tokens += row.input_tokens;
        b.output_tokens += row.output_tokens;
        b.total_tokens += row.total_tokens;
        b.cache_write_tokens += row.cache_creation_tokens;
        b.cache_read_tokens += row.cache_read_tokens;
        b.input_cost_usd += row.input_cost_usd;
        b.output_cost_usd += row.output_cost_usd;
        b.cache_write_cost_usd += row.cache_write_cost_usd;
        b.cache_read_cost_usd += row.cache_read_cost_usd;
        b.estimated_cost_usd += row.estimated_cost_usd;
    }
    buckets.into_values().collect()
}

/// Attach series rows to their users, keeping the ranking order of `top`.
pub fn assemble_series(top: &[TopUserRow], rows: Vec<UserSeriesRow>) -> Vec<TopUserSeries> {
    let mut series: Vec<TopUserSeries> = top
        .iter()
        .map(|u| TopUserSeries {
            user_id: u.user_id,
            name: u.name.clone(),
            buckets: Vec::new(),
        })
        .collect();
    for row in rows {
        if let Some(user) = series.iter_mut().find(|s| s.user_id == row.user_id) {
            user.buckets.push(SeriesPoint {
                bucket_start: row.bucket_start,
                total_tokens: row.total_tokens,
            });
        }
    }
    series
}

fn invalid_range(e: RangeError) -> AppError {
    AppError::bad_request("INVALID_DATE_RANGE", e.to_string())
}

/// Explicit instants, defaulting to the 24 hours before `end`.
fn trailing_range(
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<(DateTime<Utc>, DateTime<Utc>), AppError> {
    let end = end.unwrap_or(now);
    let start = match start {
        Some(s) => s,
        None => end
            .checked_sub_signed(Duration::hours(24))
            .ok_or_else(|| invalid_range(RangeError::OutOfRange))?,
    };
    if start >= end {
        return Err(AppError::bad_request("INVALID_DATE_RANGE", "Invalid date range"));
    }
    Ok((start, end))
}

pub async fn get_usage(
    State(state): State<Arc<AppState>>,
    Query(params): Query<UsageQuery>,
) -> Result<Json<UsageResponse>, AppError> {
    let bucket_type = parse_bucket_type(params.bucket_type.as_deref())?;
    let period = parse_period(params.period.as_deref())?;
    let provider = params
        .provider
        .as_deref()
        .map(|p| {
            p.parse::<Provider>().map_err(|_| {
                AppError::bad_request("INVALID_PROVIDER", format!("Unknown provider: {}", p))
            })
        })
        .transpose()?;

    let (start, end) = resolve_time_range(period, params.start_date, params.end_date, Utc::now())
        .map_err(invalid_range)?;

    let filter = UsageFilter {
        bucket_type,
        start,
        end,
        user_id: params.user_id,
        access_key_id: params.access_key_id,
        provider: provider.map(|p| p.as_str().to_string()),
    };

    let buckets = match provider {
        Some(_) => aggregate_token_usage(&state.db.list_token_usage(&filter).await?, bucket_type),
        None => state.db.query_bucket_totals(&filter).await?,
    };
    let cost_breakdown = state.db.cost_breakdown_by_model(&filter).await?;

    Ok(Json(UsageResponse {
        bucket_type,
        start,
        end,
        totals: UsageTotals::from_buckets(&buckets),
        buckets,
        cost_breakdown,
    }))
}

pub async fn get_top_users(
    State(state): State<Arc<AppState>>,
    Query(params): Query<TopUsersQuery>,
) -> Result<Json<Vec<TopUserRow>>, AppError> {
    let bucket_type = parse_bucket_type(params.bucket_type.as_deref())?;
    let (start, end) = trailing_range(params.start_time, params.end_time, Utc::now())?;
    let limit = params.limit.unwrap_or(10).clamp(1, 100);

    Ok(Json(state.db.top_users(bucket_type, start, end, limit).await?))
}

pub async fn get_top_user_series(
    State(state): State<Arc<AppState>>,
    Query(params): Query<TopUsersQuery>,
) -> Result<Json<Vec<TopUserSeries>>, AppError> {
    let bucket_type = parse_bucket_type(params.bucket_type.as_deref())?;
    let (start, end) = trailing_range(params.start_time, params.end_time, Utc::now())?;
    let limit = params.limit.unwrap_or(5).clamp(1, 100);

    let top = state.db.top_users(bucket_type, start, end, limit).await?;
    let user_ids: Vec<Uuid> = top.iter().map(|u| u.user_id).collect();
    let rows = state.db.user_series(bucket_type, start, end, &user_ids).await?;
    Ok(Json(assemble_series(&top, rows)))
}

// ── Tests ────────────────────────────────────────────────────
