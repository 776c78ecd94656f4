use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::entities::{RoutingStrategy, UserStatus};
use crate::proxy::budget::BudgetCheckResult;
use crate::store::postgres::{NewUser, UserRow};
use crate::AppState;

// -- Request / Response types --

#[derive(Deserialize)]
pub struct ListParams {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Deserialize)]
pub struct CreateUserRequest {
    pub name: String,
    pub description: Option<String>,
    pub routing_strategy: Option<String>,
    pub monthly_budget_usd: Option<Decimal>,
}

#[derive(Deserialize)]
pub struct UpdateBudgetRequest {
    /// `null` removes the budget.
    pub monthly_budget_usd: Option<Decimal>,
}

#[derive(Deserialize)]
pub struct UpdateRoutingRequest {
    pub routing_strategy: String,
}

#[derive(Serialize)]
pub struct BudgetResponse {
    pub user_id: Uuid,
    pub monthly_budget_usd: Option<Decimal>,
    pub current_usage_usd: Decimal,
    pub remaining_usd: Option<Decimal>,
    pub usage_percentage: Option<f64>,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
}

impl BudgetResponse {
    fn new(user_id: Uuid, check: BudgetCheckResult) -> Self {
        Self {
            user_id,
            monthly_budget_usd: check.monthly_budget,
            current_usage_usd: check.current_usage,
            remaining_usd: check.remaining,
            usage_percentage: check.usage_percentage,
            period_start: check.period_start,
            period_end: check.period_end,
        }
    }
}

// -- Validation --

pub fn validate_budget(budget: Option<Decimal>) -> Result<(), AppError> {
    let Some(value) = budget else {
        return Ok(());
    };
    let min = Decimal::new(1, 2);
    let max = Decimal::new(99_999_999, 2);
    if value < min || value > max {
        return Err(AppError::bad_request(
            "INVALID_BUDGET",
            "monthly_budget_usd must be between 0.01 and 999999.99",
        ));
    }
    Ok(())
}

fn parse_strategy(raw: &str) -> Result<RoutingStrategy, AppError> {
    raw.parse().map_err(|_| {
        AppError::bad_request(
            "INVALID_ROUTING_STRATEGY",
            format!("Unknown routing strategy: {}", raw),
        )
    })
}

/// bedrock_only needs every live key of the user to carry Bedrock credentials.
pub fn ensure_bedrock_ready(keys: &[(Uuid, bool)]) -> Result<(), AppError> {
    if keys.is_empty() {
        return Err(AppError::bad_request(
            "NO_ACCESS_KEYS",
            "At least one active access key is required before enabling bedrock_only routing",
        ));
    }
    if keys.iter().any(|(_, has_bedrock)| !has_bedrock) {
        return Err(AppError::bad_request(
            "MISSING_BEDROCK_KEYS",
            "Bedrock credentials must be registered for all active access keys before enabling bedrock_only routing",
        ));
    }
    Ok(())
}

async fn load_user(state: &AppState, id: Uuid) -> Result<UserRow, AppError> {
    match state.db.get_user(id).await? {
        Some(user) if !user.is_deleted() => Ok(user),
        _ => Err(AppError::NotFound("User")),
    }
}

/// Drop every cached auth entry for the user's keys so routing or status
/// changes apply on the next request.
async fn invalidate_user_keys(state: &AppState, user_id: Uuid) -> Result<(), AppError> {
    for key in state.db.list_access_keys(user_id).await? {
        state.auth.invalidate_access_key(&key.key_hash);
        state.bedrock.invalidate_bedrock_key(key.id);
    }
    Ok(())
}

// -- Handlers --

pub async fn list_users(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<UserRow>>, AppError> {
    let limit = params.limit.unwrap_or(100).clamp(1, 500);
    let offset = params.offset.unwrap_or(0).max(0);
    Ok(Json(state.db.list_users(limit, offset).await?))
}

pub async fn create_user(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateUserRequest>,
) -> Result<(StatusCode, Json<UserRow>), AppError> {
    let name = payload.name.trim();
    if name.is_empty() || name.len() > 255 {
        return Err(AppError::bad_request(
            "INVALID_NAME",
            "name must be 1-255 characters",
        ));
    }
    validate_budget(payload.monthly_budget_usd)?;

    let routing_strategy = match payload.routing_strategy.as_deref() {
        Some(raw) => parse_strategy(raw)?,
        None => RoutingStrategy::PlanFirst,
    };
    if routing_strategy == RoutingStrategy::BedrockOnly {
        // A new user has no keys yet, so no Bedrock credentials either.
        return Err(AppError::bad_request(
            "MISSING_BEDROCK_KEYS",
            "Bedrock key required before enabling bedrock_only routing",
        ));
    }

    let user = state
        .db
        .create_user(&NewUser {
            name: name.to_string(),
            description: payload.description,
            routing_strategy,
            monthly_budget_usd: payload.monthly_budget_usd,
        })
        .await?;

    tracing::info!(user_id = %user.id, "user created");
    Ok((StatusCode::CREATED, Json(user)))
}

pub async fn get_user(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<UserRow>, AppError> {
    Ok(Json(load_user(&state, id).await?))
}

pub async fn get_user_budget(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<BudgetResponse>, AppError> {
    load_user(&state, id).await?;
    let check = state
        .budget
        .check_budget(id)
        .await
        .map_err(|e| AppError::Internal(e.into()))?;
    Ok(Json(BudgetResponse::new(id, check)))
}

pub async fn update_user_budget(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateBudgetRequest>,
) -> Result<Json<BudgetResponse>, AppError> {
    validate_budget(payload.monthly_budget_usd)?;
    load_user(&state, id).await?;

    if !state
        .db
        .update_user_budget(id, payload.monthly_budget_usd)
        .await?
    {
        return Err(AppError::NotFound("User"));
    }
    state.budget.invalidate_cache(id);

    let check = state
        .budget
        .check_budget(id)
        .await
        .map_err(|e| AppError::Internal(e.into()))?;
    tracing::info!(user_id = %id, budget = ?payload.monthly_budget_usd, "user budget updated");
    Ok(Json(BudgetResponse::new(id, check)))
}

pub async fn deactivate_user(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<UserRow>, AppError> {
    let user = load_user(&state, id).await?;
    if !user.is_active() {
        return Err(AppError::NotFound("Active user"));
    }

    let hashes = state.db.retire_user(id, UserStatus::Inactive).await?;
    for hash in &hashes {
        state.auth.invalidate_access_key(hash);
    }
    state.budget.invalidate_cache(id);
    tracing::info!(user_id = %id, revoked_keys = hashes.len(), "user deactivated");

    Ok(Json(load_user(&state, id).await?))
}

pub async fn delete_user(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    load_user(&state, id).await?;

    let hashes = state.db.retire_user(id, UserStatus::Deleted).await?;
    for hash in &hashes {
        state.auth.invalidate_access_key(hash);
    }
    state.budget.invalidate_cache(id);
    tracing::info!(user_id = %id, revoked_keys = hashes.len(), "user deleted");

    Ok(StatusCode::NO_CONTENT)
}

pub async fn update_routing_strategy(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateRoutingRequest>,
) -> Result<Json<UserRow>, AppError> {
    let strategy = parse_strategy(&payload.routing_strategy)?;
    load_user(&state, id).await?;

    if strategy == RoutingStrategy::BedrockOnly {
        // Fresh read; the auth cache may be stale.
        let keys = state.db.live_key_bedrock_status(id).await?;
        ensure_bedrock_ready(&keys)?;
    }

    if !state.db.update_routing_strategy(id, strategy).await? {
        return Err(AppError::NotFound("User"));
    }
    invalidate_user_keys(&state, id).await?;
    tracing::info!(user_id = %id, routing_strategy = %strategy, "routing strategy updated");

    Ok(Json(load_user(&state, id).await?))
}

// ── Tests ────────────────────────────────────────────────────
