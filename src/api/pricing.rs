use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};

use crate::models::pricing::{ModelPricing, DEFAULT_PRICING_REGION};
use crate::proxy::circuit_breaker::CircuitSnapshot;
use crate::AppState;

#[derive(Deserialize)]
pub struct PricingQuery {
    pub region: Option<String>,
}

#[derive(Serialize)]
pub struct PricingListResponse {
    pub region: String,
    pub models: Vec<ModelPricing>,
}

pub async fn list_model_pricing(
    State(state): State<Arc<AppState>>,
    Query(params): Query<PricingQuery>,
) -> Json<PricingListResponse> {
    let region = params
        .region
        .filter(|r| !r.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_PRICING_REGION.to_string());
    let models = state.pricing.get_all_pricing(&region).await;
    Json(PricingListResponse { region, models })
}

/// Re-read `PROXY_MODEL_PRICING` without a restart.
pub async fn reload_pricing(State(state): State<Arc<AppState>>) -> StatusCode {
    state.pricing.reload().await;
    StatusCode::NO_CONTENT
}

pub async fn list_circuit_breakers(
    State(state): State<Arc<AppState>>,
) -> Json<Vec<CircuitSnapshot>> {
    Json(state.breaker.snapshot())
}
