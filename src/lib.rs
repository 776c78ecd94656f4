//! plan-proxy: Anthropic Messages proxy with Plan-first routing and a
//! Bedrock Converse fallback.
//!
//! The binary in `main.rs` wires [`AppState`] and [`build_app`]; integration
//! tests in `tests/` use the same pieces.

use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Request, State},
    http::{header, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tower_http::trace::TraceLayer;

pub mod api;
pub mod cache;
pub mod cli;
pub mod config;
pub mod errors;
pub mod middleware;
pub mod models;
pub mod proxy;
pub mod store;
pub mod vault;

use crate::middleware::metrics::PrometheusRecorder;
use crate::models::pricing::PricingConfig;
use crate::proxy::auth::AuthService;
use crate::proxy::bedrock::BedrockAdapter;
use crate::proxy::budget::BudgetService;
use crate::proxy::circuit_breaker::CircuitBreaker;
use crate::proxy::model_mapping::ModelResolver;
use crate::proxy::plan::PlanAdapter;
use crate::proxy::router::ProxyRouter;
use crate::proxy::upstream::build_http_client;
use crate::proxy::usage::UsageRecorder;
use crate::store::postgres::PgStore;
use crate::vault::{KeyCipher, KeyHasher, KeyMasker};

const MAX_BODY_BYTES: usize = 25 * 1024 * 1024;

/// Shared application state passed to handlers and middleware.
pub struct AppState {
    pub config: config::Config,
    pub db: PgStore,
    pub auth: AuthService,
    pub router: ProxyRouter,
    pub plan: Arc<PlanAdapter>,
    pub bedrock: Arc<BedrockAdapter>,
    pub budget: BudgetService,
    pub recorder: Arc<UsageRecorder>,
    pub breaker: Arc<CircuitBreaker>,
    pub pricing: PricingConfig,
    pub metrics: Arc<PrometheusRecorder>,
    pub cipher: Arc<KeyCipher>,
    pub resolver: ModelResolver,
}

impl AppState {
    pub fn new(config: config::Config, db: PgStore) -> anyhow::Result<Self> {
        let store = Arc::new(db.clone());
        let client = build_http_client(&config)?;
        let cipher = Arc::new(KeyCipher::new(config.encryption_key())?);
        let metrics = Arc::new(PrometheusRecorder::new()?);
        let pricing = PricingConfig::load_from_env();

        let budget = BudgetService::new(store.clone(), config.budget_cache_ttl);
        let auth = AuthService::new(
            KeyHasher::new(&config.key_hasher_secret),
            store.clone(),
            config.access_key_cache_ttl,
        );
        let breaker = Arc::new(CircuitBreaker::from_config(&config));
        let resolver = ModelResolver::from_config(&config)
            .with_store(store.clone(), config.model_mapping_cache_ttl);

        let plan = Arc::new(PlanAdapter::new(
            client.clone(),
            &config.plan_api_url,
            config.plan_api_key.clone(),
        ));
        let bedrock = Arc::new(BedrockAdapter::from_config(
            &config,
            client,
            cipher.clone(),
            store.clone(),
            resolver.clone(),
        ));

        let router = ProxyRouter::new(
            plan.clone(),
            bedrock.clone(),
            breaker.clone(),
            budget.clone(),
            metrics.clone(),
        );
        let recorder = Arc::new(UsageRecorder::new(
            store,
            pricing.clone(),
            budget.clone(),
            metrics.clone(),
        ));

        Ok(Self {
            config,
            db,
            auth,
            router,
            plan,
            bedrock,
            budget,
            recorder,
            breaker,
            pricing,
            metrics,
            cipher,
            resolver,
        })
    }
}

/// The full HTTP surface: proxy, health, metrics and admin.
pub fn build_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .route("/ak/:access_key/v1/messages", post(proxy::handler::messages))
        .route(
            "/ak/:access_key/v1/messages/count_tokens",
            post(proxy::handler::count_tokens),
        )
        .nest("/admin", api::admin_router(state.clone()))
        .with_state(state)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        // Access keys live in the path; never let them reach the logs.
        .layer(TraceLayer::new_for_http().make_span_with(|req: &Request| {
            tracing::info_span!(
                "http_request",
                method = %req.method(),
                uri = %KeyMasker::mask(&req.uri().to_string()),
            )
        }))
        .layer(axum::middleware::from_fn(request_id_middleware))
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "healthy" }))
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.metrics.encode() {
        Ok(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "metrics encoding failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Middleware: make sure every response carries an `x-request-id`.
/// Proxy handlers set their own; everything else gets a fresh one.
async fn request_id_middleware(req: Request, next: Next) -> Response {
    let mut resp = next.run(req).await;
    if !resp.headers().contains_key("x-request-id") {
        let req_id = format!("req_{}", uuid::Uuid::new_v4().simple());
        if let Ok(val) = HeaderValue::from_str(&req_id) {
            resp.headers_mut().insert("x-request-id", val);
        }
    }
    resp
}
