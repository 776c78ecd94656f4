use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::Response,
    routing::{delete, get, post, put},
    Router,
};
use subtle::ConstantTimeEq;

use crate::AppState;

pub mod keys;
pub mod models;
pub mod pricing;
pub mod usage;
pub mod users;

/// Build the admin API router.
/// All routes are relative; the caller mounts this under `/admin`.
pub fn admin_router(state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/users", get(users::list_users).post(users::create_user))
        .route("/users/:id", get(users::get_user).delete(users::delete_user))
        .route(
            "/users/:id/budget",
            get(users::get_user_budget).put(users::update_user_budget),
        )
        .route("/users/:id/deactivate", post(users::deactivate_user))
        .route(
            "/users/:id/routing-strategy",
            put(users::update_routing_strategy),
        )
        .route(
            "/users/:id/access-keys",
            get(keys::list_access_keys).post(keys::issue_access_key),
        )
        .route("/access-keys/:id", delete(keys::revoke_access_key))
        .route("/access-keys/:id/rotate", post(keys::rotate_access_key))
        .route(
            "/access-keys/:id/bedrock-key",
            post(keys::register_bedrock_key),
        )
        .route("/usage", get(usage::get_usage))
        .route("/usage/top-users", get(usage::get_top_users))
        .route("/usage/top-users/series", get(usage::get_top_user_series))
        .route(
            "/models/mappings",
            get(models::list_model_mappings).post(models::create_model_mapping),
        )
        .route(
            "/models/mappings/:id",
            get(models::get_model_mapping)
                .put(models::update_model_mapping)
                .delete(models::delete_model_mapping),
        )
        .route("/pricing/models", get(pricing::list_model_pricing))
        .route("/pricing/reload", post(pricing::reload_pricing))
        .route("/circuit-breakers", get(pricing::list_circuit_breakers))
        .layer(middleware::from_fn_with_state(state, admin_auth))
        .fallback(fallback_404)
}

async fn fallback_404() -> StatusCode {
    StatusCode::NOT_FOUND
}

fn provided_admin_key(req: &Request) -> Option<&str> {
    req.headers()
        .get("x-admin-key")
        .and_then(|v| v.to_str().ok())
        .or_else(|| {
            req.headers()
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
                .map(|t| t.trim())
        })
}

/// Middleware: validates `X-Admin-Key` (or a Bearer token) against
/// `PROXY_ADMIN_KEY` in constant time.
/// Returns 401 if missing or wrong, 503 when no admin key is configured.
async fn admin_auth(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let Some(expected) = state.config.admin_key.as_deref() else {
        tracing::error!("PROXY_ADMIN_KEY is not set; admin API disabled");
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    };

    match provided_admin_key(&req) {
        Some(k) if bool::from(k.as_bytes().ct_eq(expected.as_bytes())) => Ok(next.run(req).await),
        Some(_) => {
            // Never log the expected or provided key.
            tracing::warn!("admin API: invalid key");
            Err(StatusCode::UNAUTHORIZED)
        }
        None => {
            tracing::warn!("admin API: missing X-Admin-Key header");
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    #[test]
    fn test_provided_admin_key_sources() {
        let req = Request::builder()
            .header("x-admin-key", "k1")
            .body(Body::empty())
            .unwrap();
        assert_eq!(provided_admin_key(&req), Some("k1"));

        let req = Request::builder()
            .header("authorization", "Bearer  k2 ")
            .body(Body::empty())
            .unwrap();
        assert_eq!(provided_admin_key(&req), Some("k2"));

        let req = Request::builder()
            .header("authorization", "Basic abc")
            .body(Body::empty())
            .unwrap();
        assert_eq!(provided_admin_key(&req), None);
    }
}
