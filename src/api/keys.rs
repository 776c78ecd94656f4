use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::errors::AppError;
use crate::store::postgres::{AccessKeyRow, NewAccessKey};
use crate::vault::KeyGenerator;
use crate::AppState;

/// How long a rotated-out key keeps authenticating.
pub const ROTATION_GRACE_SECS: i64 = 300;

#[derive(Deserialize, Default)]
pub struct IssueKeyRequest {
    pub bedrock_region: Option<String>,
    pub bedrock_model: Option<String>,
}

#[derive(Deserialize)]
pub struct RegisterBedrockKeyRequest {
    pub bedrock_api_key: String,
}

/// Access key plus the raw secret; the only time the secret leaves the server.
#[derive(Serialize)]
pub struct IssuedKeyResponse {
    #[serde(flatten)]
    pub key: AccessKeyRow,
    pub raw_key: String,
}

async fn load_live_key(state: &AppState, id: Uuid) -> Result<AccessKeyRow, AppError> {
    match state.db.get_access_key(id).await? {
        Some(key) if !key.is_revoked() => Ok(key),
        _ => Err(AppError::NotFound("Access key")),
    }
}

pub async fn list_access_keys(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<Vec<AccessKeyRow>>, AppError> {
    Ok(Json(state.db.list_access_keys(user_id).await?))
}

pub async fn issue_access_key(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<Uuid>,
    payload: Option<Json<IssueKeyRequest>>,
) -> Result<(StatusCode, Json<IssuedKeyResponse>), AppError> {
    let payload = payload.map(|Json(p)| p).unwrap_or_default();

    match state.db.get_user(user_id).await? {
        Some(user) if user.is_active() => {}
        _ => return Err(AppError::NotFound("Active user")),
    }

    let bedrock_region = payload
        .bedrock_region
        .filter(|r| !r.trim().is_empty())
        .unwrap_or_else(|| state.config.bedrock_region.clone());
    let bedrock_model = state
        .resolver
        .resolve(payload.bedrock_model.as_deref().unwrap_or_default())
        .await;

    let generated = KeyGenerator::generate();
    let key = state
        .db
        .create_access_key(&NewAccessKey {
            user_id,
            key_hash: state.auth.hasher().hash(&generated.raw_key),
            key_prefix: generated.key_prefix,
            bedrock_region,
            bedrock_model,
        })
        .await?;

    tracing::info!(user_id = %user_id, access_key_id = %key.id, prefix = %key.key_prefix, "access key issued");
    Ok((
        StatusCode::CREATED,
        Json(IssuedKeyResponse {
            key,
            raw_key: generated.raw_key,
        }),
    ))
}

pub async fn revoke_access_key(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    let key = load_live_key(&state, id).await?;

    if !state.db.revoke_access_key(id).await? {
        return Err(AppError::NotFound("Access key"));
    }
    state.auth.invalidate_access_key(&key.key_hash);
    state.bedrock.invalidate_bedrock_key(id);

    tracing::info!(access_key_id = %id, prefix = %key.key_prefix, "access key revoked");
    Ok(StatusCode::NO_CONTENT)
}

/// Issue a replacement key. The old one keeps working for
/// `ROTATION_GRACE_SECS` and its Bedrock credentials carry over.
pub async fn rotate_access_key(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<IssuedKeyResponse>, AppError> {
    let old = load_live_key(&state, id).await?;

    let generated = KeyGenerator::generate();
    let grace_expires_at = Utc::now() + Duration::seconds(ROTATION_GRACE_SECS);
    let key = state
        .db
        .rotate_access_key(
            &old,
            &state.auth.hasher().hash(&generated.raw_key),
            &generated.key_prefix,
            grace_expires_at,
        )
        .await?;
    state.auth.invalidate_access_key(&old.key_hash);

    tracing::info!(
        old_access_key_id = %old.id,
        new_access_key_id = %key.id,
        grace_expires_at = %grace_expires_at,
        "access key rotated"
    );
    Ok(Json(IssuedKeyResponse {
        key,
        raw_key: generated.raw_key,
    }))
}

pub async fn register_bedrock_key(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<RegisterBedrockKeyRequest>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let secret = payload.bedrock_api_key.trim();
    if secret.is_empty() {
        return Err(AppError::bad_request(
            "INVALID_BEDROCK_KEY",
            "bedrock_api_key must not be empty",
        ));
    }
    let key = load_live_key(&state, id).await?;

    let encrypted = state.cipher.encrypt(secret)?;
    let key_hash = state.auth.hasher().hash(secret);
    state.db.upsert_bedrock_key(id, &encrypted, &key_hash).await?;

    state.bedrock.invalidate_bedrock_key(id);
    // has_bedrock_key is part of the cached auth row.
    state.auth.invalidate_access_key(&key.key_hash);

    tracing::info!(access_key_id = %id, "bedrock key registered");
    Ok((StatusCode::CREATED, Json(json!({ "status": "registered" }))))
}
