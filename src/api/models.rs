use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::errors::AppError;
use crate::store::postgres::{ModelMappingRow, ModelMappingUpdate, NewModelMapping};
use crate::AppState;

const MAX_MODEL_NAME_LEN: usize = 128;

#[derive(Deserialize)]
pub struct MappingListParams {
    #[serde(default)]
    pub include_inactive: bool,
}

#[derive(Deserialize)]
pub struct CreateMappingRequest {
    pub claude_model: String,
    pub bedrock_model: String,
    pub description: Option<String>,
    pub is_active: Option<bool>,
}

#[derive(Deserialize)]
pub struct UpdateMappingRequest {
    pub bedrock_model: Option<String>,
    pub description: Option<String>,
    pub is_active: Option<bool>,
}

fn validate_model_name(field: &str, value: &str) -> Result<String, AppError> {
    let value = value.trim();
    if value.is_empty() || value.len() > MAX_MODEL_NAME_LEN {
        return Err(AppError::bad_request(
            "INVALID_MODEL_MAPPING",
            format!("{} must be 1 to {} characters", field, MAX_MODEL_NAME_LEN),
        ));
    }
    Ok(value.to_string())
}

pub fn validate_new_mapping(req: CreateMappingRequest) -> Result<NewModelMapping, AppError> {
    Ok(NewModelMapping {
        claude_model: validate_model_name("claude_model", &req.claude_model)?,
        bedrock_model: validate_model_name("bedrock_model", &req.bedrock_model)?,
        description: req.description,
        is_active: req.is_active.unwrap_or(true),
    })
}

pub fn validate_mapping_update(req: UpdateMappingRequest) -> Result<ModelMappingUpdate, AppError> {
    let bedrock_model = req
        .bedrock_model
        .as_deref()
        .map(|m| validate_model_name("bedrock_model", m))
        .transpose()?;
    Ok(ModelMappingUpdate {
        bedrock_model,
        description: req.description,
        is_active: req.is_active,
    })
}

pub async fn list_model_mappings(
    State(state): State<Arc<AppState>>,
    Query(params): Query<MappingListParams>,
) -> Result<Json<Vec<ModelMappingRow>>, AppError> {
    Ok(Json(state.db.list_model_mappings(params.include_inactive).await?))
}

pub async fn create_model_mapping(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateMappingRequest>,
) -> Result<(StatusCode, Json<ModelMappingRow>), AppError> {
    let new = validate_new_mapping(payload)?;
    let Some(mapping) = state.db.create_model_mapping(&new).await? else {
        return Err(AppError::Conflict(format!(
            "Mapping for claude model '{}' already exists",
            new.claude_model
        )));
    };
    state.resolver.invalidate().await;

    tracing::info!(mapping_id = %mapping.id, claude_model = %mapping.claude_model, "model mapping created");
    Ok((StatusCode::CREATED, Json(mapping)))
}

pub async fn get_model_mapping(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<ModelMappingRow>, AppError> {
    state
        .db
        .get_model_mapping(id)
        .await?
        .map(Json)
        .ok_or(AppError::NotFound("Model mapping"))
}

pub async fn update_model_mapping(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateMappingRequest>,
) -> Result<Json<ModelMappingRow>, AppError> {
    let update = validate_mapping_update(payload)?;
    let mapping = state
        .db
        .update_model_mapping(id, &update)
        .await?
        .ok_or(AppError::NotFound("Model mapping"))?;
    state.resolver.invalidate().await;

    tracing::info!(mapping_id = %id, "model mapping updated");
    Ok(Json(mapping))
}

pub async fn delete_model_mapping(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    if !state.db.delete_model_mapping(id).await? {
        return Err(AppError::NotFound("Model mapping"));
    }
    state.resolver.invalidate().await;

    tracing::info!(mapping_id = %id, "model mapping deleted");
    Ok(StatusCode::NO_CONTENT)
}
