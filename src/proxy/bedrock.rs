//! Bedrock Converse adapter.
//!
//! Authenticates with a per-access-key Bedrock API key (Bearer), stored
//! encrypted and cached decrypted for a short TTL.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::cache::TtlCache;
use crate::config::Config;
use crate::models::error_type::ErrorType;
use crate::proxy::adapter::{
    truncate_body, Adapter, AdapterCall, AdapterError, AdapterResponse, ByteStream,
};
use crate::proxy::converse::{build_converse_request, parse_converse_response, translate_converse_stream};
use crate::proxy::model_mapping::{bedrock_path_model, ModelResolver};
use crate::proxy::upstream::{classify_transport, TransportFailure};
use crate::store::BedrockKeyStore;
use crate::vault::KeyCipher;

const ERROR_BODY_LIMIT: usize = 200;

type SecretKey = Arc<Zeroizing<String>>;

pub struct BedrockAdapter {
    client: reqwest::Client,
    endpoint: Option<String>,
    cipher: Arc<KeyCipher>,
    store: Arc<dyn BedrockKeyStore>,
    keys: TtlCache<Uuid, SecretKey>,
    resolver: ModelResolver,
}

impl BedrockAdapter {
    pub fn new(
        client: reqwest::Client,
        endpoint: Option<String>,
        cipher: Arc<KeyCipher>,
        store: Arc<dyn BedrockKeyStore>,
        key_ttl: Duration,
        resolver: ModelResolver,
    ) -> Self {
        Self {
            client,
            endpoint: endpoint.map(|e| e.trim_end_matches('/').to_string()),
            cipher,
            store,
            keys: TtlCache::new(key_ttl),
            resolver,
        }
    }

    pub fn from_config(
        config: &Config,
        client: reqwest::Client,
        cipher: Arc<KeyCipher>,
        store: Arc<dyn BedrockKeyStore>,
        resolver: ModelResolver,
    ) -> Self {
        Self::new(
            client,
            config.bedrock_endpoint.clone(),
            cipher,
            store,
            config.bedrock_key_cache_ttl,
            resolver,
        )
    }

    pub fn key_cache(&self) -> &TtlCache<Uuid, SecretKey> {
        &self.keys
    }

    /// Drop the cached key after it was replaced or revoked.
    pub fn invalidate_bedrock_key(&self, access_key_id: Uuid) {
        self.keys.invalidate(&access_key_id);
    }

    fn base_url(&self, region: &str) -> String {
        match &self.endpoint {
            Some(endpoint) => endpoint.clone(),
            None => format!("https://bedrock-runtime.{}.amazonaws.com", region),
        }
    }

    async fn model_for(&self, call: &AdapterCall<'_>) -> String {
        if call.ctx.bedrock_model.is_empty() {
            self.resolver.resolve(&call.request.model).await
        } else {
            call.ctx.bedrock_model.clone()
        }
    }

    async fn api_key(&self, access_key_id: Uuid) -> Result<SecretKey, AdapterError> {
        if let Some(key) = self.keys.get(&access_key_id) {
            return Ok(key);
        }

        let blob = self
            .store
            .get_encrypted_bedrock_key(access_key_id)
            .await
            .map_err(|e| {
                tracing::error!(access_key_id = %access_key_id, error = %e, "bedrock key lookup failed");
                AdapterError::new(ErrorType::BedrockUnavailable, 503, "Bedrock key lookup failed")
            })?
            .ok_or_else(|| {
                AdapterError::new(ErrorType::BedrockAuthError, 401, "Bedrock key not found")
            })?;

        let key = Arc::new(self.cipher.decrypt(&blob).map_err(|e| {
            tracing::error!(access_key_id = %access_key_id, error = %e, "bedrock key decrypt failed");
            AdapterError::new(ErrorType::BedrockAuthError, 401, "Bedrock key could not be decrypted")
        })?);
        self.keys.insert(access_key_id, key.clone());
        Ok(key)
    }

    async fn send(&self, call: &AdapterCall<'_>, action: &str) -> Result<reqwest::Response, AdapterError> {
        let api_key = self.api_key(call.ctx.access_key_id).await?;
        let model = self.model_for(call).await;
        let url = format!(
            "{}/model/{}/{}",
            self.base_url(&call.ctx.bedrock_region),
            bedrock_path_model(&model),
            action
        );

        let resp = self
            .client
            .post(&url)
            .bearer_auth(api_key.as_str())
            .json(&build_converse_request(call.request))
            .send()
            .await
            .map_err(|e| transport_error(&e))?;

        let status = resp.status().as_u16();
        if status == 200 {
            return Ok(resp);
        }
        let text = resp.text().await.unwrap_or_default();
        Err(classify_status(status, &text))
    }
}

#[async_trait]
impl Adapter for BedrockAdapter {
    async fn invoke(&self, call: &AdapterCall<'_>) -> Result<AdapterResponse, AdapterError> {
        let resp = self.send(call, "converse").await?;
        let bytes = resp.bytes().await.map_err(|e| transport_error(&e))?;
        let data: Value = serde_json::from_slice(&bytes).map_err(|e| {
            AdapterError::new(
                ErrorType::BedrockUnavailable,
                502,
                format!("Invalid Bedrock response: {}", e),
            )
        })?;

        let message_id = format!("msg_{}", call.ctx.request_id);
        let (response, usage) = parse_converse_response(&data, &call.request.model, &message_id);
        Ok(AdapterResponse { response, usage })
    }

    async fn stream(&self, call: &AdapterCall<'_>) -> Result<ByteStream, AdapterError> {
        let resp = self.send(call, "converse-stream").await?;
        Ok(translate_converse_stream(
            resp.bytes_stream(),
            format!("msg_{}", call.ctx.request_id),
            call.request.model.clone(),
        ))
    }
}

fn transport_error(err: &reqwest::Error) -> AdapterError {
    match classify_transport(err) {
        TransportFailure::Timeout => {
            AdapterError::new(ErrorType::BedrockUnavailable, 504, "Request timeout")
        }
        TransportFailure::Network => AdapterError::new(
            ErrorType::BedrockUnavailable,
            503,
            format!("Network error: {}", err),
        ),
    }
}

/// Map a non-200 Converse response. Nothing from Bedrock is retryable.
pub fn classify_status(status: u16, body: &str) -> AdapterError {
    let snippet = truncate_body(body, ERROR_BODY_LIMIT);
    match status {
        401 | 403 => AdapterError::new(ErrorType::BedrockAuthError, status, "Authentication failed"),
        429 => AdapterError::new(ErrorType::BedrockQuotaExceeded, 429, "Quota exceeded"),
        400 | 422 => AdapterError::new(ErrorType::BedrockValidation, status, snippet),
        s => AdapterError::new(ErrorType::BedrockUnavailable, s, snippet),
    }
}
