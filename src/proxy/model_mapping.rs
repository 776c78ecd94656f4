use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use crate::config::Config;
use crate::store::ModelMappingStore;

/// Anthropic model names the proxy maps to Bedrock inference profiles when
/// no mapping table is reachable. The `model_mappings` table is seeded with
/// the same rows.
const BUILTIN_MAPPING: &[(&str, &str)] = &[
    ("claude-opus-4-5", "global.anthropic.claude-opus-4-5-20251101-v1:0"),
    ("claude-opus-4-5-20251101", "global.anthropic.claude-opus-4-5-20251101-v1:0"),
    ("claude-sonnet-4-5", "global.anthropic.claude-sonnet-4-5-20250929-v1:0"),
    ("claude-sonnet-4-5-20250929", "global.anthropic.claude-sonnet-4-5-20250929-v1:0"),
    ("claude-haiku-4-5", "global.anthropic.claude-haiku-4-5-20251001-v1:0"),
    ("claude-haiku-4-5-20251001", "global.anthropic.claude-haiku-4-5-20251001-v1:0"),
];

struct LoadedMappings {
    mapping: Arc<HashMap<String, String>>,
    loaded_at: Instant,
    stale: bool,
}

/// Resolves a requested model name to a Bedrock model id.
///
/// Lookup order: `PROXY_BEDROCK_MODEL_MAPPING`, then the active rows of the
/// mapping table (cached for `model_mapping_cache_ttl`), then the built-in
/// table when no store is attached or it has never loaded. Clones share the
/// cache, so an `invalidate` from the admin API is seen by the adapter.
#[derive(Clone)]
pub struct ModelResolver {
    overrides: Arc<HashMap<String, String>>,
    default_model: String,
    store: Option<Arc<dyn ModelMappingStore>>,
    ttl: Duration,
    loaded: Arc<RwLock<Option<LoadedMappings>>>,
}

impl ModelResolver {
    pub fn new(overrides: &HashMap<String, String>, default_model: impl Into<String>) -> Self {
        Self {
            overrides: Arc::new(overrides.clone()),
            default_model: default_model.into(),
            store: None,
            ttl: Duration::ZERO,
            loaded: Arc::new(RwLock::new(None)),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let mut resolver = Self::new(&config.bedrock_model_mapping, config.bedrock_default_model.clone());
        resolver.ttl = config.model_mapping_cache_ttl;
        resolver
    }

    /// Read mappings from `store`, caching them for `ttl`.
    pub fn with_store(mut self, store: Arc<dyn ModelMappingStore>, ttl: Duration) -> Self {
        self.store = Some(store);
        self.ttl = ttl;
        self
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    pub async fn resolve(&self, requested: &str) -> String {
        if requested.is_empty() {
            return self.default_model.clone();
        }
        if let Some(mapped) = self.overrides.get(requested) {
            return mapped.clone();
        }
        let mapped = match self.table_mapping().await {
            Some(table) => table.get(requested).cloned(),
            None => BUILTIN_MAPPING
                .iter()
                .find(|(k, _)| *k == requested)
                .map(|(_, v)| v.to_string()),
        };
        if let Some(mapped) = mapped {
            return mapped;
        }
        if requested.starts_with("global.anthropic.") || requested.starts_with("anthropic.") {
            return requested.to_string();
        }
        self.default_model.clone()
    }

    /// Force the next lookup to reload from the store.
    pub async fn invalidate(&self) {
        if let Some(loaded) = self.loaded.write().await.as_mut() {
            loaded.stale = true;
        }
    }

    async fn table_mapping(&self) -> Option<Arc<HashMap<String, String>>> {
        let store = self.store.as_ref()?;
        {
            let guard = self.loaded.read().await;
            if let Some(loaded) = guard.as_ref() {
                if !loaded.stale && loaded.loaded_at.elapsed() < self.ttl {
                    return Some(loaded.mapping.clone());
                }
            }
        }

        match store.active_model_mappings().await {
            Ok(mapping) => {
                let mapping = Arc::new(mapping);
                *self.loaded.write().await = Some(LoadedMappings {
                    mapping: mapping.clone(),
                    loaded_at: Instant::now(),
                    stale: false,
                });
                tracing::debug!(count = mapping.len(), "model mappings loaded");
                Some(mapping)
            }
            Err(e) => {
                tracing::warn!(error = %e, "model mapping load failed, using last known mappings");
                self.loaded.read().await.as_ref().map(|l| l.mapping.clone())
            }
        }
    }
}

/// Model id as it appears in the Converse URL path.
pub fn bedrock_path_model(model_id: &str) -> &str {
    ["bedrock/", "converse/"]
        .iter()
        .find_map(|p| model_id.strip_prefix(p))
        .unwrap_or(model_id)
}
