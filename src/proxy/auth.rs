use std::sync::Arc;
use std::time::Duration;

use crate::cache::TtlCache;
use crate::models::entities::RoutingStrategy;
use crate::proxy::context::{new_request_id, RequestContext};
use crate::store::{AccessKeyStore, AuthKeyRow};
use crate::vault::KeyHasher;

/// Resolves raw access keys from request URLs to a [`RequestContext`].
///
/// Lookups are cached by key hash; negative results are not cached so a key
/// issued a moment ago works immediately.
#[derive(Clone)]
pub struct AuthService {
    hasher: KeyHasher,
    store: Arc<dyn AccessKeyStore>,
    cache: TtlCache<String, AuthKeyRow>,
}

impl AuthService {
    pub fn new(hasher: KeyHasher, store: Arc<dyn AccessKeyStore>, ttl: Duration) -> Self {
        Self {
            hasher,
            store,
            cache: TtlCache::new(ttl),
        }
    }

    pub fn hasher(&self) -> &KeyHasher {
        &self.hasher
    }

    pub fn cache(&self) -> &TtlCache<String, AuthKeyRow> {
        &self.cache
    }

    pub async fn authenticate(&self, raw_key: &str) -> anyhow::Result<Option<RequestContext>> {
        let key_hash = self.hasher.hash(raw_key);

        let row = match self.cache.get(&key_hash) {
            Some(row) => row,
            None => match self.store.find_auth_key(&key_hash).await? {
                Some(row) => {
                    self.cache.insert(key_hash, row.clone());
                    row
                }
                None => return Ok(None),
            },
        };

        let routing_strategy = row.routing_strategy.parse::<RoutingStrategy>().unwrap_or_else(|e| {
            tracing::warn!(access_key_id = %row.access_key_id, error = %e, "unknown routing strategy, using plan_first");
            RoutingStrategy::default()
        });

        Ok(Some(RequestContext {
            request_id: new_request_id(),
            user_id: row.user_id,
            access_key_id: row.access_key_id,
            access_key_prefix: row.key_prefix,
            bedrock_region: row.bedrock_region,
            bedrock_model: row.bedrock_model,
            has_bedrock_key: row.has_bedrock_key,
            routing_strategy,
        }))
    }

    pub fn invalidate_access_key(&self, key_hash: &str) {
        self.cache.invalidate(&key_hash.to_string());
    }
}
