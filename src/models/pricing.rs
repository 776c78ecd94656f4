/// Per-region model pricing, loaded from `PROXY_MODEL_PRICING` or built-in
/// defaults and reloadable at runtime through the admin API.
use std::collections::HashMap;
use std::sync::Arc;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

pub const DEFAULT_PRICING_REGION: &str = "ap-northeast-2";
pub const PRICING_ENV_VAR: &str = "PROXY_MODEL_PRICING";

/// Model families with built-in prices. Resolved once from a model id so
/// callers never substring-match model names themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelFamily {
    Opus45,
    Sonnet45,
    Haiku45,
}

impl ModelFamily {
    pub fn pricing_key(&self) -> &'static str {
        match self {
            ModelFamily::Opus45 => "claude-opus-4-5",
            ModelFamily::Sonnet45 => "claude-sonnet-4-5",
            ModelFamily::Haiku45 => "claude-haiku-4-5",
        }
    }

    /// Exact id prefixes first, then a family keyword paired with a 4.5 marker.
    pub fn resolve(model_id: &str) -> Option<Self> {
        let lower = model_id.to_ascii_lowercase();
        let bare = lower
            .strip_prefix("global.anthropic.")
            .or_else(|| lower.strip_prefix("anthropic."))
            .unwrap_or(&lower);

        const FAMILIES: [ModelFamily; 3] =
            [ModelFamily::Opus45, ModelFamily::Sonnet45, ModelFamily::Haiku45];

        if let Some(f) = FAMILIES.iter().find(|f| bare.starts_with(f.pricing_key())) {
            return Some(*f);
        }

        let is_45 = lower.contains("4-5") || lower.contains("4.5");
        if !is_45 {
            return None;
        }
        if lower.contains("opus") {
            Some(ModelFamily::Opus45)
        } else if lower.contains("sonnet") {
            Some(ModelFamily::Sonnet45)
        } else if lower.contains("haiku") {
            Some(ModelFamily::Haiku45)
        } else {
            None
        }
    }
}

/// Pricing key for any model id: the family key when known, else the id itself.
pub fn normalize_model_id(model_id: &str) -> String {
    match ModelFamily::resolve(model_id) {
        Some(f) => f.pricing_key().to_string(),
        None => model_id.to_string(),
    }
}

/// USD per one million tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelPricing {
    pub model_id: String,
    pub region: String,
    pub input_price_per_million: Decimal,
    pub output_price_per_million: Decimal,
    pub cache_write_price_per_million: Decimal,
    pub cache_read_price_per_million: Decimal,
    pub effective_date: NaiveDate,
}

#[derive(Debug, Deserialize)]
struct PricingOverride {
    input_price_per_million: Decimal,
    output_price_per_million: Decimal,
    cache_write_price_per_million: Decimal,
    cache_read_price_per_million: Decimal,
    #[serde(default)]
    effective_date: Option<NaiveDate>,
}

type PricingTable = HashMap<String, HashMap<String, ModelPricing>>;

fn default_table() -> PricingTable {
    let effective_date = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap_or_default();
    let entry = |family: ModelFamily, input: i64, output: i64, write: i64, read: i64| {
        ModelPricing {
            model_id: family.pricing_key().to_string(),
            region: DEFAULT_PRICING_REGION.to_string(),
            input_price_per_million: Decimal::new(input, 2),
            output_price_per_million: Decimal::new(output, 2),
            cache_write_price_per_million: Decimal::new(write, 2),
            cache_read_price_per_million: Decimal::new(read, 2),
            effective_date,
        }
    };

    let models = [
        entry(ModelFamily::Opus45, 500, 2500, 625, 50),
        entry(ModelFamily::Sonnet45, 300, 1500, 375, 30),
        entry(ModelFamily::Haiku45, 100, 500, 125, 10),
    ];

    let mut table = HashMap::new();
    table.insert(
        DEFAULT_PRICING_REGION.to_string(),
        models.into_iter().map(|m| (m.model_id.clone(), m)).collect(),
    );
    table
}

/// Parse the `{region: {model: {...prices}}}` override document.
fn parse_table(raw: &str) -> anyhow::Result<PricingTable> {
    let doc: HashMap<String, HashMap<String, PricingOverride>> = serde_json::from_str(raw)?;
    let epoch = NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or_default();

    Ok(doc
        .into_iter()
        .map(|(region, models)| {
            let entries = models
                .into_iter()
                .map(|(model_id, p)| {
                    let pricing = ModelPricing {
                        model_id: model_id.clone(),
                        region: region.clone(),
                        input_price_per_million: p.input_price_per_million,
                        output_price_per_million: p.output_price_per_million,
                        cache_write_price_per_million: p.cache_write_price_per_million,
                        cache_read_price_per_million: p.cache_read_price_per_million,
                        effective_date: p.effective_date.unwrap_or(epoch),
                    };
                    (model_id, pricing)
                })
                .collect();
            (region, entries)
        })
        .collect())
}

fn load_table(raw: Option<&str>) -> PricingTable {
    match raw {
        Some(raw) => match parse_table(raw) {
            Ok(table) => table,
            Err(e) => {
                tracing::warn!(error = %e, "invalid {}, using default pricing", PRICING_ENV_VAR);
                default_table()
            }
        },
        None => default_table(),
    }
}

/// Shared, cheaply-cloneable pricing table.
#[derive(Clone)]
pub struct PricingConfig(Arc<RwLock<PricingTable>>);

impl PricingConfig {
    pub fn defaults() -> Self {
        Self(Arc::new(RwLock::new(default_table())))
    }

    /// Build from an override document; invalid JSON yields the defaults.
    pub fn from_json(raw: Option<&str>) -> Self {
        Self(Arc::new(RwLock::new(load_table(raw))))
    }

    pub fn load_from_env() -> Self {
        let raw = std::env::var(PRICING_ENV_VAR).ok();
        Self::from_json(raw.as_deref())
    }

    /// Re-read `PROXY_MODEL_PRICING` and swap the table in place.
    pub async fn reload(&self) {
        let raw = std::env::var(PRICING_ENV_VAR).ok();
        self.replace(raw.as_deref()).await;
    }

    pub async fn replace(&self, raw: Option<&str>) {
        let table = load_table(raw);
        *self.0.write().await = table;
        tracing::info!("model pricing reloaded");
    }

    /// Pricing for `model_id` in `region`; unknown regions use the default region.
    pub async fn get_pricing(&self, model_id: &str, region: &str) -> Option<ModelPricing> {
        let key = normalize_model_id(model_id);
        let table = self.0.read().await;
        table
            .get(region)
            .or_else(|| table.get(DEFAULT_PRICING_REGION))
            .and_then(|models| models.get(&key))
            .cloned()
    }

    pub async fn get_all_pricing(&self, region: &str) -> Vec<ModelPricing> {
        let table = self.0.read().await;
        let mut models: Vec<ModelPricing> = table
            .get(region)
            .or_else(|| table.get(DEFAULT_PRICING_REGION))
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();
        models.sort_by(|a, b| a.model_id.cmp(&b.model_id));
        models
    }
}
