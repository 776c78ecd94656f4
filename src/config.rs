use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context;

pub const DEFAULT_PLAN_API_URL: &str = "https://api.anthropic.com";
pub const DEFAULT_BEDROCK_REGION: &str = "ap-northeast-2";
pub const DEFAULT_BEDROCK_MODEL: &str = "global.anthropic.claude-sonnet-4-5-20250929-v1:0";

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub database_url: String,
    pub environment: String,
    pub admin_key: Option<String>,

    pub plan_api_url: String,
    pub plan_api_key: Option<String>,

    pub key_hasher_secret: String,
    /// Falls back to `key_hasher_secret` when unset.
    pub local_encryption_key: Option<String>,

    pub access_key_cache_ttl: Duration,
    pub bedrock_key_cache_ttl: Duration,
    pub budget_cache_ttl: Duration,
    pub model_mapping_cache_ttl: Duration,

    pub circuit_failure_threshold: u32,
    pub circuit_failure_window: Duration,
    pub circuit_reset_timeout: Duration,

    pub http_connect_timeout: Duration,
    pub http_read_timeout: Duration,

    pub bedrock_region: String,
    pub bedrock_default_model: String,
    /// Requested model name → Bedrock model id, from `PROXY_BEDROCK_MODEL_MAPPING`.
    pub bedrock_model_mapping: HashMap<String, String>,
    /// Overrides `https://bedrock-runtime.{region}.amazonaws.com`.
    pub bedrock_endpoint: Option<String>,
}

impl Config {
    /// Key material for the Bedrock credential cipher.
    pub fn encryption_key(&self) -> &str {
        self.local_encryption_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .unwrap_or(&self.key_hasher_secret)
    }

    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8000,
            database_url: "postgres://localhost/plan_proxy".into(),
            environment: "dev".into(),
            admin_key: None,
            plan_api_url: DEFAULT_PLAN_API_URL.into(),
            plan_api_key: None,
            key_hasher_secret: String::new(),
            local_encryption_key: None,
            access_key_cache_ttl: Duration::from_secs(60),
            bedrock_key_cache_ttl: Duration::from_secs(300),
            budget_cache_ttl: Duration::from_secs(60),
            model_mapping_cache_ttl: Duration::from_secs(60),
            circuit_failure_threshold: 3,
            circuit_failure_window: Duration::from_secs(60),
            circuit_reset_timeout: Duration::from_secs(1800),
            http_connect_timeout: Duration::from_secs(5),
            http_read_timeout: Duration::from_secs(300),
            bedrock_region: DEFAULT_BEDROCK_REGION.into(),
            bedrock_default_model: DEFAULT_BEDROCK_MODEL.into(),
            bedrock_model_mapping: HashMap::new(),
            bedrock_endpoint: None,
        }
    }
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_secs(name: &str, default: u64) -> Duration {
    Duration::from_secs(
        env_opt(name)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default),
    )
}

pub fn load() -> anyhow::Result<Config> {
    dotenvy::dotenv().ok();

    let defaults = Config::default();

    let environment = env_opt("PROXY_ENVIRONMENT").unwrap_or(defaults.environment);
    let key_hasher_secret = env_opt("PROXY_KEY_HASHER_SECRET").unwrap_or_default();

    if key_hasher_secret.is_empty() {
        if environment == "production" {
            anyhow::bail!(
                "PROXY_KEY_HASHER_SECRET is empty. \
                 Set a strong secret before running in production."
            );
        }
        tracing::warn!("PROXY_KEY_HASHER_SECRET is not set; access key hashes are not secret");
    }

    let plan_api_url = env_opt("PROXY_PLAN_API_URL").unwrap_or(defaults.plan_api_url);
    url::Url::parse(&plan_api_url)
        .with_context(|| format!("PROXY_PLAN_API_URL is not a valid URL: {}", plan_api_url))?;

    let bedrock_model_mapping = match env_opt("PROXY_BEDROCK_MODEL_MAPPING") {
        Some(raw) => serde_json::from_str::<HashMap<String, String>>(&raw)
            .context("PROXY_BEDROCK_MODEL_MAPPING must be a JSON object of strings")?,
        None => HashMap::new(),
    };

    Ok(Config {
        port: env_opt("PROXY_PORT")
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.port),
        database_url: env_opt("PROXY_DATABASE_URL")
            .or_else(|| env_opt("DATABASE_URL"))
            .unwrap_or(defaults.database_url),
        environment,
        admin_key: env_opt("PROXY_ADMIN_KEY"),
        plan_api_url,
        plan_api_key: env_opt("PROXY_PLAN_API_KEY"),
        key_hasher_secret,
        local_encryption_key: env_opt("PROXY_LOCAL_ENCRYPTION_KEY"),
        access_key_cache_ttl: env_secs("PROXY_ACCESS_KEY_CACHE_TTL", 60),
        bedrock_key_cache_ttl: env_secs("PROXY_BEDROCK_KEY_CACHE_TTL", 300),
        budget_cache_ttl: env_secs("PROXY_BUDGET_CACHE_TTL", 60),
        model_mapping_cache_ttl: env_secs("PROXY_MODEL_MAPPING_CACHE_TTL", 60),
        circuit_failure_threshold: env_opt("PROXY_CIRCUIT_FAILURE_THRESHOLD")
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.circuit_failure_threshold),
        circuit_failure_window: env_secs("PROXY_CIRCUIT_FAILURE_WINDOW", 60),
        circuit_reset_timeout: env_secs("PROXY_CIRCUIT_RESET_TIMEOUT", 1800),
        http_connect_timeout: env_secs("PROXY_HTTP_CONNECT_TIMEOUT", 5),
        http_read_timeout: env_secs("PROXY_HTTP_READ_TIMEOUT", 300),
        bedrock_region: env_opt("PROXY_BEDROCK_REGION").unwrap_or(defaults.bedrock_region),
        bedrock_default_model: env_opt("PROXY_BEDROCK_DEFAULT_MODEL")
            .unwrap_or(defaults.bedrock_default_model),
        bedrock_model_mapping,
        bedrock_endpoint: env_opt("PROXY_BEDROCK_ENDPOINT"),
    })
}
