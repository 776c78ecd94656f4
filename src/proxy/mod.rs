pub mod adapter;
pub mod auth;
pub mod bedrock;
pub mod budget;
pub mod circuit_breaker;
pub mod context;
pub mod converse;
pub mod handler;
pub mod model_mapping;
pub mod plan;
pub mod router;
pub mod stream_bridge;
pub mod streaming_usage;
pub mod thinking;
pub mod upstream;
pub mod usage;
