pub mod buckets;
pub mod cost;
pub mod entities;
pub mod error_type;
pub mod messages;
pub mod pricing;
