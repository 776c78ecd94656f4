use uuid::Uuid;

use crate::models::entities::RoutingStrategy;

/// Per-request identity resolved from the access key in the URL.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub user_id: Uuid,
    pub access_key_id: Uuid,
    pub access_key_prefix: String,
    pub bedrock_region: String,
    pub bedrock_model: String,
    pub has_bedrock_key: bool,
    pub routing_strategy: RoutingStrategy,
}

/// `req_` followed by 16 hex characters.
pub fn new_request_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("req_{}", &id[..16])
}
