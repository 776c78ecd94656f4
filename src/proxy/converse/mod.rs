//! Anthropic Messages ⇄ Bedrock Converse translation.

pub mod eventstream;
pub mod request;
pub mod response;
pub mod stream;

pub use request::build_converse_request;
pub use response::parse_converse_response;
pub use stream::{translate_converse_stream, ConverseStreamTranslator};
