//! relay-llm: an OpenAI-compatible gateway in front of many model
//! providers, with routing, response normalization, caching, usage
//! accounting, and credit billing.

pub mod cache;
pub mod catalog;
pub mod config;
pub mod costing;
pub mod credentials;
mod error;
pub mod http;
pub mod memory_store;
pub mod observability;
pub mod providers;
pub mod router;
pub mod sqlite_store;
pub mod sse;
pub mod store;
pub mod streaming;
pub mod token_count;
pub mod topup;
pub mod types;
pub mod worker;

pub use error::{FailureCode, GatewayError, RequestFailure, Result};
pub use http::{router as http_router, GatewayState};
pub use types::{
    ChatCompletionRequest, ChatMessage, FinishReason, MessageContent, NormalizedResponse,
    TokenUsage, ToolCall,
};
