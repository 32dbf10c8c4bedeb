//! Chat-completion contract consumed by [`crate::classifier::ChatClassifier`].
//!
//! Only the request/response/error surface lives here. Concrete provider
//! clients are supplied by the embedding application.

pub mod error;
pub mod types;

pub use error::ProviderError;
pub use types::*;

#[async_trait::async_trait]
pub trait ChatGateway: Send + Sync {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError>;
}
