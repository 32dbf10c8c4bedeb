//! Error types for the chat gateway.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    /// Spend guard blocked the request.
    #[error("budget exceeded: ${spend_usd:.2} >= ${limit_usd:.2}")]
    BudgetExceeded { limit_usd: f64, spend_usd: f64 },

    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    /// Permanent: the request itself is wrong.
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    /// Credentials rejected.
    #[error("unauthorized: {message}")]
    Unauthorized { message: String },

    /// Content policy refusal for this input.
    #[error("refused: {message}")]
    Refused { message: String },

    #[error("{provider} error: {message}")]
    Provider {
        provider: &'static str,
        message: String,
        retryable: bool,
    },

    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// Missing API key, unknown model, and similar.
    #[error("configuration error: {0}")]
    Config(String),
}

impl ProviderError {
    pub fn rate_limited(retry_after: Duration) -> Self {
        Self::RateLimited { retry_after }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized {
            message: message.into(),
        }
    }

    pub fn refused(message: impl Into<String>) -> Self {
        Self::Refused {
            message: message.into(),
        }
    }

    pub fn provider(provider: &'static str, message: impl Into<String>, retryable: bool) -> Self {
        Self::Provider {
            provider,
            message: message.into(),
            retryable,
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } | Self::Timeout(_) => true,
            Self::Provider { retryable, .. } => *retryable,
            Self::BudgetExceeded { .. }
            | Self::InvalidRequest { .. }
            | Self::Unauthorized { .. }
            | Self::Refused { .. }
            | Self::Config(_) => false,
        }
    }

    /// Errors that will fail every request the same way, not just this one.
    pub fn is_systemic(&self) -> bool {
        matches!(
            self,
            Self::BudgetExceeded { .. }
                | Self::InvalidRequest { .. }
                | Self::Unauthorized { .. }
                | Self::Config(_)
        )
    }
}
