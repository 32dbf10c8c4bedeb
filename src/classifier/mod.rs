//! The classifier seam: an opaque, slow, fallible external service.

pub mod chat;
pub mod retry;

use std::time::Duration;

use async_trait::async_trait;

use crate::gateway::ProviderError;
use crate::ledger::{Detected, Outcome};
use crate::source::Category;

pub use chat::{parse_classification, ChatClassifier};
pub use retry::RetryPolicy;

/// One classifier verdict for one (text, category).
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub detected: Detected,
    pub confidence: Option<f64>,
    pub raw_output: String,
    /// Set when the service answered but could not classify this input.
    pub error: Option<String>,
}

impl Classification {
    pub fn new(detected: Detected, confidence: Option<f64>) -> Self {
        Self {
            detected,
            confidence,
            raw_output: String::new(),
            error: None,
        }
    }

    pub fn into_outcome(self) -> Outcome {
        let outcome = Outcome::new(self.detected)
            .maybe_confidence(self.confidence)
            .raw_output(self.raw_output);
        match self.error {
            Some(error) => outcome.error(error),
            None => outcome,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Affects this call only; retry, then record against the item.
    Transient,
    /// Will fail every item; abort the run.
    Systemic,
}

#[derive(Debug, thiserror::Error)]
pub enum ClassifierError {
    #[error("classifier timed out after {0:?}")]
    Timeout(Duration),
    #[error("malformed classifier output: {0}")]
    Malformed(String),
    #[error("classifier rate limited: {0}")]
    RateLimited(String),
    #[error("classifier unavailable: {0}")]
    Unavailable(String),
    /// The service declined this input; asking again will not help.
    #[error("classifier rejected input: {0}")]
    Rejected(String),
    #[error("classifier authentication failed: {0}")]
    Auth(String),
    #[error("classifier misconfigured: {0}")]
    Config(String),
}

impl ClassifierError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Timeout(_)
            | Self::Malformed(_)
            | Self::RateLimited(_)
            | Self::Unavailable(_)
            | Self::Rejected(_) => ErrorKind::Transient,
            Self::Auth(_) | Self::Config(_) => ErrorKind::Systemic,
        }
    }

    pub fn is_systemic(&self) -> bool {
        self.kind() == ErrorKind::Systemic
    }

    /// Whether another attempt at the same input could succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Rejected(_)) && !self.is_systemic()
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "timeout",
            Self::Malformed(_) => "malformed_output",
            Self::RateLimited(_) => "rate_limited",
            Self::Unavailable(_) => "unavailable",
            Self::Rejected(_) => "rejected",
            Self::Auth(_) => "auth",
            Self::Config(_) => "config",
        }
    }
}

impl From<ProviderError> for ClassifierError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Unauthorized { message, .. } => Self::Auth(message),
            ProviderError::RateLimited { .. } => Self::RateLimited(err.to_string()),
            ProviderError::Timeout(after) => Self::Timeout(after),
            e if e.is_systemic() => Self::Config(e.to_string()),
            e if !e.is_retryable() => Self::Rejected(e.to_string()),
            e => Self::Unavailable(e.to_string()),
        }
    }
}

#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(
        &self,
        text: &str,
        category: &Category,
    ) -> Result<Classification, ClassifierError>;
}

/// Call `classifier` under a per-attempt timeout, retrying transient failures
/// according to `policy`. Systemic and rejected inputs return immediately.
pub async fn classify_with_policy(
    classifier: &dyn Classifier,
    text: &str,
    category: &Category,
    policy: &RetryPolicy,
    timeout: Duration,
) -> Result<Classification, ClassifierError> {
    policy
        .run(|attempt| async move {
            tracing::debug!(category = %category, attempt, "classifier call");
            match tokio::time::timeout(timeout, classifier.classify(text, category)).await {
                Ok(result) => result,
                Err(_) => Err(ClassifierError::Timeout(timeout)),
            }
        })
        .await
}
