use async_trait::async_trait;
use thiserror::Error;

use crate::types::{AnalysisResult, Article};

/// Typed failure from the analysis service, split into retryable transport
/// conditions and terminal ones. Retry happens inside the client; by the
/// time a caller sees one of these the retry budget is spent.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AnalysisError {
    #[error("request timed out")]
    Timeout,

    #[error("rate limited by the analysis service")]
    RateLimited,

    #[error("server error (status {0})")]
    Server(u16),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("quota exhausted")]
    QuotaExhausted,

    #[error("malformed response: {0}")]
    Malformed(String),
}

impl AnalysisError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::RateLimited | Self::Server(_))
    }
}

/// Pure request/response adapter over the external analysis service.
/// Implementations never touch the store; the caller owns persistence.
#[async_trait]
pub trait Analyzer: Send + Sync {
    fn name(&self) -> &str;

    /// Produce summary, sentiment, topics, entities and an embedding for
    /// one article's extracted text.
    async fn analyze(&self, article: &Article) -> std::result::Result<AnalysisResult, AnalysisError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(AnalysisError::Timeout.is_retryable());
        assert!(AnalysisError::RateLimited.is_retryable());
        assert!(AnalysisError::Server(503).is_retryable());
        assert!(!AnalysisError::InvalidInput("empty".to_string()).is_retryable());
        assert!(!AnalysisError::QuotaExhausted.is_retryable());
        assert!(!AnalysisError::Malformed("bad json".to_string()).is_retryable());
    }
}
