use chrono::{DateTime, Utc};

#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("embedding model unavailable: {0}")]
    EmbeddingUnavailable(String),

    #[error("vector index unavailable: {0}")]
    VectorIndexUnavailable(String),

    #[error("vector index timed out: {0}")]
    VectorIndexTimeout(String),

    #[error("search is temporarily unavailable")]
    SearchUnavailable,

    #[error("share code {0} not found")]
    ShareCodeNotFound(String),

    #[error("share code {code} expired at {expired_at}")]
    ShareCodeExpired {
        code: String,
        expired_at: DateTime<Utc>,
    },

    #[error("{0} not found")]
    NotFound(String),

    #[error("io error: {0:?}")]
    IO(#[from] std::io::Error),

    #[error("unexpected error: {0:?}")]
    Other(#[from] anyhow::Error),
}

impl AppError {
    /// Whether retrying the same operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::EmbeddingUnavailable(_)
                | AppError::VectorIndexUnavailable(_)
                | AppError::VectorIndexTimeout(_)
                | AppError::SearchUnavailable
                | AppError::IO(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(AppError::EmbeddingUnavailable("x".into()).is_retryable());
        assert!(AppError::VectorIndexTimeout("x".into()).is_retryable());
        assert!(AppError::VectorIndexUnavailable("x".into()).is_retryable());
        assert!(AppError::SearchUnavailable.is_retryable());

        assert!(!AppError::Validation("bad feed".into()).is_retryable());
        assert!(!AppError::ShareCodeNotFound("ABCD".into()).is_retryable());
        assert!(!AppError::NotFound("list".into()).is_retryable());
    }
}
