#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parse failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("rate limited")]
    RateLimited,

    #[error("provider unavailable")]
    Unavailable,

    #[error("empty response from {provider}")]
    EmptyResponse { provider: String },

    #[error("SSE parse error: {0}")]
    SseParse(String),

    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("embedding not supported by {provider}")]
    EmbedUnsupported { provider: String },

    #[error("{0}")]
    Other(String),
}

impl LlmError {
    /// Whether a retry with backoff has a reasonable chance of succeeding.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Self::RateLimited
            | Self::Unavailable
            | Self::Timeout(_)
            | Self::EmptyResponse { .. } => true,
            Self::Json(_) | Self::SseParse(_) | Self::EmbedUnsupported { .. } | Self::Other(_) => {
                false
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, LlmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limited_is_transient() {
        assert!(LlmError::RateLimited.is_transient());
        assert!(LlmError::Unavailable.is_transient());
        assert!(LlmError::Timeout(std::time::Duration::from_secs(3)).is_transient());
    }

    #[test]
    fn unsupported_embedding_is_permanent() {
        let err = LlmError::EmbedUnsupported {
            provider: "mock".into(),
        };
        assert!(!err.is_transient());
        assert_eq!(err.to_string(), "embedding not supported by mock");
    }
}
