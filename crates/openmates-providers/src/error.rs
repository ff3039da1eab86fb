use thiserror::Error;

/// Grounded on `skynet-agent/src/provider.rs::ProviderError`, extended with the
/// cancellation/timeout cases the orchestrator's per-call timeout budget needs.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("api error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("parse error: {0}")]
    Parse(String),

    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("timed out after {0}s")]
    Timeout(u64),
}

impl ProviderError {
    /// §7: 4xx are permanent, 5xx/timeout/network are retryable (TRANSIENT).
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::Http(_) | ProviderError::Unavailable(_) | ProviderError::Timeout(_) => true,
            ProviderError::RateLimited { .. } => true,
            ProviderError::Api { status, .. } => *status >= 500,
            ProviderError::Parse(_) | ProviderError::Cancelled => false,
        }
    }
}

impl From<&ProviderError> for openmates_core::error::CoreError {
    fn from(e: &ProviderError) -> Self {
        use openmates_core::error::CoreError;
        if e.is_retryable() {
            CoreError::Transient(e.to_string())
        } else if matches!(e, ProviderError::Cancelled) {
            CoreError::Cancelled
        } else {
            CoreError::ProviderError(e.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, ProviderError>;
