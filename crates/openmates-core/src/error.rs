use thiserror::Error;

/// The structured error taxonomy shared by every component (SPEC_FULL.md §7).
///
/// Every crate-local error type should eventually map onto one of these kinds via
/// `From`; the orchestrator is the only place that turns a kind into a user-visible
/// event.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("transient error: {0}")]
    Transient(String),

    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    #[error("insufficient credits: need {need}, have {have}")]
    InsufficientCredits { need: u64, have: u64 },

    #[error("provider error: {0}")]
    ProviderError(String),

    #[error("cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Short code sent to the edge as `task_failed{kind: ...}` (SPEC_FULL.md §7).
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Config(_) => "CONFIG",
            CoreError::Auth(_) => "AUTH",
            CoreError::Transient(_) => "TRANSIENT",
            CoreError::InvalidArgs(_) => "INVALID_ARGS",
            CoreError::InsufficientCredits { .. } => "INSUFFICIENT_CREDITS",
            CoreError::ProviderError(_) => "PROVIDER_ERROR",
            CoreError::Cancelled => "CANCELLED",
            CoreError::Internal(_) => "INTERNAL",
        }
    }

    /// Whether retrying this error with backoff is ever sensible (§7: TRANSIENT only).
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::Transient(_))
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_taxonomy() {
        assert_eq!(CoreError::Config("x".into()).code(), "CONFIG");
        assert_eq!(CoreError::InsufficientCredits { need: 1, have: 0 }.code(), "INSUFFICIENT_CREDITS");
        assert!(CoreError::Transient("x".into()).is_retryable());
        assert!(!CoreError::Auth("x".into()).is_retryable());
    }
}
