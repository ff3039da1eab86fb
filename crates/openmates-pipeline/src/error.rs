use openmates_core::error::CoreError;
use openmates_providers::ProviderError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("preprocess failed: {0}")]
    PreprocessFailed(String),
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("main stage exceeded {0} tool rounds without a final answer")]
    ToolRoundsExhausted(u32),
    #[error("cancelled")]
    Cancelled,
}

impl PipelineError {
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::PreprocessFailed(_) => "PREPROCESS_FAILED",
            PipelineError::Provider(e) if e.is_retryable() => "TRANSIENT",
            PipelineError::Provider(_) => "PROVIDER_ERROR",
            PipelineError::ToolRoundsExhausted(_) => "INTERNAL",
            PipelineError::Cancelled => "CANCELLED",
        }
    }
}

impl From<&PipelineError> for CoreError {
    fn from(e: &PipelineError) -> Self {
        match e {
            PipelineError::PreprocessFailed(msg) => CoreError::Internal(format!("PREPROCESS_FAILED: {msg}")),
            PipelineError::Provider(pe) => CoreError::from(pe),
            PipelineError::ToolRoundsExhausted(n) => CoreError::Internal(format!("exhausted {n} tool rounds")),
            PipelineError::Cancelled => CoreError::Cancelled,
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
