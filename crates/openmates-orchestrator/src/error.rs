use openmates_core::error::CoreError;
use openmates_pipeline::PipelineError;
use openmates_skills::SkillError;
use openmates_transit::TransitError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RecordStoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("record store error: {0}")]
    Store(#[from] RecordStoreError),
    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
    #[error("skill error: {0}")]
    Skill(#[from] SkillError),
    #[error("vault error: {0}")]
    Transit(#[from] TransitError),
    #[error("insufficient credits: need {need}, have {have}")]
    InsufficientCredits { need: i64, have: i64 },
    #[error("task {0} is already being processed")]
    AlreadyInFlight(String),
    #[error("task {0} has already completed")]
    AlreadyProcessed(String),
    #[error("cancelled")]
    Cancelled,
    #[error("task exceeded wall-clock budget of {0}s")]
    TaskTimeout(u64),
}

impl OrchestratorError {
    pub fn code(&self) -> &'static str {
        match self {
            OrchestratorError::Store(_) => "INTERNAL",
            OrchestratorError::Pipeline(e) => e.code(),
            OrchestratorError::Skill(e) => e.code(),
            OrchestratorError::Transit(_) => "TRANSIENT",
            OrchestratorError::InsufficientCredits { .. } => "INSUFFICIENT_CREDITS",
            OrchestratorError::AlreadyInFlight(_) => "ALREADY_IN_FLIGHT",
            OrchestratorError::AlreadyProcessed(_) => "ALREADY_PROCESSED",
            OrchestratorError::Cancelled => "CANCELLED",
            OrchestratorError::TaskTimeout(_) => "TIMEOUT",
        }
    }
}

impl From<&OrchestratorError> for CoreError {
    fn from(e: &OrchestratorError) -> Self {
        match e {
            OrchestratorError::Store(s) => CoreError::Internal(s.to_string()),
            OrchestratorError::Pipeline(p) => CoreError::from(p),
            OrchestratorError::Skill(s) => CoreError::from(s),
            OrchestratorError::Transit(t) => CoreError::from(t),
            OrchestratorError::InsufficientCredits { need, have } => {
                CoreError::InsufficientCredits { need: (*need).max(0) as u64, have: (*have).max(0) as u64 }
            }
            OrchestratorError::AlreadyInFlight(msg) => CoreError::InvalidArgs(msg.clone()),
            OrchestratorError::AlreadyProcessed(msg) => CoreError::InvalidArgs(msg.clone()),
            OrchestratorError::Cancelled => CoreError::Cancelled,
            OrchestratorError::TaskTimeout(secs) => {
                CoreError::Transient(format!("task exceeded wall-clock budget of {secs}s"))
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
pub type StoreResult<T> = std::result::Result<T, RecordStoreError>;
