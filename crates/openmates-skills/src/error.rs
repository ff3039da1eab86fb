use openmates_core::error::CoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SkillError {
    #[error("manifest error in {path}: {message}")]
    Manifest { path: String, message: String },
    #[error("unknown skill {app_id}.{skill_id}")]
    UnknownSkill { app_id: String, skill_id: String },
    #[error("arguments failed schema validation: {0}")]
    InvalidArgs(String),
    #[error("skill {app_id}.{skill_id} timed out after {timeout_secs}s")]
    Timeout { app_id: String, skill_id: String, timeout_secs: u64 },
    #[error("queued skill deadline exceeded")]
    QueueDeadline,
    #[error("skill execution failed: {0}")]
    Execution(String),
    #[error("cancelled")]
    Cancelled,
}

impl SkillError {
    pub fn code(&self) -> &'static str {
        match self {
            SkillError::Manifest { .. } => "CONFIG",
            SkillError::UnknownSkill { .. } => "INVALID_ARGS",
            SkillError::InvalidArgs(_) => "INVALID_ARGS",
            SkillError::Timeout { .. } => "TRANSIENT",
            SkillError::QueueDeadline => "TRANSIENT",
            SkillError::Execution(_) => "INTERNAL",
            SkillError::Cancelled => "CANCELLED",
        }
    }
}

impl From<&SkillError> for CoreError {
    fn from(e: &SkillError) -> Self {
        match e {
            SkillError::Manifest { message, .. } => CoreError::Config(message.clone()),
            SkillError::UnknownSkill { .. } | SkillError::InvalidArgs(_) => CoreError::InvalidArgs(e.to_string()),
            SkillError::Timeout { .. } | SkillError::QueueDeadline => CoreError::Transient(e.to_string()),
            SkillError::Execution(msg) => CoreError::Internal(msg.clone()),
            SkillError::Cancelled => CoreError::Cancelled,
        }
    }
}

pub type Result<T> = std::result::Result<T, SkillError>;
