use openmates_core::error::CoreError;
use openmates_transit::TransitError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("transit error: {0}")]
    Transit(#[from] TransitError),
    #[error("encryption of a required usage field produced an empty ciphertext")]
    EncryptionFailed,
}

impl LedgerError {
    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::Transit(_) => "TRANSIENT",
            LedgerError::EncryptionFailed => "INTERNAL",
        }
    }
}

impl From<&LedgerError> for CoreError {
    fn from(e: &LedgerError) -> Self {
        match e {
            LedgerError::Transit(t) => CoreError::Transient(t.to_string()),
            LedgerError::EncryptionFailed => CoreError::Internal("usage entry encryption failed".to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;
