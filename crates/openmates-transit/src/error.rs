use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransitError {
    #[error("vault http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("vault returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("secret not found: {0}")]
    SecretNotFound(String),

    #[error("ciphertext uses an unrecognized scheme (missing `vault:` prefix)")]
    WrongScheme,

    #[error("no vault token available")]
    NoToken,

    #[error("io error reading token file: {0}")]
    Io(#[from] std::io::Error),
}

impl From<&TransitError> for openmates_core::error::CoreError {
    fn from(e: &TransitError) -> Self {
        use openmates_core::error::CoreError;
        match e {
            TransitError::Http(_) => CoreError::Transient(e.to_string()),
            TransitError::Api { status, message } if *status >= 500 => {
                CoreError::Transient(message.clone())
            }
            TransitError::Api { message, .. } => CoreError::Auth(message.clone()),
            TransitError::SecretNotFound(k) => CoreError::Config(format!("missing secret: {k}")),
            TransitError::WrongScheme => CoreError::Internal(e.to_string()),
            TransitError::NoToken => CoreError::Auth(e.to_string()),
            TransitError::Io(err) => CoreError::Config(err.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, TransitError>;
