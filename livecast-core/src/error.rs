use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Authorization error: {0}")]
    Authorization(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<jsonwebtoken::errors::Error> for Error {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;

        match err.kind() {
            ErrorKind::ExpiredSignature => Self::Authentication("Token expired".to_string()),
            ErrorKind::InvalidIssuer => Self::Authentication("Token issuer mismatch".to_string()),
            ErrorKind::InvalidSignature => {
                Self::Authentication("Token signature invalid".to_string())
            }
            _ => Self::Authentication(format!("Invalid token: {err}")),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
