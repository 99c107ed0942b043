use thiserror::Error;

#[derive(Error, Debug)]
pub enum SimError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Unknown security '{symbol}'")]
    UnknownSecurity { symbol: String },

    #[error("Simulation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type SimResult<T> = Result<T, SimError>;

pub(crate) fn invalid(msg: impl Into<String>) -> SimError {
    SimError::InvalidConfig(msg.into())
}
