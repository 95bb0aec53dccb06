//! Stratum v1 error types.

use thiserror::Error;
use tokio_util::codec::LinesCodecError;

#[derive(Error, Debug)]
pub enum StratumError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid pool URL: {0}")]
    InvalidUrl(String),

    #[error("disconnected from pool")]
    Disconnected,

    #[error("timed out waiting for pool")]
    Timeout,

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("subscription failed: {0}")]
    SubscriptionFailed(String),

    #[error("authorization failed: {0}")]
    AuthorizationFailed(String),

    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
}

impl From<LinesCodecError> for StratumError {
    fn from(err: LinesCodecError) -> Self {
        match err {
            LinesCodecError::Io(e) => StratumError::Io(e),
            LinesCodecError::MaxLineLengthExceeded => {
                StratumError::InvalidMessage("line exceeds maximum length".to_string())
            }
        }
    }
}

pub type StratumResult<T> = Result<T, StratumError>;
