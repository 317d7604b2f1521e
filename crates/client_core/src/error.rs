use shared::error::{ApiError, ErrorCode};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    /// The server, or local validation mirroring it, rejected the call.
    #[error("{:?}: {}", .0.code, .0.message)]
    Api(ApiError),
    #[error("http transport failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("realtime transport failed: {0}")]
    Realtime(String),
    #[error("malformed payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("invalid server url: {0}")]
    Url(#[from] url::ParseError),
    #[error("view is closed")]
    Closed,
}

impl ClientError {
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            ClientError::Api(err) => Some(err.code),
            _ => None,
        }
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            ClientError::Api(err) => err.retry_after_secs,
            _ => None,
        }
    }
}

impl From<ApiError> for ClientError {
    fn from(err: ApiError) -> Self {
        ClientError::Api(err)
    }
}

pub type ClientResult<T> = Result<T, ClientError>;
