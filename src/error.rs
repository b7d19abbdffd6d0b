use thiserror::Error;

use crate::models::ElectionId;

/// Failure of a point-in-time results read.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("Not authorized to read results")]
    Unauthorized,

    #[error("Election {0} not found")]
    NotFound(ElectionId),

    #[error("Results service unavailable: {0}")]
    Unavailable(String),

    #[error("Malformed results payload: {0}")]
    Malformed(String),
}

impl FetchError {
    /// Whether offering the user a retry makes sense.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Unavailable(_) | FetchError::Malformed(_))
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        FetchError::Unavailable(e.to_string())
    }
}

/// Failure on the live channel. None of these ever reach consumer code;
/// they are contained by the channel task and surface only as state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("Channel rejected credentials: {0}")]
    Auth(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl From<serde_json::Error> for ChannelError {
    fn from(e: serde_json::Error) -> Self {
        ChannelError::Protocol(e.to_string())
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required setting {0}")]
    Missing(&'static str),

    #[error("Invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}
