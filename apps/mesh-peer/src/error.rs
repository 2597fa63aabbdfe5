use mesh_protocol::{ErrorBody, ErrorCode, IdError, PeerId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("room is full: {0}")]
    RoomFull(String),
    #[error("duplicate connection to {0}")]
    DuplicateConnection(PeerId),
    #[error("transport error with {peer}: {reason}")]
    Transport { peer: PeerId, reason: String },
    #[error("presence channel disconnected: {0}")]
    ChannelDisconnected(String),
    #[error("media acquisition failed: {0}")]
    MediaAcquisition(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("session task failed: {0}")]
    Task(String),
}

impl SessionError {
    /// Errors that end the whole session rather than one peer's connection.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SessionError::Unauthorized(_) | SessionError::MediaAcquisition(_)
        )
    }

    pub fn from_body(body: ErrorBody) -> Self {
        match body.error {
            ErrorCode::Unauthorized => SessionError::Unauthorized(body.message),
            ErrorCode::NotFound => SessionError::NotFound(body.message),
            ErrorCode::InvalidArgument => SessionError::InvalidArgument(body.message),
            ErrorCode::RoomFull => SessionError::RoomFull(body.message),
            ErrorCode::Internal => SessionError::Protocol(body.message),
        }
    }
}

impl From<IdError> for SessionError {
    fn from(err: IdError) -> Self {
        SessionError::InvalidArgument(err.to_string())
    }
}

impl From<serde_json::Error> for SessionError {
    fn from(err: serde_json::Error) -> Self {
        SessionError::Protocol(err.to_string())
    }
}
