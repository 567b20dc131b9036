use thiserror::Error;

/// Failures raised by a [`crate::storage::KeyValueStore`] backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend could not be reached (connection refused, dropped, timed out).
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// The backend answered but rejected the command.
    #[error("store command failed: {0}")]
    Command(String),
}

impl StoreError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error()
            || err.is_connection_dropped()
            || err.is_connection_refusal()
            || err.is_timeout()
        {
            StoreError::Unavailable(err.to_string())
        } else {
            StoreError::Command(err.to_string())
        }
    }
}

/// Errors surfaced to the connection that triggered them.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("message store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("message store error: {0}")]
    Store(String),
    #[error("malformed message: {0}")]
    MalformedMessage(String),
    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
}

impl From<StoreError> for ChatError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(detail) => ChatError::StoreUnavailable(detail),
            StoreError::Command(detail) => ChatError::Store(detail),
        }
    }
}

impl ChatError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            ChatError::StoreUnavailable(_) => "store_unavailable",
            ChatError::Store(_) => "store_error",
            ChatError::MalformedMessage(_) => "malformed_message",
            ChatError::Encode(_) => "encode_error",
        }
    }

    /// Text for the error frame sent to the client. Store details stay in the
    /// server log.
    pub fn client_message(&self) -> String {
        match self {
            ChatError::StoreUnavailable(_) => "message store unavailable".to_string(),
            ChatError::Store(_) => "message store error".to_string(),
            ChatError::MalformedMessage(detail) => format!("malformed message: {detail}"),
            ChatError::Encode(_) => "internal error".to_string(),
        }
    }
}
