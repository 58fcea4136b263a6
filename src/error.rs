use std::time::Duration;

/// Result type for chat operations
pub type ChatResult<T> = Result<T, ChatError>;

/// Failures of the underlying transport (open, send or receive)
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("failed to open connection: {0}")]
    Open(String),

    #[error("failed to send frame: {0}")]
    Send(String),

    #[error("failed to receive frame: {0}")]
    Receive(String),
}

/// Errors returned by the connection manager
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("websocket is not connected")]
    NotConnected,

    #[error("server unreachable after {0} reconnect attempts")]
    ExhaustedRetries(u32),

    #[error("failed to send message: {0}")]
    SendFailed(String),
}

/// Conversation-level errors
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("server returned error {code}: {message}")]
    Protocol { code: i64, message: String },

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error(transparent)]
    Document(#[from] crate::document::DocumentError),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),
}
