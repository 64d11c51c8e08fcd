/// Error types for the chat client
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Not connected to message bus")]
    NotConnected,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Malformed payload: {0}")]
    Malformed(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Message is empty")]
    EmptyMessage,

    #[error("Missing recipient id")]
    MissingRecipient,

    #[error("No conversation open: {0}")]
    NoConversation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Timeout error: {0}")]
    Timeout(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),
}

impl ChatError {
    /// Fixed user-facing string for an operation failure
    pub fn user_message(&self) -> &'static str {
        match self {
            ChatError::EmptyMessage => "Message cannot be empty",
            ChatError::MissingRecipient => "Cannot tell who this message is for.",
            ChatError::NoConversation(_) => "Open a conversation first.",
            ChatError::Validation(_) => "Please check your input and try again.",
            ChatError::NotConnected => "Not connected. Please wait while we reconnect.",
            ChatError::Unauthorized(_) | ChatError::NotAuthenticated => {
                "Your session has expired. Please sign in again."
            }
            ChatError::Unsupported(_) => "This feature is not available yet.",
            _ => "Something went wrong. Please try again.",
        }
    }
}

pub type Result<T> = std::result::Result<T, ChatError>;
