use thiserror::Error;

pub type Result<T> = std::result::Result<T, ChatError>;

/// Every failure the chat core can report.
///
/// None of these are fatal to the process: the session turns them into an
/// error-marked reply, an error banner, or a plain `Err` for the caller of
/// that one operation.
#[derive(Debug, Error)]
pub enum ChatError {
    /// Missing credential or a remote session that could not be created.
    #[error("{0}")]
    Initialization(String),

    /// Network or HTTP failure while talking to the model API.
    #[error("{0}")]
    Transport(String),

    /// The API answered but refused or failed to produce a reply.
    #[error("{0}")]
    Model(String),

    /// Persisted conversation payload is structurally invalid.
    #[error("saved conversation is unreadable: {0}")]
    Deserialization(String),

    /// Image generation returned nothing usable.
    #[error("image generation failed: {0}")]
    Generation(String),

    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl From<reqwest::Error> for ChatError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ChatError::Transport("request timed out".to_string())
        } else {
            ChatError::Transport(err.to_string())
        }
    }
}
