use thiserror::Error;

/// Failures inside the conversation context manager and its collaborators.
///
/// None of these are fatal to a conversation: persistence failures leave the
/// in-memory state authoritative and summarization failures fall back to
/// truncation.
#[derive(Debug, Error)]
pub enum ContextError {
    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Summarization error: {0}")]
    Summarization(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid {field}: {reason}")]
    InvalidConfig { field: &'static str, reason: String },
}
