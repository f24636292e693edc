use thiserror::Error;

#[derive(Debug, Error)]
pub enum KobzarError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Graph store error: {0}")]
    Graph(String),

    #[error("Queue error ({channel}): {reason}")]
    Queue { channel: String, reason: String },

    #[error("LLM provider error: {0}")]
    Provider(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, KobzarError>;
