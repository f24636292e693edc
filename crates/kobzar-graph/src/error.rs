use thiserror::Error;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Query rejected: {0}")]
    Rejected(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Ambiguous: {0}")]
    Ambiguous(String),
}

impl GraphError {
    /// Whether a retry at the call site can plausibly succeed.
    /// Connection-level failures are transient; everything else is not.
    pub fn is_transient(&self) -> bool {
        match self {
            GraphError::Redis(e) => {
                e.is_io_error() || e.is_timeout() || e.is_connection_dropped()
            }
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, GraphError>;
