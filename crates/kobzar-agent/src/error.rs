use thiserror::Error;

/// Failures inside one pipeline stage. Workers log these and keep consuming —
/// a stage error never takes the process down.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("graph error: {0}")]
    Graph(#[from] kobzar_graph::GraphError),

    #[error("provider error: {0}")]
    Provider(#[from] kobzar_llm::ProviderError),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("rejected: {0}")]
    Rejected(String),

    #[error("missing: {0}")]
    Missing(String),

    #[error("queue error: {0}")]
    Queue(#[from] kobzar_bus::BusError),
}

pub type Result<T> = std::result::Result<T, StageError>;
