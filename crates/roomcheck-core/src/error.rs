use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Image could not be decoded: {0}")]
    Decode(String),

    #[error("Model backend unavailable: {0}")]
    ModelUnavailable(String),

    #[error("Unsupported document format: {0}")]
    UnsupportedFormat(String),

    #[error("Policy document yielded no usable rule fragments")]
    EmptyDocument,

    #[error("Reasoning backend failed: {0}")]
    ReasoningBackend(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Index store failed: {0}")]
    Store(String),
}

impl Error {
    /// Only an unreachable model backend is worth retrying; everything else is final.
    pub fn is_retryable(&self) -> bool { matches!(self, Self::ModelUnavailable(_)) }
}

pub type Result<T> = std::result::Result<T, Error>;
