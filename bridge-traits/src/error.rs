use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Bridge capability not available: {0}")]
    NotAvailable(String),

    #[error("Bridge operation failed: {0}")]
    OperationFailed(String),

    /// The request can never succeed as given (bad key, bad source path).
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// A checkpoint blob could not be decoded by the store that produced it.
    #[error("Invalid transfer checkpoint: {0}")]
    InvalidCheckpoint(String),

    /// The store is shutting down and no longer accepts new transfers.
    #[error("Object store is shutting down")]
    ShuttingDown,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Whether retrying the same operation later can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, BridgeError::OperationFailed(_) | BridgeError::Io(_))
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
