use bridge_traits::BridgeError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum UploadError {
    /// The sidecar marker for one file could not be read or written.
    #[error("Marker I/O failed for {media_name}: {source}")]
    MarkerIo {
        media_name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid media name '{name}': {reason}")]
    InvalidMediaName { name: String, reason: String },

    #[error("Object store error: {0}")]
    Store(#[from] BridgeError),

    #[error("No free version slot for {key} after {attempts} attempts")]
    VersionsExhausted { key: String, attempts: u32 },

    #[error("Upload engine is shutting down")]
    ShuttingDown,
}

impl UploadError {
    pub(crate) fn marker_io(media_name: &str, source: std::io::Error) -> Self {
        UploadError::MarkerIo {
            media_name: media_name.to_string(),
            source,
        }
    }

    /// Whether the scheduler should try this file again later.
    pub fn is_retryable(&self) -> bool {
        match self {
            UploadError::Store(e) => e.is_transient(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, UploadError>;
