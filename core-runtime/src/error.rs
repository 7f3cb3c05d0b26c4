use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// A setting is missing, malformed or out of range.
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Logging setup failed: {0}")]
    Logging(String),
}

pub type Result<T> = std::result::Result<T, Error>;
