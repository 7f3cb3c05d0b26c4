//! Runtime handles re-exported from tokio.

pub use tokio::runtime::{Builder, Handle, Runtime};
