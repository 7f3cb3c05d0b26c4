//! # Core Runtime Module
//!
//! Ambient infrastructure shared by the upload engine and its host facade:
//! - Configuration (`UploadConfig`, property loading, validation)
//! - Logging and tracing setup
//! - The typed event bus
//!
//! ## Overview
//!
//! Nothing here knows how uploads work. `core-upload` consumes the
//! configuration and publishes on the bus; `core-service` wires both up at
//! startup.

pub mod config;
pub mod error;
pub mod events;
pub mod logging;

pub use config::{Credentials, NamingPolicy, RetryPolicy, UploadConfig, UploadConfigBuilder};
pub use error::{Error, Result};
pub use events::{AbandonReason, CoreEvent, EventBus, LifecycleEvent, UploadEvent};
