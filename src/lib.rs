//! Workspace umbrella crate.
//!
//! Exposes the feature flags that map to the individual workspace crates.
//! Host applications can depend on `media-relay-workspace` and enable the
//! documented features without wiring each crate individually.

#[cfg(feature = "desktop-shims")]
pub use core_service::*;
