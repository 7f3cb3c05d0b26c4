//! Async runtime layer for Media Relay.
//!
//! Every other crate in the workspace depends on this crate instead of
//! depending on tokio directly. Besides the thin runtime re-exports it
//! provides the three scheduling primitives the upload engine is built on.
//!
//! # Modules
//!
//! - `task`: Task spawning
//! - `time`: Sleep, timeouts and instants
//! - `sync`: Locks, channels and cancellation tokens
//! - `fs` / `io`: Async filesystem and I/O traits
//! - `runtime`: Runtime handles
//! - `timer`: Per-key cancellable delayed-task bookkeeping ([`KeyedTimers`])
//! - `throttle`: Coalescing rate limiter ([`Throttle`])
//! - `worker`: Sequential background job queue ([`WorkQueue`])
//!
//! # Examples
//!
//! ```rust
//! use core_async::task;
//! use core_async::time::{sleep, Duration};
//!
//! async fn example() {
//!     let handle = task::spawn(async {
//!         sleep(Duration::from_millis(10)).await;
//!         42
//!     });
//!     assert_eq!(handle.await.unwrap(), 42);
//! }
//! ```

pub mod fs;
pub mod io;
pub mod runtime;
pub mod sync;
pub mod task;
pub mod throttle;
pub mod time;
pub mod timer;
pub mod worker;

pub use task::spawn;
pub use throttle::Throttle;
pub use time::{sleep, Duration, Instant};
pub use timer::{KeyedTimers, TimerTicket};
pub use worker::WorkQueue;
