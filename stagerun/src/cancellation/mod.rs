//! Cooperative cancellation.
//!
//! A [`CancellationToken`] is shared (as `Arc<CancellationToken>`) between the
//! orchestrator, the retry loop and external process invocations. It is
//! checked at stage boundaries and awaited during inter-attempt delays and
//! child process waits.

mod token;

pub use token::{CancelCallback, CancellationToken};
