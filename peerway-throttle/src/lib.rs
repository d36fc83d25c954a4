//! Rate-limited outbound dispatch for the Peerway engine.
//!
//! The server buckets request types into rate classes and drops clients
//! that send too fast.  This crate keeps the client exactly on the right
//! side of that line: every outbound request is enqueued to its class's
//! [`RateQueue`], and one [`DispatchScheduler`] task per connection
//! flushes whatever the windowed-average arithmetic admits, then sleeps
//! precisely until the next admission.
//!
//! # Structure
//!
//! - [`queue`]     — [`RateQueue`]: FIFO + pending set for one class
//! - [`scheduler`] — [`DispatchScheduler`]: the per-connection flush loop

mod queue;
mod scheduler;

// --- queue
pub use queue::{Admitted, QueuedRequest, RateQueue};

// --- scheduler
pub use scheduler::{DispatchScheduler, SchedulerConfig};
