//! # Transfers Queue
//!
//! Parent and child tasks travel between workers on [`WorkQueue`]s with
//! at-least-once delivery: a message is only dropped once it is acknowledged,
//! and every consumer holds a bounded number of unacknowledged deliveries.
//! [`TaskQueue`] adds JSON snapshots on top. Cancellation signals fan out to
//! every worker over the [`ControlChannel`].

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod control;
pub mod queue;
pub mod typed;

pub use control::{ControlChannel, ControlSubscriber};
pub use queue::{Delivery, MemoryQueue, WorkQueue};
pub use typed::{Message, TaskQueue};
