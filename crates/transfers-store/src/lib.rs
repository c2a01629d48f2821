//! # Transfers Store
//!
//! Transactional persistence for the three-level task hierarchy. The engine only
//! talks to [`TaskStore`]; [`MemoryTaskStore`] keeps everything in one process.
//!
//! Status updates are conditional: a [`StatusChange`] is applied only when the
//! task lifecycle allows it, and the returned [`Transition`] says what happened.
//! That is what keeps redelivered work idempotent.

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod memory;
pub mod store;

pub use memory::MemoryTaskStore;
pub use store::{StageOutcome, StatusChange, TaskStore, Transition};
