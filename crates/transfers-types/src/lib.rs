//! Core type system and error handling for the transfers engine
//!
//! This crate provides the foundational types shared by every other crate in the
//! workspace:
//!
//! - **Error handling**: a single error enum classified into validation, not-found,
//!   transient I/O, unrecoverable and cancellation kinds
//! - **Task model**: the three level hierarchy of top, parent and child transfer tasks
//!   together with their shared status lifecycle
//! - **Addressing**: transfer URIs, storage system descriptors and file metadata
//! - **Control**: messages carried on the broadcast control channel
//!
//! # Examples
//!
//! ```rust
//! use transfers_types::{TaskStatus, TransferUri};
//!
//! let uri: TransferUri = "tapis://t1/sysA/data/in".parse().unwrap();
//! assert_eq!(uri.system_id(), Some("sysA"));
//! assert!(TaskStatus::Accepted.can_transition_to(TaskStatus::Staging));
//! assert!(!TaskStatus::Completed.can_transition_to(TaskStatus::InProgress));
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod control;
pub mod error;
pub mod result;
pub mod system;
pub mod task;
pub mod types;
pub mod uri;

// Re-export commonly used types
pub use config::RetryConfig;
pub use control::{ControlAction, ControlMessage};
pub use error::{Error, ErrorKind, ErrorSeverity};
pub use result::Result;
pub use system::{Credentials, Permission, SystemDescriptor, SystemType};
pub use task::*;
pub use types::FileInfo;
pub use uri::TransferUri;
