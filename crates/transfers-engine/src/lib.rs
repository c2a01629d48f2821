//! Transfer engine
//!
//! Turns transfer requests into a three level task tree and drives it to a
//! terminal state:
//!
//! - **Request service**: validates a request as a whole, persists the top task
//!   with one parent per element and queues the parents
//! - **Scheduling**: fair-share selection of orphaned or stale parent tasks,
//!   bounded per (tenant, user)
//! - **Parent worker**: lists the source and stages one child per file, or
//!   moves data in place for same-system moves
//! - **Child pipeline**: activate, transfer, finalize and rollup, each stage
//!   re-reading the store so redelivery and cancellation are safe
//! - **Runtime**: consumer loops, child groups keyed by top task and the
//!   cancellation listener
//!
//! # Examples
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use transfers_config::Config;
//! use transfers_engine::{StaticSystems, TransferEngine};
//! use transfers_types::{TransferRequest, TransferRequestElement};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let systems = StaticSystems::load("systems.yaml".as_ref()).await?;
//! let engine = TransferEngine::builder(Config::default())
//!     .systems(Arc::new(systems))
//!     .build()?;
//! engine.start();
//!
//! let task = engine
//!     .service()
//!     .create_transfer(TransferRequest {
//!         tenant_id: "t1".into(),
//!         username: "alice".into(),
//!         tag: None,
//!         elements: vec![TransferRequestElement::new(
//!             "tapis://t1/sysA/data".parse()?,
//!             "tapis://t1/sysB/backup".parse()?,
//!         )],
//!     })
//!     .await?;
//! let done = engine.wait_for_transfer(task.id, Duration::from_secs(600)).await?;
//! println!("{} finished as {}", done.id, done.status);
//! engine.stop().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod child;
pub mod engine;
pub mod executor;
pub mod parent;
pub mod progress;
pub mod request;
pub mod retry;
pub mod rollup;
pub mod scheduler;
pub mod systems;

#[cfg(test)]
mod testing;

pub use child::ChildTaskPipeline;
pub use engine::{EngineBuilder, TransferEngine};
pub use executor::{CancelGuard, CancelRegistry, WorkerPools};
pub use parent::ParentTaskWorker;
pub use progress::{ProgressMonitor, ProgressTracker};
pub use request::TransferRequestService;
pub use retry::{retry_with_backoff, RetryOn};
pub use scheduler::{select_for_worker, FairShareScheduler, ScheduledParent};
pub use systems::{
    resolve_system, PermissionService, StaticPermissions, StaticSystems, SystemsFile,
    SystemsRegistry,
};
