//! The task store interface

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use transfers_types::{Result, TaskStatus, TransferTask, TransferTaskChild, TransferTaskParent};
use uuid::Uuid;

/// Requested status update for any task level
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    /// Target status
    pub status: TaskStatus,
    /// Failure description to record
    pub error_message: Option<String>,
    /// Completion summary, recorded on parent tasks only
    pub final_message: Option<String>,
}

impl StatusChange {
    /// Move to `status` without messages
    pub fn to(status: TaskStatus) -> Self {
        Self {
            status,
            error_message: None,
            final_message: None,
        }
    }

    /// Terminal failure carrying `message`
    pub fn failed(status: TaskStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            error_message: Some(message.into()),
            final_message: None,
        }
    }

    /// Attach a completion summary
    pub fn with_final_message(mut self, message: impl Into<String>) -> Self {
        self.final_message = Some(message.into());
        self
    }
}

/// Outcome of a conditional status update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The status changed
    Applied,
    /// The task already had the requested status
    Unchanged,
    /// The lifecycle forbids the change; carries the status found
    Rejected(TaskStatus),
}

impl Transition {
    /// Whether the task now has the requested status
    pub fn reached(self) -> bool {
        matches!(self, Self::Applied | Self::Unchanged)
    }
}

/// Timestamps and status shared by the three task levels
pub(crate) struct Lifecycle<'a> {
    pub status: &'a mut TaskStatus,
    pub start_time: &'a mut Option<DateTime<Utc>>,
    pub end_time: &'a mut Option<DateTime<Utc>>,
    pub error_message: &'a mut Option<String>,
}

impl Lifecycle<'_> {
    /// Apply `change` if the lifecycle allows it.
    ///
    /// The start time is stamped once, on the first non-accepted status. The end
    /// time is stamped on entering a terminal state, or when a terminal task is
    /// seen again without one.
    pub fn apply(self, change: &StatusChange, now: DateTime<Utc>) -> Transition {
        let current = *self.status;
        if current == change.status {
            if current.is_terminal() && self.end_time.is_none() {
                *self.end_time = Some(now);
            }
            return Transition::Unchanged;
        }
        if !current.can_transition_to(change.status) {
            if current.is_terminal() && self.end_time.is_none() {
                *self.end_time = Some(now);
            }
            return Transition::Rejected(current);
        }

        *self.status = change.status;
        if change.status != TaskStatus::Accepted && self.start_time.is_none() {
            *self.start_time = Some(now);
        }
        if change.status.is_terminal() {
            *self.end_time = Some(now);
        }
        if let Some(message) = &change.error_message {
            *self.error_message = Some(message.clone());
        }
        Transition::Applied
    }
}

/// Result of staging a parent task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    /// The parent moved to STAGED and the children were inserted
    Staged(Vec<TransferTaskChild>),
    /// An earlier delivery already staged the parent; carries its children
    AlreadyStaged(Vec<TransferTaskChild>),
    /// The parent is terminal, nothing was inserted
    Rejected(TaskStatus),
}

/// Transactional persistence for the task hierarchy.
///
/// Every method is atomic on its own. Workers never share task objects; they
/// re-read by id before each step so concurrent cancellation is observed.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Persist a top task and its parent tasks in one transaction
    async fn create_transfer(&self, task: &TransferTask) -> Result<()>;

    /// A top task with its parent tasks populated
    async fn get_transfer(&self, id: Uuid) -> Result<Option<TransferTask>>;

    /// Top tasks of one user, newest first
    async fn list_transfers(
        &self,
        tenant_id: &str,
        username: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<TransferTask>>;

    /// Conditionally update a top task's status
    async fn set_transfer_status(&self, id: Uuid, change: StatusChange) -> Result<Transition>;

    /// Read a parent task
    async fn get_parent(&self, id: Uuid) -> Result<Option<TransferTaskParent>>;

    /// Conditionally update a parent task's status
    async fn set_parent_status(&self, id: Uuid, change: StatusChange) -> Result<Transition>;

    /// Claim a non-terminal parent for `worker_id` unless a live worker owns it
    async fn assign_parent(&self, id: Uuid, worker_id: &str, live_workers: &[String]) -> Result<bool>;

    /// Move a parent to STAGED with its total size and insert its children, atomically
    async fn stage_parent(
        &self,
        id: Uuid,
        total_bytes: u64,
        children: Vec<TransferTaskChild>,
    ) -> Result<StageOutcome>;

    /// Children of a parent task in creation order
    async fn get_parent_children(&self, parent_id: Uuid) -> Result<Vec<TransferTaskChild>>;

    /// Read a child task
    async fn get_child(&self, id: Uuid) -> Result<Option<TransferTaskChild>>;

    /// Conditionally update a child task's status
    async fn set_child_status(&self, id: Uuid, change: StatusChange) -> Result<Transition>;

    /// Count a transfer attempt; returns the new retry count
    async fn increment_child_retries(&self, id: Uuid) -> Result<u32>;

    /// Record the id of a backend managed transfer
    async fn set_child_external_id(&self, id: Uuid, external_id: &str) -> Result<()>;

    /// Record that a child has moved `bytes` so far.
    ///
    /// Lower counts than already recorded are ignored. The positive difference
    /// is added to the parent's running total, which is returned.
    async fn record_child_progress(&self, id: Uuid, bytes: u64) -> Result<u64>;

    /// Number of children per status under one parent
    async fn child_status_counts(&self, parent_id: Uuid) -> Result<HashMap<TaskStatus, usize>>;

    /// Non-terminal children of one parent
    async fn count_incomplete_children(&self, parent_id: Uuid) -> Result<usize>;

    /// Non-terminal children across all parents of a top task
    async fn count_incomplete_children_for_top(&self, task_id: Uuid) -> Result<usize>;

    /// Non-terminal parents of a top task
    async fn count_incomplete_parents(&self, task_id: Uuid) -> Result<usize>;

    /// Mark every non-terminal task of a transfer CANCELLED. Returns whether
    /// anything changed.
    async fn cancel_transfer(&self, task_id: Uuid) -> Result<bool>;

    /// Non-terminal parent tasks, oldest first
    async fn candidate_parents(&self) -> Result<Vec<TransferTaskParent>>;

    /// Record that `worker_id` is alive
    async fn heartbeat(&self, worker_id: &str) -> Result<()>;

    /// Workers that sent a heartbeat within `timeout`
    async fn live_workers(&self, timeout: Duration) -> Result<Vec<String>>;
}
