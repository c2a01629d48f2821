//! Transfer task hierarchy
//!
//! A user request becomes one [`TransferTask`] (the top task) owning one
//! [`TransferTaskParent`] per source/destination pair. Parent tasks fan out into
//! [`TransferTaskChild`] items, one per concrete file or object. Records are plain
//! snapshots: workers always re-read them from the task store by id instead of
//! holding live references.

use crate::uri::TransferUri;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Status shared by all three task levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Persisted, waiting for a worker
    Accepted,
    /// A worker is listing the source
    Staging,
    /// Children exist and are queued
    Staged,
    /// Bytes are moving
    InProgress,
    /// Finished successfully
    Completed,
    /// Finished with a failure
    Failed,
    /// Finished with a failure of an optional task
    FailedOpt,
    /// Cancelled by the user
    Cancelled,
}

impl TaskStatus {
    /// All statuses in lifecycle order
    pub const ALL: [Self; 8] = [
        Self::Accepted,
        Self::Staging,
        Self::Staged,
        Self::InProgress,
        Self::Completed,
        Self::Failed,
        Self::FailedOpt,
        Self::Cancelled,
    ];

    /// Whether no further transition is allowed
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::FailedOpt | Self::Cancelled
        )
    }

    /// Position in the forward ordering; all terminal states share the last rank
    pub fn rank(self) -> u8 {
        match self {
            Self::Accepted => 0,
            Self::Staging => 1,
            Self::Staged => 2,
            Self::InProgress => 3,
            Self::Completed | Self::Failed | Self::FailedOpt | Self::Cancelled => 4,
        }
    }

    /// Whether moving from `self` to `next` respects the lifecycle.
    ///
    /// Re-applying the current status is accepted so repeated stages stay
    /// idempotent. Terminal states never change.
    pub fn can_transition_to(self, next: Self) -> bool {
        if self == next {
            return true;
        }
        if self.is_terminal() {
            return false;
        }
        next.is_terminal() || next.rank() > self.rank()
    }

    /// The failure status to record for a task with the given optional flag
    pub fn failure_for(optional: bool) -> Self {
        if optional {
            Self::FailedOpt
        } else {
            Self::Failed
        }
    }

    /// Wire name of the status
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Accepted => "ACCEPTED",
            Self::Staging => "STAGING",
            Self::Staged => "STAGED",
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::FailedOpt => "FAILED_OPT",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a parent task moves its data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferType {
    /// Stream bytes from source to destination
    #[default]
    PointToPoint,
    /// Same-system move of a file or directory
    ServiceMoveFileOrDirectory,
    /// Same-system move of every entry inside a directory
    ServiceMoveDirectoryContents,
}

impl TransferType {
    /// Whether this type requests a native move instead of streaming
    pub fn is_service_move(self) -> bool {
        !matches!(self, Self::PointToPoint)
    }
}

/// Top-level task, one per submitted request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferTask {
    /// Task id
    pub id: Uuid,
    /// Owning tenant
    pub tenant_id: String,
    /// Submitting user
    pub username: String,
    /// Free-form correlation string
    pub tag: Option<String>,
    /// Current status
    pub status: TaskStatus,
    /// Creation time
    pub created: DateTime<Utc>,
    /// Set once, when the first parent starts
    pub start_time: Option<DateTime<Utc>>,
    /// Set when the task reaches a terminal state
    pub end_time: Option<DateTime<Utc>>,
    /// Failure description
    pub error_message: Option<String>,
    /// Parent tasks, populated on reads that ask for them
    #[serde(default)]
    pub parent_tasks: Vec<TransferTaskParent>,
}

impl TransferTask {
    /// Create a new accepted top task
    pub fn new(tenant_id: impl Into<String>, username: impl Into<String>, tag: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.into(),
            username: username.into(),
            tag,
            status: TaskStatus::Accepted,
            created: Utc::now(),
            start_time: None,
            end_time: None,
            error_message: None,
            parent_tasks: Vec::new(),
        }
    }

    /// Whether the task reached a terminal status
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// One source/destination pair of a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferTaskParent {
    /// Parent task id
    pub id: Uuid,
    /// Owning top task
    pub task_id: Uuid,
    /// Owning tenant
    pub tenant_id: String,
    /// Submitting user
    pub username: String,
    /// Where to read from
    pub source_uri: TransferUri,
    /// Where to write to
    pub destination_uri: TransferUri,
    /// Streaming or native move
    pub transfer_type: TransferType,
    /// A failure here does not fail the top task
    pub optional: bool,
    /// Grantor whose access is checked on the source
    pub src_shared_ctx: Option<String>,
    /// Grantor whose access is checked on the destination
    pub dest_shared_ctx: Option<String>,
    /// Current status
    pub status: TaskStatus,
    /// Sum of file sizes found while staging
    pub total_bytes: u64,
    /// Running sum of bytes reported by children
    pub bytes_transferred: u64,
    /// Worker that currently owns this task
    pub assigned_to: Option<String>,
    /// Creation time
    pub created: DateTime<Utc>,
    /// Set once, when staging starts
    pub start_time: Option<DateTime<Utc>>,
    /// Set when the task reaches a terminal state
    pub end_time: Option<DateTime<Utc>>,
    /// Summary recorded on completion
    pub final_message: Option<String>,
    /// Failure description
    pub error_message: Option<String>,
}

impl TransferTaskParent {
    /// Build a parent task for one request element
    pub fn new(task: &TransferTask, element: &TransferRequestElement) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id: task.id,
            tenant_id: task.tenant_id.clone(),
            username: task.username.clone(),
            source_uri: element.source_uri.clone(),
            destination_uri: element.destination_uri.clone(),
            transfer_type: element.transfer_type,
            optional: element.optional,
            src_shared_ctx: element.src_shared_ctx.clone(),
            dest_shared_ctx: element.dest_shared_ctx.clone(),
            status: TaskStatus::Accepted,
            total_bytes: 0,
            bytes_transferred: 0,
            assigned_to: None,
            created: task.created,
            start_time: None,
            end_time: None,
            final_message: None,
            error_message: None,
        }
    }

    /// Whether the task reached a terminal status
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// One concrete file or object to move
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferTaskChild {
    /// Child task id
    pub id: Uuid,
    /// Owning parent task
    pub parent_task_id: Uuid,
    /// Owning top task
    pub task_id: Uuid,
    /// Owning tenant
    pub tenant_id: String,
    /// Submitting user
    pub username: String,
    /// Where to read from
    pub source_uri: TransferUri,
    /// Where to write to
    pub destination_uri: TransferUri,
    /// Create a directory instead of copying bytes
    pub is_dir: bool,
    /// Inherited from the parent
    pub optional: bool,
    /// Current status
    pub status: TaskStatus,
    /// Size reported by the source listing
    pub total_bytes: u64,
    /// Highest byte count reported so far
    pub bytes_transferred: u64,
    /// Number of transfer attempts started
    pub retries: u32,
    /// Id of a backend-managed transfer, if any
    pub external_task_id: Option<String>,
    /// Creation time
    pub created: DateTime<Utc>,
    /// Set when the pipeline activates the child
    pub start_time: Option<DateTime<Utc>>,
    /// Set when the task reaches a terminal state
    pub end_time: Option<DateTime<Utc>>,
    /// Failure description
    pub error_message: Option<String>,
}

impl TransferTaskChild {
    /// Build a child task under `parent`
    pub fn new(
        parent: &TransferTaskParent,
        source_uri: TransferUri,
        destination_uri: TransferUri,
        is_dir: bool,
        total_bytes: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            parent_task_id: parent.id,
            task_id: parent.task_id,
            tenant_id: parent.tenant_id.clone(),
            username: parent.username.clone(),
            source_uri,
            destination_uri,
            is_dir,
            optional: parent.optional,
            status: TaskStatus::Accepted,
            total_bytes,
            bytes_transferred: 0,
            retries: 0,
            external_task_id: None,
            created: Utc::now(),
            start_time: None,
            end_time: None,
            error_message: None,
        }
    }

    /// Whether the task reached a terminal status
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// A parent task together with its children
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParentDetails {
    /// The parent task
    #[serde(flatten)]
    pub parent: TransferTaskParent,
    /// Every child of the parent
    pub children: Vec<TransferTaskChild>,
}

/// A top task with the full hierarchy underneath it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferDetails {
    /// The top task, without its flat parent list
    #[serde(flatten)]
    pub task: TransferTask,
    /// Parents with nested children
    pub parents: Vec<ParentDetails>,
}

/// One element of a submitted request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRequestElement {
    /// Source URI
    pub source_uri: TransferUri,
    /// Destination URI
    pub destination_uri: TransferUri,
    /// Failure does not fail the whole request
    #[serde(default)]
    pub optional: bool,
    /// Grantor for source access
    #[serde(default)]
    pub src_shared_ctx: Option<String>,
    /// Grantor for destination access
    #[serde(default)]
    pub dest_shared_ctx: Option<String>,
    /// Streaming or native move
    #[serde(default)]
    pub transfer_type: TransferType,
}

impl TransferRequestElement {
    /// A required point-to-point element
    pub fn new(source_uri: TransferUri, destination_uri: TransferUri) -> Self {
        Self {
            source_uri,
            destination_uri,
            optional: false,
            src_shared_ctx: None,
            dest_shared_ctx: None,
            transfer_type: TransferType::PointToPoint,
        }
    }

    /// Mark the element optional
    pub fn optional(mut self, optional: bool) -> Self {
        self.optional = optional;
        self
    }

    /// Set the transfer type
    pub fn with_type(mut self, transfer_type: TransferType) -> Self {
        self.transfer_type = transfer_type;
        self
    }

    /// Whether a shared-context grantor was requested on either side
    pub fn uses_shared_ctx(&self) -> bool {
        self.src_shared_ctx.is_some() || self.dest_shared_ctx.is_some()
    }
}

/// A transfer request as received from a caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRequest {
    /// Tenant the request is made in
    pub tenant_id: String,
    /// Acting user or service identity
    pub username: String,
    /// Free-form correlation string
    #[serde(default)]
    pub tag: Option<String>,
    /// Ordered source/destination pairs
    pub elements: Vec<TransferRequestElement>,
}
