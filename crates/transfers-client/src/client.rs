//! The remote data client capability interface

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;
use transfers_types::{Error, FileInfo, Result, SystemDescriptor, SystemType};

/// A stream of file content chunks
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Options for [`RemoteDataClient::list`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListOptions {
    /// Descend into subdirectories
    pub recurse: bool,
    /// Depth limit when recursing, `None` for unbounded
    pub max_depth: Option<usize>,
    /// Glob applied to entry names (`*` and `?`)
    pub filter: Option<String>,
    /// Entries to skip
    pub offset: usize,
    /// Maximum entries to return
    pub limit: Option<usize>,
}

impl ListOptions {
    /// Non-recursive listing of a single level
    pub fn single_level() -> Self {
        Self::default()
    }

    /// Recursive listing bounded by `max_depth`
    pub fn recursive(max_depth: usize) -> Self {
        Self {
            recurse: true,
            max_depth: Some(max_depth),
            ..Self::default()
        }
    }

    /// Cap the number of returned entries
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub(crate) fn level(&self) -> Self {
        Self {
            recurse: false,
            ..Self::default()
        }
    }

    /// Apply the name filter, offset and limit to a collected listing
    pub fn apply(&self, entries: Vec<FileInfo>) -> Vec<FileInfo> {
        let filtered = entries.into_iter().filter(|entry| {
            self.filter
                .as_deref()
                .map_or(true, |pattern| crate::glob::wildcard_match(pattern, &entry.name))
        });
        let paged = filtered.skip(self.offset);
        match self.limit {
            Some(limit) => paged.take(limit).collect(),
            None => paged.collect(),
        }
    }
}

/// What a client can do, so callers never need to know the concrete backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// chmod, chown and chgrp are available
    pub native_ops: bool,
    /// The backend models directories
    pub directories: bool,
    /// Bytes can be streamed in and out
    pub streaming: bool,
    /// The backend can run transfers on its own
    pub backend_transfers: bool,
    /// Uploads, mkdir, move and delete are available
    pub writable: bool,
}

/// A POSIX permission operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NativeOp {
    /// Change the mode, given in octal such as `755`
    Chmod(String),
    /// Change the owning user
    Chown(String),
    /// Change the owning group
    Chgrp(String),
}

impl NativeOp {
    /// Command name of the operation
    pub fn command(&self) -> &'static str {
        match self {
            Self::Chmod(_) => "chmod",
            Self::Chown(_) => "chown",
            Self::Chgrp(_) => "chgrp",
        }
    }

    /// Reject arguments that are not a plain mode or account name
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Chmod(mode) => {
                let valid = (3..=4).contains(&mode.len())
                    && mode.chars().all(|c| ('0'..='7').contains(&c));
                if valid {
                    Ok(())
                } else {
                    Err(Error::validation(format!("Invalid mode {mode}")))
                }
            }
            Self::Chown(name) | Self::Chgrp(name) => {
                let valid = !name.is_empty()
                    && !name.starts_with('-')
                    && name
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
                if valid {
                    Ok(())
                } else {
                    Err(Error::validation(format!("Invalid account name {name}")))
                }
            }
        }
    }
}

/// Outcome of a native operation; a non-zero exit code is not an error
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NativeOpResult {
    /// Process exit code
    pub exit_code: i32,
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error
    pub stderr: String,
}

impl NativeOpResult {
    /// A successful result with no output
    pub fn ok() -> Self {
        Self::default()
    }

    /// A failed result carrying `message` on stderr
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            exit_code: 1,
            stdout: String::new(),
            stderr: message.into(),
        }
    }
}

/// State of a transfer executed by the backend itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendTransferStatus {
    /// Still running
    Active,
    /// Finished successfully
    Succeeded,
    /// Finished with an error
    Failed(String),
    /// Cancelled on the backend
    Cancelled,
}

impl BackendTransferStatus {
    /// Whether the backend will not change the status any more
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Active)
    }
}

/// Uniform access to one storage system.
///
/// Every path argument is relative to the system's root directory. Adapters
/// normalise it and reject anything that would escape the root.
#[async_trait]
pub trait RemoteDataClient: Send + Sync {
    /// Backend kind
    fn system_type(&self) -> SystemType;

    /// Id of the system this client talks to
    fn system_id(&self) -> &str;

    /// Supported operations
    fn capabilities(&self) -> Capabilities;

    /// List a directory, or return the single entry for a file
    async fn list(&self, path: &str, options: &ListOptions) -> Result<Vec<FileInfo>>;

    /// Metadata for a path, `None` when it does not exist
    async fn get_file_info(&self, path: &str, follow_links: bool) -> Result<Option<FileInfo>>;

    /// Stream the content of a file
    async fn get_stream(&self, path: &str) -> Result<ByteStream>;

    /// Write `stream` to `path`, creating parent directories as needed.
    /// Returns the number of bytes written.
    async fn upload(&self, path: &str, stream: ByteStream) -> Result<u64>;

    /// Create a directory and any missing parents
    async fn mkdir(&self, path: &str) -> Result<()>;

    /// Move or rename within this system
    async fn move_path(&self, from: &str, to: &str) -> Result<()>;

    /// Delete a file or a directory tree
    async fn delete(&self, path: &str) -> Result<()>;

    /// Run a POSIX permission operation
    async fn native_op(
        &self,
        op: &NativeOp,
        path: &str,
        recursive: bool,
    ) -> Result<NativeOpResult> {
        let _ = (path, recursive);
        Err(Error::not_supported(op.command(), self.system_type().to_string()))
    }

    /// Start a transfer executed by the backend. Returns its external id.
    async fn submit_backend_transfer(
        &self,
        src_path: &str,
        destination: &SystemDescriptor,
        dest_path: &str,
        recursive: bool,
    ) -> Result<String> {
        let _ = (src_path, destination, dest_path, recursive);
        Err(Error::not_supported(
            "backend transfer",
            self.system_type().to_string(),
        ))
    }

    /// Poll a backend transfer
    async fn backend_transfer_status(&self, external_id: &str) -> Result<BackendTransferStatus> {
        let _ = external_id;
        Err(Error::not_supported(
            "backend transfer status",
            self.system_type().to_string(),
        ))
    }

    /// Cancel a backend transfer
    async fn cancel_backend_transfer(&self, external_id: &str) -> Result<()> {
        let _ = external_id;
        Err(Error::not_supported(
            "backend transfer cancel",
            self.system_type().to_string(),
        ))
    }
}
