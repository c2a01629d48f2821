//! POSIX filesystem mounted on the worker host

use crate::client::{ByteStream, Capabilities, ListOptions, NativeOp, NativeOpResult, RemoteDataClient};
use crate::{listing, path};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::fs::Metadata;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::debug;
use transfers_types::{Error, FileInfo, Result, SystemDescriptor, SystemType};

/// Client for a directory tree on the local filesystem
#[derive(Debug, Clone)]
pub struct LocalClient {
    tenant: String,
    system_id: String,
    root: String,
    chunk_size: usize,
}

impl LocalClient {
    /// Create a client rooted at the system's `root_dir`
    pub fn new(system: &SystemDescriptor, chunk_size: usize) -> Self {
        Self {
            tenant: system.tenant.clone(),
            system_id: system.id.clone(),
            root: system.root_dir.clone(),
            chunk_size,
        }
    }

    fn absolute(&self, relative: &str) -> Result<PathBuf> {
        path::resolve(&self.root, relative).map(PathBuf::from)
    }

    fn file_info(&self, relative: &str, metadata: &Metadata) -> FileInfo {
        FileInfo {
            path: relative.to_string(),
            name: path::file_name(relative).to_string(),
            size: if metadata.is_dir() { 0 } else { metadata.len() },
            is_dir: metadata.is_dir(),
            native_permissions: permissions_string(metadata),
            last_modified: metadata.modified().ok().map(DateTime::<Utc>::from),
            url: path::file_url(&self.tenant, &self.system_id, relative),
        }
    }

    async fn stat(&self, relative: &str, follow_links: bool) -> Result<Option<Metadata>> {
        let absolute = self.absolute(relative)?;
        let result = if follow_links {
            tokio::fs::metadata(&absolute).await
        } else {
            tokio::fs::symlink_metadata(&absolute).await
        };
        match result {
            Ok(metadata) => Ok(Some(metadata)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(unix)]
fn permissions_string(metadata: &Metadata) -> Option<String> {
    use std::os::unix::fs::PermissionsExt;
    Some(FileInfo::mode_string(
        metadata.permissions().mode(),
        metadata.is_dir(),
    ))
}

#[cfg(not(unix))]
fn permissions_string(_metadata: &Metadata) -> Option<String> {
    None
}

#[async_trait]
impl RemoteDataClient for LocalClient {
    fn system_type(&self) -> SystemType {
        SystemType::Local
    }

    fn system_id(&self) -> &str {
        &self.system_id
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            native_ops: cfg!(unix),
            directories: true,
            streaming: true,
            backend_transfers: false,
            writable: true,
        }
    }

    async fn list(&self, path: &str, options: &ListOptions) -> Result<Vec<FileInfo>> {
        if options.recurse {
            return listing::walk(self, path, options).await;
        }

        let relative = path::normalize(path)?;
        let metadata = self
            .stat(&relative, true)
            .await?
            .ok_or_else(|| Error::not_found(format!("{}:/{}", self.system_id, relative)))?;
        if !metadata.is_dir() {
            return Ok(options.apply(vec![self.file_info(&relative, &metadata)]));
        }

        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(self.absolute(&relative)?).await?;
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let child = path::join(&relative, &name);
            // Dangling links are reported with their own metadata.
            let metadata = match tokio::fs::metadata(entry.path()).await {
                Ok(metadata) => metadata,
                Err(_) => entry.metadata().await?,
            };
            entries.push(self.file_info(&child, &metadata));
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(options.apply(entries))
    }

    async fn get_file_info(&self, path: &str, follow_links: bool) -> Result<Option<FileInfo>> {
        let relative = path::normalize(path)?;
        Ok(self
            .stat(&relative, follow_links)
            .await?
            .map(|metadata| self.file_info(&relative, &metadata)))
    }

    async fn get_stream(&self, path: &str) -> Result<ByteStream> {
        let file = tokio::fs::File::open(self.absolute(path)?).await?;
        let stream = ReaderStream::with_capacity(file, self.chunk_size)
            .map(|chunk| chunk.map_err(Error::from));
        Ok(Box::pin(stream))
    }

    async fn upload(&self, path: &str, mut stream: ByteStream) -> Result<u64> {
        let target = self.absolute(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = tokio::fs::File::create(&target).await?;
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        debug!(system = %self.system_id, path, bytes = written, "Upload finished");
        Ok(written)
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        tokio::fs::create_dir_all(self.absolute(path)?).await?;
        Ok(())
    }

    async fn move_path(&self, from: &str, to: &str) -> Result<()> {
        let source = self.absolute(from)?;
        let target = self.absolute(to)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(&source, &target).await?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let relative = path::normalize(path)?;
        let absolute = self.absolute(&relative)?;
        let metadata = tokio::fs::symlink_metadata(&absolute).await?;
        if metadata.is_dir() {
            if relative.is_empty() {
                // Keep the root itself, clear its content.
                let mut dir = tokio::fs::read_dir(&absolute).await?;
                while let Some(entry) = dir.next_entry().await? {
                    if entry.file_type().await?.is_dir() {
                        tokio::fs::remove_dir_all(entry.path()).await?;
                    } else {
                        tokio::fs::remove_file(entry.path()).await?;
                    }
                }
                return Ok(());
            }
            tokio::fs::remove_dir_all(&absolute).await?;
        } else {
            tokio::fs::remove_file(&absolute).await?;
        }
        Ok(())
    }

    async fn native_op(
        &self,
        op: &NativeOp,
        path: &str,
        recursive: bool,
    ) -> Result<NativeOpResult> {
        op.validate()?;
        let absolute = self.absolute(path)?;
        let op = op.clone();
        let result = tokio::task::spawn_blocking(move || apply_native_op(&op, &absolute, recursive))
            .await
            .map_err(|e| Error::other(format!("Native operation task failed: {e}")))?;
        Ok(result)
    }
}

#[cfg(unix)]
fn apply_native_op(op: &NativeOp, target: &std::path::Path, recursive: bool) -> NativeOpResult {
    use std::os::unix::fs::PermissionsExt;

    let entries: Vec<PathBuf> = if recursive {
        walkdir::WalkDir::new(target)
            .into_iter()
            .filter_map(std::result::Result::ok)
            .map(walkdir::DirEntry::into_path)
            .collect()
    } else {
        vec![target.to_path_buf()]
    };

    let mut errors = Vec::new();
    for entry in &entries {
        let outcome = match op {
            NativeOp::Chmod(mode) => u32::from_str_radix(mode, 8)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))
                .and_then(|mode| {
                    std::fs::set_permissions(entry, std::fs::Permissions::from_mode(mode))
                }),
            NativeOp::Chown(user) => numeric_id(user)
                .and_then(|uid| std::os::unix::fs::chown(entry, Some(uid), None)),
            NativeOp::Chgrp(group) => numeric_id(group)
                .and_then(|gid| std::os::unix::fs::chown(entry, None, Some(gid))),
        };
        if let Err(e) = outcome {
            errors.push(format!("{}: {}: {}", op.command(), entry.display(), e));
        }
    }

    if errors.is_empty() {
        NativeOpResult::ok()
    } else {
        NativeOpResult::failed(errors.join("\n"))
    }
}

#[cfg(not(unix))]
fn apply_native_op(op: &NativeOp, _target: &std::path::Path, _recursive: bool) -> NativeOpResult {
    NativeOpResult::failed(format!("{} is not available on this platform", op.command()))
}

/// Local accounts are only addressable by numeric id without a name service.
#[cfg(unix)]
fn numeric_id(name: &str) -> std::io::Result<u32> {
    name.parse().map_err(|_| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("invalid user or group '{name}'"),
        )
    })
}
