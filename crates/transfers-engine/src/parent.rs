//! Parent task staging
//!
//! A parent is turned into child tasks by listing its source. Same-system moves
//! are done in place without children. Staging is safe to repeat: the store
//! refuses to stage a parent twice and hands back the children it already has.

use crate::retry::{retry_with_backoff, RetryOn};
use crate::rollup;
use crate::systems::{resolve_system, SystemsRegistry};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use transfers_client::{path, ClientFactory, ListOptions, RemoteDataClient};
use transfers_config::{LimitsConfig, RetrySettings};
use transfers_queue::TaskQueue;
use transfers_store::{StageOutcome, StatusChange, TaskStore, Transition};
use transfers_types::{
    Error, FileInfo, RetryConfig, Result, TaskStatus, TransferTaskChild, TransferTaskParent,
    TransferType, TransferUri,
};
use uuid::Uuid;

/// Stages parent tasks into children
#[derive(Clone)]
pub struct ParentTaskWorker {
    store: Arc<dyn TaskStore>,
    child_queue: TaskQueue<TransferTaskChild>,
    systems: Arc<dyn SystemsRegistry>,
    clients: Arc<dyn ClientFactory>,
    limits: LimitsConfig,
    retry: RetryConfig,
}

impl ParentTaskWorker {
    /// Create a worker
    pub fn new(
        store: Arc<dyn TaskStore>,
        child_queue: TaskQueue<TransferTaskChild>,
        systems: Arc<dyn SystemsRegistry>,
        clients: Arc<dyn ClientFactory>,
        limits: LimitsConfig,
        retry: &RetrySettings,
    ) -> Self {
        Self {
            store,
            child_queue,
            systems,
            clients,
            limits,
            retry: RetryConfig {
                max_attempts: retry.parent_attempts.max(1),
                ..retry.service.clone()
            },
        }
    }

    /// Stage one parent task.
    ///
    /// `recovered` is set when the parent may have been staged before, by a
    /// crashed worker or an earlier delivery; its pending children are queued
    /// again then. Errors returned here are store failures while recording the
    /// outcome; everything else ends up on the task.
    pub async fn process(
        &self,
        parent_id: Uuid,
        recovered: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let result = retry_with_backoff(
            &self.retry,
            RetryOn::ServiceErrors,
            "stage parent",
            cancel,
            |attempt| self.stage(parent_id, recovered || attempt > 1),
        )
        .await;

        match result {
            Ok(()) => Ok(()),
            Err(e) if e.is_cancelled() => {
                debug!(%parent_id, "Parent staging interrupted");
                Ok(())
            }
            Err(e) => self.fail(parent_id, &e).await,
        }
    }

    async fn stage(&self, parent_id: Uuid, recovered: bool) -> Result<()> {
        let Some(parent) = self.store.get_parent(parent_id).await? else {
            warn!(%parent_id, "Parent task no longer exists");
            return Ok(());
        };
        if parent.is_terminal() {
            debug!(%parent_id, status = %parent.status, "Parent task already finished");
            return Ok(());
        }

        let top = self
            .store
            .set_transfer_status(parent.task_id, StatusChange::to(TaskStatus::InProgress))
            .await?;
        if let Transition::Rejected(status) = top {
            info!(%parent_id, task_id = %parent.task_id, %status, "Transfer already finished, skipping parent");
            self.store
                .set_parent_status(
                    parent_id,
                    StatusChange::failed(TaskStatus::Cancelled, format!("Transfer is already {status}")),
                )
                .await?;
            return Ok(());
        }

        if parent.status.rank() >= TaskStatus::Staged.rank() {
            if recovered {
                self.requeue_pending(parent_id).await?;
            }
            return rollup::check(self.store.as_ref(), parent_id, parent.task_id).await;
        }

        if !self
            .store
            .set_parent_status(parent_id, StatusChange::to(TaskStatus::Staging))
            .await?
            .reached()
        {
            return Ok(());
        }

        if parent.transfer_type.is_service_move() {
            return self.service_move(&parent).await;
        }
        let (total, children) = match &parent.source_uri {
            TransferUri::Http { .. } => self.stage_url(&parent).await?,
            TransferUri::Tapis { .. } => match self.stage_listing(&parent).await? {
                Some(staged) => staged,
                None => return Ok(()),
            },
        };
        self.publish_staged(&parent, total, children).await
    }

    /// Plain URLs cannot be listed, they always become one child.
    async fn stage_url(&self, parent: &TransferTaskParent) -> Result<(u64, Vec<TransferTaskChild>)> {
        let source = self.clients.client_for_url(&parent.source_uri)?;
        let size = source
            .get_file_info(parent.source_uri.path(), true)
            .await?
            .map_or(0, |info| info.size);
        let child = TransferTaskChild::new(
            parent,
            parent.source_uri.clone(),
            parent.destination_uri.clone(),
            false,
            size,
        );
        Ok((size, vec![child]))
    }

    /// List the source and build one child per entry. Returns `None` when the
    /// parent was finished without children.
    async fn stage_listing(
        &self,
        parent: &TransferTaskParent,
    ) -> Result<Option<(u64, Vec<TransferTaskChild>)>> {
        let (source, src_system) = self
            .client_for(parent, &parent.source_uri, parent.src_shared_ctx.as_deref())
            .await?;
        let (destination, _) = self
            .client_for(parent, &parent.destination_uri, parent.dest_shared_ctx.as_deref())
            .await?;

        let src_path = parent.source_uri.path();
        let info = source
            .get_file_info(src_path, true)
            .await?
            .ok_or_else(|| Error::not_found(format!("source path {}", parent.source_uri)))?;

        let max_items = self.limits.max_listing_items;
        let entries = if info.is_dir {
            // Backend managed transfers copy directory trees themselves.
            let backend_pair = source.capabilities().backend_transfers
                && destination.capabilities().backend_transfers
                && source.system_type() == destination.system_type();
            let options = if backend_pair {
                ListOptions::single_level()
            } else {
                ListOptions::recursive(self.limits.max_listing_depth)
            };
            source
                .list(src_path, &options.with_limit(max_items.saturating_add(1)))
                .await?
        } else {
            vec![info.clone()]
        };

        if entries.len() > max_items {
            return Err(Error::unrecoverable(format!(
                "Listing {} returned more than {max_items} items",
                parent.source_uri
            )));
        }
        if entries.is_empty() {
            self.store
                .set_parent_status(
                    parent.id,
                    StatusChange::to(TaskStatus::Completed).with_final_message("Source is empty"),
                )
                .await?;
            rollup::check_top(self.store.as_ref(), parent.task_id).await?;
            info!(parent_id = %parent.id, system = %src_system, "Nothing to transfer");
            return Ok(None);
        }

        let keep_dirs = destination.capabilities().directories;
        let base = path::normalize(src_path)?;
        let mut total = 0;
        let mut children = Vec::with_capacity(entries.len());
        for entry in entries.iter().filter(|e| keep_dirs || !e.is_dir) {
            let relative = relative_to(&base, entry, info.is_dir);
            if !entry.is_dir {
                total += entry.size;
            }
            children.push(TransferTaskChild::new(
                parent,
                parent.source_uri.join(&relative),
                parent.destination_uri.join(&relative),
                entry.is_dir,
                entry.size,
            ));
        }
        Ok(Some((total, children)))
    }

    async fn publish_staged(
        &self,
        parent: &TransferTaskParent,
        total: u64,
        children: Vec<TransferTaskChild>,
    ) -> Result<()> {
        let staged = match self.store.stage_parent(parent.id, total, children).await? {
            StageOutcome::Staged(children) => children,
            StageOutcome::AlreadyStaged(children) => children
                .into_iter()
                .filter(|c| c.status == TaskStatus::Accepted)
                .collect(),
            StageOutcome::Rejected(status) => {
                debug!(parent_id = %parent.id, %status, "Parent finished while staging");
                return Ok(());
            }
        };
        for child in &staged {
            self.child_queue.publish(child).await?;
        }
        info!(
            parent_id = %parent.id,
            children = staged.len(),
            total_bytes = total,
            "Parent task staged"
        );
        // Children may all be finished already on a repeated stage.
        rollup::check(self.store.as_ref(), parent.id, parent.task_id).await
    }

    async fn requeue_pending(&self, parent_id: Uuid) -> Result<()> {
        let pending: Vec<_> = self
            .store
            .get_parent_children(parent_id)
            .await?
            .into_iter()
            .filter(|c| c.status == TaskStatus::Accepted)
            .collect();
        for child in &pending {
            self.child_queue.publish(child).await?;
        }
        if !pending.is_empty() {
            info!(%parent_id, children = pending.len(), "Requeued pending children");
        }
        Ok(())
    }

    async fn service_move(&self, parent: &TransferTaskParent) -> Result<()> {
        let (client, _) = self
            .client_for(parent, &parent.source_uri, parent.src_shared_ctx.as_deref())
            .await?;
        let from = parent.source_uri.path();
        let to = parent.destination_uri.path();
        match parent.transfer_type {
            TransferType::ServiceMoveDirectoryContents => {
                if client.capabilities().directories {
                    client.mkdir(to).await?;
                }
                for entry in client.list(from, &ListOptions::single_level()).await? {
                    client.move_path(&entry.path, &path::join(to, &entry.name)).await?;
                }
            }
            _ => client.move_path(from, to).await?,
        }
        self.store
            .set_parent_status(
                parent.id,
                StatusChange::to(TaskStatus::Completed).with_final_message(format!("Moved {from} to {to}")),
            )
            .await?;
        info!(parent_id = %parent.id, from, to, "Service move finished");
        rollup::check_top(self.store.as_ref(), parent.task_id).await?;
        Ok(())
    }

    async fn client_for(
        &self,
        parent: &TransferTaskParent,
        uri: &TransferUri,
        shared_ctx: Option<&str>,
    ) -> Result<(Arc<dyn RemoteDataClient>, String)> {
        let system = resolve_system(self.systems.as_ref(), uri, &parent.username, shared_ctx).await?;
        let client = self.clients.client_for_system(&system).await?;
        Ok((client, system.id))
    }

    /// Record a staging failure. A required parent also fails its transfer.
    async fn fail(&self, parent_id: Uuid, cause: &Error) -> Result<()> {
        let Some(parent) = self.store.get_parent(parent_id).await? else {
            return Ok(());
        };
        let message = cause.to_string();
        let status = TaskStatus::failure_for(parent.optional);
        error!(%parent_id, task_id = %parent.task_id, %status, "Parent task failed: {}", message);

        self.store
            .set_parent_status(parent_id, StatusChange::failed(status, message.clone()))
            .await?;
        if !parent.optional {
            self.store
                .set_transfer_status(parent.task_id, StatusChange::failed(TaskStatus::Failed, message))
                .await?;
        }
        rollup::check_top(self.store.as_ref(), parent.task_id).await?;
        Ok(())
    }
}

/// Path of `entry` below the listed source. A file source maps onto the
/// destination itself.
fn relative_to(base: &str, entry: &FileInfo, source_is_dir: bool) -> String {
    if !source_is_dir {
        return String::new();
    }
    match entry.path.strip_prefix(base) {
        Some(rest) if base.is_empty() || rest.starts_with('/') || rest.is_empty() => {
            rest.trim_start_matches('/').to_string()
        }
        _ => entry.name.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::systems::StaticSystems;
    use crate::testing::{entry as listed, BackendStub};
    use tempfile::TempDir;
    use transfers_client::BackendTransferStatus;
    use transfers_client::DefaultClientFactory;
    use transfers_config::ClientConfig;
    use transfers_queue::MemoryQueue;
    use transfers_store::MemoryTaskStore;
    use transfers_types::{SystemDescriptor, SystemType, TransferRequestElement, TransferTask};

    struct Fixture {
        src: TempDir,
        _dst: TempDir,
        store: Arc<MemoryTaskStore>,
        queue: Arc<MemoryQueue>,
        worker: ParentTaskWorker,
    }

    fn fixture(max_listing_items: usize) -> Fixture {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        let local = |id: &str, dir: &TempDir| {
            SystemDescriptor::new("t1", id, SystemType::Local, dir.path().to_string_lossy())
        };
        let systems = StaticSystems::new()
            .with_system(local("src", &src))
            .with_system(local("dst", &dst));

        let store = Arc::new(MemoryTaskStore::new());
        let queue = Arc::new(MemoryQueue::new("children", 16));
        let worker = worker(
            &store,
            &queue,
            systems,
            Arc::new(DefaultClientFactory::new(ClientConfig::default()).unwrap()),
            max_listing_items,
        );
        Fixture {
            src,
            _dst: dst,
            store,
            queue,
            worker,
        }
    }

    fn worker(
        store: &Arc<MemoryTaskStore>,
        queue: &Arc<MemoryQueue>,
        systems: StaticSystems,
        clients: Arc<dyn ClientFactory>,
        max_listing_items: usize,
    ) -> ParentTaskWorker {
        ParentTaskWorker::new(
            store.clone(),
            TaskQueue::new(queue.clone()),
            Arc::new(systems),
            clients,
            LimitsConfig {
                max_listing_items,
                ..LimitsConfig::default()
            },
            &RetrySettings {
                transfer: RetryConfig::immediate(1),
                service: RetryConfig::immediate(1),
                parent_attempts: 2,
            },
        )
    }

    async fn submit(f: &Fixture, element: TransferRequestElement) -> TransferTaskParent {
        submit_to(&f.store, element).await
    }

    async fn submit_to(store: &MemoryTaskStore, element: TransferRequestElement) -> TransferTaskParent {
        let mut task = TransferTask::new("t1", "alice", None);
        let parent = TransferTaskParent::new(&task, &element);
        task.parent_tasks.push(parent.clone());
        store.create_transfer(&task).await.unwrap();
        parent
    }

    fn write(f: &Fixture, relative: &str, size: usize) {
        let path = f.src.path().join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, vec![b'x'; size]).unwrap();
    }

    fn copy(src: &str, dst: &str) -> TransferRequestElement {
        TransferRequestElement::new(TransferUri::tapis("t1", "src", src), TransferUri::tapis("t1", "dst", dst))
    }

    #[tokio::test]
    async fn test_directory_is_staged_into_children() {
        let f = fixture(100);
        write(&f, "in/a.txt", 100);
        write(&f, "in/sub/b.txt", 200);
        let parent = submit(&f, copy("/in", "/out")).await;

        f.worker.process(parent.id, false, &CancellationToken::new()).await.unwrap();

        let stored = f.store.get_parent(parent.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Staged);
        assert_eq!(stored.total_bytes, 300);
        let children = f.store.get_parent_children(parent.id).await.unwrap();
        assert_eq!(children.len(), 3);
        assert_eq!(children.iter().filter(|c| c.is_dir).count(), 1);
        assert!(children
            .iter()
            .any(|c| c.destination_uri == TransferUri::tapis("t1", "dst", "/out/sub/b.txt")));
        assert_eq!(f.queue.ready_count(), 3);

        let top = f.store.get_transfer(parent.task_id).await.unwrap().unwrap();
        assert_eq!(top.status, TaskStatus::InProgress);
        assert!(top.start_time.is_some());
    }

    #[tokio::test]
    async fn test_restaging_reuses_children() {
        let f = fixture(100);
        write(&f, "in/a.txt", 10);
        let parent = submit(&f, copy("/in", "/out")).await;

        f.worker.process(parent.id, false, &CancellationToken::new()).await.unwrap();
        f.worker.process(parent.id, true, &CancellationToken::new()).await.unwrap();

        assert_eq!(f.store.get_parent_children(parent.id).await.unwrap().len(), 1);
        // The pending child is queued again for the recovering worker.
        assert_eq!(f.queue.ready_count(), 2);
    }

    #[tokio::test]
    async fn test_listing_limit_fails_without_children() {
        let f = fixture(2);
        for name in ["a", "b", "c"] {
            write(&f, &format!("in/{name}.txt"), 1);
        }
        let parent = submit(&f, copy("/in", "/out")).await;

        f.worker.process(parent.id, false, &CancellationToken::new()).await.unwrap();

        let top = f.store.get_transfer(parent.task_id).await.unwrap().unwrap();
        assert_eq!(top.parent_tasks[0].status, TaskStatus::Failed);
        assert_eq!(top.status, TaskStatus::Failed);
        assert!(f.store.get_parent_children(parent.id).await.unwrap().is_empty());
        assert_eq!(f.queue.ready_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_source_is_reported() {
        let f = fixture(100);
        let parent = submit(&f, copy("/absent", "/out").optional(true)).await;

        f.worker.process(parent.id, false, &CancellationToken::new()).await.unwrap();

        let top = f.store.get_transfer(parent.task_id).await.unwrap().unwrap();
        let stored = &top.parent_tasks[0];
        assert_eq!(stored.status, TaskStatus::FailedOpt);
        assert!(stored
            .error_message
            .as_deref()
            .is_some_and(|m| m.contains("source path")));
        assert_eq!(top.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_directory_contents_move() {
        let f = fixture(100);
        write(&f, "inbox/a.txt", 1);
        write(&f, "inbox/b.txt", 1);
        let element = TransferRequestElement::new(
            TransferUri::tapis("t1", "src", "/inbox"),
            TransferUri::tapis("t1", "src", "/done"),
        )
        .with_type(TransferType::ServiceMoveDirectoryContents);
        let parent = submit(&f, element).await;

        f.worker.process(parent.id, false, &CancellationToken::new()).await.unwrap();

        assert!(f.src.path().join("done/a.txt").exists());
        assert!(f.src.path().join("done/b.txt").exists());
        assert!(f.src.path().join("inbox").read_dir().unwrap().next().is_none());
        let top = f.store.get_transfer(parent.task_id).await.unwrap().unwrap();
        assert_eq!(top.parent_tasks[0].status, TaskStatus::Completed);
        assert_eq!(top.status, TaskStatus::Completed);
        assert_eq!(f.queue.ready_count(), 0);
    }

    fn entry(path: &str) -> FileInfo {
        FileInfo {
            path: path.to_string(),
            name: path::file_name(path).to_string(),
            size: 1,
            is_dir: false,
            native_permissions: None,
            last_modified: None,
            url: String::new(),
        }
    }

    #[test]
    fn test_relative_paths() {
        assert_eq!(relative_to("data/in", &entry("data/in/a.txt"), true), "a.txt");
        assert_eq!(relative_to("data/in", &entry("data/in/sub/b.txt"), true), "sub/b.txt");
        assert_eq!(relative_to("", &entry("top.txt"), true), "top.txt");
        assert_eq!(relative_to("data/in", &entry("data/in"), false), "");
        // A sibling that merely shares the prefix is not below the source.
        assert_eq!(relative_to("data/in", &entry("data/inner.txt"), true), "inner.txt");
    }

    #[tokio::test]
    async fn test_backend_pair_is_listed_one_level() {
        let systems = StaticSystems::new()
            .with_system(SystemDescriptor::new("t1", "src", SystemType::Globus, "/"))
            .with_system(SystemDescriptor::new("t1", "dst", SystemType::Globus, "/"));
        let stub = Arc::new(BackendStub::new(BackendTransferStatus::Active).with_directory(vec![
            listed("/in/a.dat", false, 7),
            listed("/in/nested", true, 0),
        ]));
        let store = Arc::new(MemoryTaskStore::new());
        let queue = Arc::new(MemoryQueue::new("children", 16));
        let worker = worker(&store, &queue, systems, stub.factory(), 100);
        let parent = submit_to(&store, copy("/in", "/out")).await;

        worker.process(parent.id, false, &CancellationToken::new()).await.unwrap();

        let listings = stub.listings.lock().unwrap().clone();
        assert_eq!(listings.len(), 1);
        assert!(!listings[0].recurse);
        let children = store.get_parent_children(parent.id).await.unwrap();
        assert_eq!(children.len(), 2);
        let nested = children.iter().find(|c| c.is_dir).unwrap();
        assert_eq!(nested.destination_uri, TransferUri::tapis("t1", "dst", "/out/nested"));
        let stored = store.get_parent(parent.id).await.unwrap().unwrap();
        assert_eq!(stored.total_bytes, 7);
        assert_eq!(queue.ready_count(), 2);
    }
}
