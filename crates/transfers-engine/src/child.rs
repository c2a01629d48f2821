//! Child task pipeline
//!
//! Every stage re-reads the child from the store before acting, so a redelivered
//! message or a concurrent cancellation is observed instead of overwritten.

use crate::progress::ProgressMonitor;
use crate::retry::{retry_with_backoff, RetryOn};
use crate::rollup;
use crate::systems::{resolve_system, SystemsRegistry};
use futures::StreamExt;
use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use transfers_client::{
    BackendTransferStatus, ByteStream, ClientFactory, NativeOp, RemoteDataClient,
};
use transfers_config::RetrySettings;
use transfers_store::{StatusChange, TaskStore};
use transfers_types::{
    Error, Result, SystemDescriptor, TaskStatus, TransferTaskChild, TransferTaskParent, TransferUri,
};
use uuid::Uuid;

/// Runs child tasks through their stages
#[derive(Clone)]
pub struct ChildTaskPipeline {
    store: Arc<dyn TaskStore>,
    systems: Arc<dyn SystemsRegistry>,
    clients: Arc<dyn ClientFactory>,
    progress: ProgressMonitor,
    retry: RetrySettings,
    poll_interval: Duration,
    in_flight: InFlight,
}

/// Children this process is running right now
#[derive(Clone, Default)]
struct InFlight(Arc<Mutex<HashSet<Uuid>>>);

impl InFlight {
    /// `None` when the child is already held
    fn claim(&self, child_id: Uuid) -> Option<Claim> {
        let mut ids = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        ids.insert(child_id).then(|| Claim {
            ids: Arc::clone(&self.0),
            child_id,
        })
    }
}

/// Releases its child when dropped
struct Claim {
    ids: Arc<Mutex<HashSet<Uuid>>>,
    child_id: Uuid,
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.child_id);
    }
}

/// Both ends of one child transfer
struct Endpoints {
    source: Arc<dyn RemoteDataClient>,
    destination: Arc<dyn RemoteDataClient>,
    destination_system: SystemDescriptor,
}

impl ChildTaskPipeline {
    /// Create a pipeline. `poll_interval` paces status checks of backend
    /// managed transfers.
    pub fn new(
        store: Arc<dyn TaskStore>,
        systems: Arc<dyn SystemsRegistry>,
        clients: Arc<dyn ClientFactory>,
        progress: ProgressMonitor,
        retry: RetrySettings,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            systems,
            clients,
            progress,
            retry,
            poll_interval,
            in_flight: InFlight::default(),
        }
    }

    /// Run one child to completion.
    ///
    /// `cancel` fires when the owning transfer is cancelled. A failure is
    /// recorded on the task before it is returned, so the caller only has to
    /// drop the message. A second delivery of a child this pipeline is still
    /// running returns straight away.
    pub async fn run(&self, child_id: Uuid, cancel: &CancellationToken) -> Result<()> {
        let Some(_claim) = self.in_flight.claim(child_id) else {
            debug!(%child_id, "Child task already running here, dropping duplicate delivery");
            return Ok(());
        };
        match self.stages(child_id, cancel).await {
            Ok(()) => Ok(()),
            Err(e) => self.handle_error(child_id, e).await,
        }
    }

    async fn stages(&self, child_id: Uuid, cancel: &CancellationToken) -> Result<()> {
        let service = &self.retry.service;

        let Some(child) = retry_with_backoff(service, RetryOn::ServiceErrors, "activate", cancel, |_| {
            self.activate(child_id)
        })
        .await?
        else {
            return Ok(());
        };

        let Some(bytes) = retry_with_backoff(
            &self.retry.transfer,
            RetryOn::TransientIo,
            "transfer",
            cancel,
            |_| self.transfer(child_id, cancel),
        )
        .await?
        else {
            return Ok(());
        };

        let finished = retry_with_backoff(service, RetryOn::ServiceErrors, "finalize", cancel, |_| {
            self.finalize(child_id, bytes)
        })
        .await?;
        if !finished {
            return Ok(());
        }

        retry_with_backoff(service, RetryOn::ServiceErrors, "rollup", cancel, |_| {
            rollup::check(self.store.as_ref(), child.parent_task_id, child.task_id)
        })
        .await?;

        self.after_rollup(&child).await?;

        trace!(%child_id, "Child pipeline finished");
        Ok(())
    }

    /// Returns the child when it should be transferred. A child left
    /// IN_PROGRESS by a crashed worker is resumed.
    async fn activate(&self, child_id: Uuid) -> Result<Option<TransferTaskChild>> {
        let Some(child) = self.store.get_child(child_id).await? else {
            warn!(%child_id, "Child task no longer exists");
            return Ok(None);
        };
        if child.is_terminal() {
            // Re-applying the terminal status stamps a missing end time.
            self.store
                .set_child_status(child_id, StatusChange::to(child.status))
                .await?;
            debug!(%child_id, status = %child.status, "Child task already finished");
            return Ok(None);
        }
        if !self
            .store
            .set_child_status(child_id, StatusChange::to(TaskStatus::InProgress))
            .await?
            .reached()
        {
            return Ok(None);
        }
        self.store
            .set_parent_status(child.parent_task_id, StatusChange::to(TaskStatus::InProgress))
            .await?;
        Ok(Some(child))
    }

    /// Move the bytes. Returns `None` when the child finished elsewhere.
    async fn transfer(&self, child_id: Uuid, cancel: &CancellationToken) -> Result<Option<u64>> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let Some(child) = self.store.get_child(child_id).await? else {
            return Ok(None);
        };
        if child.is_terminal() {
            return Ok(None);
        }
        let attempt = self.store.increment_child_retries(child_id).await?;
        let parent = self
            .store
            .get_parent(child.parent_task_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("parent task {}", child.parent_task_id)))?;
        let endpoints = self.endpoints(&child, &parent).await?;
        debug!(
            %child_id,
            attempt,
            source = %child.source_uri,
            destination = %child.destination_uri,
            "Transferring"
        );

        let source_caps = endpoints.source.capabilities();
        let destination_caps = endpoints.destination.capabilities();
        let backend_pair = source_caps.backend_transfers
            && destination_caps.backend_transfers
            && endpoints.source.system_type() == endpoints.destination.system_type();
        let dst_path = child.destination_uri.path();

        if backend_pair {
            return self.backend_transfer(&child, &endpoints, cancel).await.map(Some);
        }
        if child.is_dir {
            endpoints.destination.mkdir(dst_path).await?;
            return Ok(Some(0));
        }

        let bytes = self.stream(&child, &endpoints, cancel).await?;
        if source_caps.native_ops && destination_caps.native_ops {
            self.copy_exec_bit(&child, &endpoints).await?;
        }
        Ok(Some(bytes))
    }

    async fn endpoints(
        &self,
        child: &TransferTaskChild,
        parent: &TransferTaskParent,
    ) -> Result<Endpoints> {
        let source = match &child.source_uri {
            TransferUri::Http { .. } => self.clients.client_for_url(&child.source_uri)?,
            uri @ TransferUri::Tapis { .. } => {
                let system = resolve_system(
                    self.systems.as_ref(),
                    uri,
                    &child.username,
                    parent.src_shared_ctx.as_deref(),
                )
                .await?;
                self.clients.client_for_system(&system).await?
            }
        };
        let system = resolve_system(
            self.systems.as_ref(),
            &child.destination_uri,
            &child.username,
            parent.dest_shared_ctx.as_deref(),
        )
        .await?;
        let destination = self.clients.client_for_system(&system).await?;
        Ok(Endpoints {
            source,
            destination,
            destination_system: system,
        })
    }

    async fn stream(
        &self,
        child: &TransferTaskChild,
        endpoints: &Endpoints,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let tracker = self.progress.track(child.id);
        let counter = tracker.counter();
        let mut seen = 0u64;
        let counted: ByteStream = Box::pin(
            endpoints
                .source
                .get_stream(child.source_uri.path())
                .await?
                .inspect(move |chunk| {
                    if let Ok(bytes) = chunk {
                        seen += bytes.len() as u64;
                        counter.fetch_max(seen, Ordering::AcqRel);
                    }
                }),
        );

        let written = tokio::select! {
            () = cancel.cancelled() => return Err(Error::Cancelled),
            written = endpoints.destination.upload(child.destination_uri.path(), counted) => written?,
        };
        tracker.update(written);
        tracker.finish().await
    }

    /// Carry the source's execute bits over to a POSIX destination
    async fn copy_exec_bit(&self, child: &TransferTaskChild, endpoints: &Endpoints) -> Result<()> {
        let Some(info) = endpoints
            .source
            .get_file_info(child.source_uri.path(), true)
            .await?
        else {
            return Ok(());
        };
        let Some(mode) = info.mode().filter(|_| info.is_executable()) else {
            return Ok(());
        };
        let op = NativeOp::Chmod(format!("{:03o}", mode & 0o777));
        let result = endpoints
            .destination
            .native_op(&op, child.destination_uri.path(), false)
            .await?;
        if result.exit_code != 0 {
            warn!(
                child_id = %child.id,
                exit_code = result.exit_code,
                "Could not copy permissions: {}",
                result.stderr.trim()
            );
        }
        Ok(())
    }

    /// Start or resume a transfer run by the backend and wait for it
    async fn backend_transfer(
        &self,
        child: &TransferTaskChild,
        endpoints: &Endpoints,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let source = &endpoints.source;
        let destination = &endpoints.destination_system;

        let external_id = match &child.external_task_id {
            Some(id) => id.clone(),
            None => {
                let id = source
                    .submit_backend_transfer(
                        child.source_uri.path(),
                        destination,
                        child.destination_uri.path(),
                        child.is_dir,
                    )
                    .await?;
                self.store.set_child_external_id(child.id, &id).await?;
                info!(child_id = %child.id, external_id = %id, "Submitted backend transfer");
                id
            }
        };

        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    Self::cancel_backend(source.as_ref(), child.id, &external_id).await;
                    return Err(Error::Cancelled);
                }
                _ = interval.tick() => {}
            }
            // A cancellation broadcast can be missed, the store is authoritative.
            match self.store.get_child(child.id).await? {
                Some(current) if current.status == TaskStatus::Completed => {
                    return Ok(child.total_bytes);
                }
                Some(current) if !current.is_terminal() => {}
                current => {
                    info!(
                        child_id = %child.id,
                        %external_id,
                        status = ?current.map(|c| c.status),
                        "Child finished elsewhere, stopping backend transfer"
                    );
                    Self::cancel_backend(source.as_ref(), child.id, &external_id).await;
                    return Err(Error::Cancelled);
                }
            }
            match source.backend_transfer_status(&external_id).await? {
                BackendTransferStatus::Active => {}
                BackendTransferStatus::Succeeded => return Ok(child.total_bytes),
                BackendTransferStatus::Failed(reason) => {
                    return Err(Error::unrecoverable(format!(
                        "Backend transfer {external_id} failed: {reason}"
                    )))
                }
                BackendTransferStatus::Cancelled => return Err(Error::Cancelled),
            }
        }
    }

    async fn cancel_backend(source: &dyn RemoteDataClient, child_id: Uuid, external_id: &str) {
        if let Err(e) = source.cancel_backend_transfer(external_id).await {
            warn!(%child_id, %external_id, "Failed to cancel backend transfer: {}", e);
        }
    }

    /// Final stage. Nothing runs after the rollup yet.
    #[allow(clippy::unused_self, clippy::unused_async)]
    async fn after_rollup(&self, child: &TransferTaskChild) -> Result<()> {
        trace!(child_id = %child.id, "After rollup");
        Ok(())
    }

    /// Returns whether the child was completed by this call
    async fn finalize(&self, child_id: Uuid, bytes: u64) -> Result<bool> {
        let Some(child) = self.store.get_child(child_id).await? else {
            return Ok(false);
        };
        if child.is_terminal() {
            self.store
                .set_child_status(child_id, StatusChange::to(child.status))
                .await?;
            return Ok(false);
        }
        self.store.record_child_progress(child_id, bytes).await?;
        Ok(self
            .store
            .set_child_status(child_id, StatusChange::to(TaskStatus::Completed))
            .await?
            .reached())
    }

    /// Record an unrecovered error and propagate it upwards as far as the
    /// optional flags allow. Cancellation is recorded as such and swallowed.
    async fn handle_error(&self, child_id: Uuid, cause: Error) -> Result<()> {
        let Some(child) = self.store.get_child(child_id).await? else {
            return Err(cause);
        };

        if cause.is_cancelled() {
            self.store
                .set_child_status(child_id, StatusChange::to(TaskStatus::Cancelled))
                .await?;
            info!(%child_id, task_id = %child.task_id, "Child task cancelled");
            rollup::check(self.store.as_ref(), child.parent_task_id, child.task_id).await?;
            return Ok(());
        }

        let message = cause.to_string();
        let status = TaskStatus::failure_for(child.optional);
        error!(%child_id, task_id = %child.task_id, %status, "Child task failed: {}", message);
        self.store
            .set_child_status(child_id, StatusChange::failed(status, message.clone()))
            .await?;

        if !child.optional {
            if let Some(parent) = self.store.get_parent(child.parent_task_id).await? {
                let reason = format!("Child task {child_id} failed: {message}");
                self.store
                    .set_parent_status(
                        parent.id,
                        StatusChange::failed(TaskStatus::failure_for(parent.optional), reason.clone()),
                    )
                    .await?;
                if !parent.optional {
                    self.store
                        .set_transfer_status(parent.task_id, StatusChange::failed(TaskStatus::Failed, reason))
                        .await?;
                }
            }
        }
        rollup::check(self.store.as_ref(), child.parent_task_id, child.task_id).await?;
        Err(cause)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::systems::StaticSystems;
    use crate::testing::BackendStub;
    use rstest::rstest;
    use std::path::Path;
    use tempfile::TempDir;
    use transfers_client::DefaultClientFactory;
    use transfers_config::ClientConfig;
    use transfers_store::MemoryTaskStore;
    use transfers_types::{SystemType, TransferRequestElement, TransferTask};

    struct Fixture {
        src: TempDir,
        dst: TempDir,
        store: Arc<MemoryTaskStore>,
        pipeline: ChildTaskPipeline,
        parent: TransferTaskParent,
    }

    async fn fixture(optional: bool, disabled_destination: bool) -> Fixture {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        std::fs::write(src.path().join("a.txt"), b"hello world").unwrap();

        let mut destination = SystemDescriptor::new("t1", "dst", SystemType::Local, path_str(dst.path()));
        destination.enabled = !disabled_destination;
        let systems = StaticSystems::new()
            .with_system(SystemDescriptor::new("t1", "src", SystemType::Local, path_str(src.path())))
            .with_system(destination);

        let store = Arc::new(MemoryTaskStore::new());
        let parent = submit(&store, optional).await;
        let pipeline = pipeline(
            &store,
            systems,
            Arc::new(DefaultClientFactory::new(ClientConfig::default()).unwrap()),
        );
        Fixture {
            src,
            dst,
            store,
            pipeline,
            parent,
        }
    }

    async fn submit(store: &MemoryTaskStore, optional: bool) -> TransferTaskParent {
        let mut task = TransferTask::new("t1", "alice", None);
        let element = TransferRequestElement::new(
            TransferUri::tapis("t1", "src", "/"),
            TransferUri::tapis("t1", "dst", "/out"),
        )
        .optional(optional);
        let parent = TransferTaskParent::new(&task, &element);
        task.parent_tasks.push(parent.clone());
        store.create_transfer(&task).await.unwrap();
        parent
    }

    fn pipeline(
        store: &Arc<MemoryTaskStore>,
        systems: StaticSystems,
        clients: Arc<dyn ClientFactory>,
    ) -> ChildTaskPipeline {
        ChildTaskPipeline::new(
            store.clone(),
            Arc::new(systems),
            clients,
            ProgressMonitor::new(store.clone(), Duration::from_millis(10)),
            RetrySettings {
                transfer: transfers_types::RetryConfig::immediate(2),
                service: transfers_types::RetryConfig::immediate(2),
                parent_attempts: 1,
            },
            Duration::from_millis(10),
        )
    }

    struct BackendFixture {
        store: Arc<MemoryTaskStore>,
        pipeline: ChildTaskPipeline,
        parent: TransferTaskParent,
        stub: Arc<BackendStub>,
    }

    /// Both ends are collections of a backend that runs transfers itself
    async fn backend_fixture(optional: bool, status: BackendTransferStatus) -> BackendFixture {
        let systems = StaticSystems::new()
            .with_system(SystemDescriptor::new("t1", "src", SystemType::Globus, "/"))
            .with_system(SystemDescriptor::new("t1", "dst", SystemType::Globus, "/"));
        let stub = Arc::new(BackendStub::new(status));
        let store = Arc::new(MemoryTaskStore::new());
        let parent = submit(&store, optional).await;
        let pipeline = pipeline(&store, systems, stub.factory());
        BackendFixture {
            store,
            pipeline,
            parent,
            stub,
        }
    }

    fn path_str(path: &Path) -> String {
        path.to_string_lossy().into_owned()
    }

    async fn stage(f: &Fixture, name: &str, size: u64) -> TransferTaskChild {
        stage_child(&f.store, &f.parent, name, size).await
    }

    async fn stage_child(
        store: &MemoryTaskStore,
        parent: &TransferTaskParent,
        name: &str,
        size: u64,
    ) -> TransferTaskChild {
        let child = TransferTaskChild::new(
            parent,
            parent.source_uri.join(name),
            parent.destination_uri.join(name),
            false,
            size,
        );
        store
            .stage_parent(parent.id, size, vec![child.clone()])
            .await
            .unwrap();
        child
    }

    #[tokio::test]
    async fn test_copies_file_and_rolls_up() {
        let f = fixture(false, false).await;
        let child = stage(&f, "a.txt", 11).await;

        f.pipeline.run(child.id, &CancellationToken::new()).await.unwrap();

        assert_eq!(std::fs::read(f.dst.path().join("out/a.txt")).unwrap(), b"hello world");
        let stored = f.store.get_child(child.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert_eq!(stored.bytes_transferred, 11);
        assert_eq!(stored.retries, 1);
        assert!(stored.end_time.is_some());
        let top = f.store.get_transfer(f.parent.task_id).await.unwrap().unwrap();
        assert_eq!(top.parent_tasks[0].status, TaskStatus::Completed);
        assert_eq!(top.parent_tasks[0].bytes_transferred, 11);
        assert_eq!(top.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_redelivery_does_not_double_count() {
        let f = fixture(false, false).await;
        let child = stage(&f, "a.txt", 11).await;

        f.pipeline.run(child.id, &CancellationToken::new()).await.unwrap();
        f.pipeline.run(child.id, &CancellationToken::new()).await.unwrap();

        let stored = f.store.get_child(child.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert_eq!(stored.retries, 1);
        let parent = f.store.get_parent(f.parent.id).await.unwrap().unwrap();
        assert_eq!(parent.bytes_transferred, 11);
    }

    #[tokio::test]
    async fn test_missing_source_fails_required_ancestors() {
        let f = fixture(false, false).await;
        let child = stage(&f, "missing.txt", 5).await;

        assert!(f.pipeline.run(child.id, &CancellationToken::new()).await.is_err());

        let top = f.store.get_transfer(f.parent.task_id).await.unwrap().unwrap();
        assert_eq!(top.parent_tasks[0].status, TaskStatus::Failed);
        assert_eq!(top.status, TaskStatus::Failed);
        let stored = f.store.get_child(child.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert!(stored.error_message.is_some());
    }

    #[tokio::test]
    async fn test_optional_failure_keeps_transfer_alive() {
        let f = fixture(true, false).await;
        let child = stage(&f, "missing.txt", 5).await;

        assert!(f.pipeline.run(child.id, &CancellationToken::new()).await.is_err());

        let top = f.store.get_transfer(f.parent.task_id).await.unwrap().unwrap();
        assert_eq!(top.parent_tasks[0].status, TaskStatus::FailedOpt);
        assert_eq!(top.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_disabled_system_is_not_retried() {
        let f = fixture(false, true).await;
        let child = stage(&f, "a.txt", 11).await;

        let err = f.pipeline.run(child.id, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::SystemDisabled { .. }));
        let stored = f.store.get_child(child.id).await.unwrap().unwrap();
        assert_eq!(stored.retries, 1);
        assert_eq!(stored.status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_cancelled_child_is_not_failed() {
        let f = fixture(false, false).await;
        let child = stage(&f, "a.txt", 11).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        f.pipeline.run(child.id, &cancel).await.unwrap();

        let stored = f.store.get_child(child.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Cancelled);
        assert!(!f.dst.path().join("out/a.txt").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exec_bit_follows_the_file() {
        use std::os::unix::fs::PermissionsExt;

        let f = fixture(false, false).await;
        let script = f.src.path().join("run.sh");
        std::fs::write(&script, b"#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        let child = stage(&f, "run.sh", 10).await;

        f.pipeline.run(child.id, &CancellationToken::new()).await.unwrap();

        let copied = std::fs::metadata(f.dst.path().join("out/run.sh")).unwrap();
        assert_eq!(copied.permissions().mode() & 0o777, 0o755);
    }

    #[tokio::test]
    async fn test_duplicate_delivery_is_skipped_while_running() {
        let f = fixture(false, false).await;
        let child = stage(&f, "a.txt", 11).await;

        let held = f.pipeline.in_flight.claim(child.id).unwrap();
        assert!(f.pipeline.in_flight.claim(child.id).is_none());
        f.pipeline.run(child.id, &CancellationToken::new()).await.unwrap();

        let stored = f.store.get_child(child.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Accepted);
        assert_eq!(stored.retries, 0);
        assert!(!f.dst.path().join("out/a.txt").exists());

        drop(held);
        f.pipeline.run(child.id, &CancellationToken::new()).await.unwrap();
        let stored = f.store.get_child(child.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert_eq!(stored.retries, 1);
    }

    #[tokio::test]
    async fn test_in_progress_child_is_resumed() {
        let f = fixture(false, false).await;
        let child = stage(&f, "a.txt", 11).await;
        f.store
            .set_child_status(child.id, StatusChange::to(TaskStatus::InProgress))
            .await
            .unwrap();

        f.pipeline.run(child.id, &CancellationToken::new()).await.unwrap();

        let stored = f.store.get_child(child.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert_eq!(stored.bytes_transferred, 11);
    }

    #[tokio::test]
    async fn test_after_rollup_stage_passes_through() {
        let f = fixture(false, false).await;
        let child = stage(&f, "a.txt", 11).await;

        f.pipeline.after_rollup(&child).await.unwrap();

        let stored = f.store.get_child(child.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Accepted);
        assert_eq!(stored.retries, 0);
    }

    #[tokio::test]
    async fn test_backend_transfer_records_external_id() {
        let f = backend_fixture(false, BackendTransferStatus::Succeeded).await;
        let child = stage_child(&f.store, &f.parent, "a.dat", 42).await;

        f.pipeline.run(child.id, &CancellationToken::new()).await.unwrap();

        let stored = f.store.get_child(child.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert_eq!(stored.external_task_id.as_deref(), Some("ext-1"));
        assert_eq!(stored.bytes_transferred, 42);
        assert_eq!(f.stub.submitted.lock().unwrap().len(), 1);
        assert_eq!(*f.stub.polled.lock().unwrap(), vec!["ext-1".to_string()]);
        let top = f.store.get_transfer(f.parent.task_id).await.unwrap().unwrap();
        assert_eq!(top.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_backend_transfer_resumes_recorded_id() {
        let f = backend_fixture(false, BackendTransferStatus::Succeeded).await;
        let child = stage_child(&f.store, &f.parent, "a.dat", 42).await;
        f.store.set_child_external_id(child.id, "ext-earlier").await.unwrap();

        f.pipeline.run(child.id, &CancellationToken::new()).await.unwrap();

        assert!(f.stub.submitted.lock().unwrap().is_empty());
        assert_eq!(*f.stub.polled.lock().unwrap(), vec!["ext-earlier".to_string()]);
        let stored = f.store.get_child(child.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
    }

    #[rstest]
    #[case::required_failure(BackendTransferStatus::Failed("quota".into()), false, TaskStatus::Failed, TaskStatus::Failed)]
    #[case::optional_failure(BackendTransferStatus::Failed("quota".into()), true, TaskStatus::FailedOpt, TaskStatus::Completed)]
    #[case::cancelled(BackendTransferStatus::Cancelled, false, TaskStatus::Cancelled, TaskStatus::Cancelled)]
    #[tokio::test]
    async fn test_backend_outcome_is_translated(
        #[case] outcome: BackendTransferStatus,
        #[case] optional: bool,
        #[case] child_status: TaskStatus,
        #[case] top_status: TaskStatus,
    ) {
        let f = backend_fixture(optional, outcome).await;
        let child = stage_child(&f.store, &f.parent, "a.dat", 42).await;

        let result = f.pipeline.run(child.id, &CancellationToken::new()).await;
        assert_eq!(result.is_err(), child_status != TaskStatus::Cancelled);

        let stored = f.store.get_child(child.id).await.unwrap().unwrap();
        assert_eq!(stored.status, child_status);
        assert_eq!(stored.retries, 1);
        let top = f.store.get_transfer(f.parent.task_id).await.unwrap().unwrap();
        assert_eq!(top.status, top_status);
    }

    #[tokio::test]
    async fn test_store_cancel_stops_backend_polling() {
        let f = backend_fixture(false, BackendTransferStatus::Active).await;
        let child = stage_child(&f.store, &f.parent, "a.dat", 42).await;

        let pipeline = f.pipeline.clone();
        let child_id = child.id;
        // The token never fires, only the store knows about the cancel.
        let handle = tokio::spawn(async move { pipeline.run(child_id, &CancellationToken::new()).await });
        tokio::time::timeout(Duration::from_secs(2), async {
            while f.stub.polled.lock().unwrap().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert!(f.store.cancel_transfer(f.parent.task_id).await.unwrap());
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert_eq!(*f.stub.cancelled.lock().unwrap(), vec!["ext-1".to_string()]);
        let stored = f.store.get_child(child.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Cancelled);
    }
}
