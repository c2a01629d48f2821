//! Transfer engine runtime

use crate::child::ChildTaskPipeline;
use crate::executor::{CancelRegistry, WorkerPools};
use crate::parent::ParentTaskWorker;
use crate::progress::ProgressMonitor;
use crate::request::TransferRequestService;
use crate::scheduler::FairShareScheduler;
use crate::systems::{PermissionService, StaticPermissions, StaticSystems, SystemsRegistry};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OwnedSemaphorePermit;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use transfers_client::{ClientFactory, DefaultClientFactory};
use transfers_config::Config;
use transfers_queue::{ControlChannel, MemoryQueue, Message, TaskQueue, WorkQueue};
use transfers_store::{MemoryTaskStore, TaskStore};
use transfers_types::{
    ControlAction, Error, Result, TaskStatus, TransferTask, TransferTaskChild, TransferTaskParent,
};
use uuid::Uuid;

/// Everything the background loops share
struct EngineInner {
    config: Config,
    store: Arc<dyn TaskStore>,
    parent_queue: TaskQueue<TransferTaskParent>,
    child_queue: TaskQueue<TransferTaskChild>,
    control: ControlChannel,
    scheduler: FairShareScheduler,
    parents: ParentTaskWorker,
    pipeline: ChildTaskPipeline,
    pools: WorkerPools,
    cancels: Arc<CancelRegistry>,
    default_clients: Option<Arc<DefaultClientFactory>>,
}

/// A worker process: request service plus the parent and child consumers
pub struct TransferEngine {
    inner: Arc<EngineInner>,
    service: TransferRequestService,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl std::fmt::Debug for TransferEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferEngine")
            .field("worker_id", &self.inner.config.workers.worker_id)
            .field("running", &!self.tracker.is_closed())
            .finish_non_exhaustive()
    }
}

impl TransferEngine {
    /// Build an engine with in-process collaborators
    pub fn builder(config: Config) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    /// Submit, read and cancel transfers
    pub fn service(&self) -> &TransferRequestService {
        &self.service
    }

    /// The task store the engine works on
    pub fn store(&self) -> Arc<dyn TaskStore> {
        Arc::clone(&self.inner.store)
    }

    /// Configuration the engine was built with
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Spawn the consumer loops, the scheduler and the control listener
    pub fn start(&self) {
        let inner = &self.inner;
        info!(
            worker_id = %inner.config.workers.worker_id,
            parent_workers = inner.config.workers.parent_pool_size,
            child_groups = inner.config.workers.child_group_count,
            child_group_size = inner.config.workers.child_group_size,
            "Starting transfer engine"
        );

        self.tracker.spawn(parent_loop(
            Arc::clone(inner),
            self.tracker.clone(),
            self.shutdown.clone(),
        ));
        self.tracker.spawn(child_loop(
            Arc::clone(inner),
            self.tracker.clone(),
            self.shutdown.clone(),
        ));
        self.tracker.spawn(scheduler_loop(
            Arc::clone(inner),
            self.tracker.clone(),
            self.shutdown.clone(),
        ));
        self.tracker.spawn(control_loop(Arc::clone(inner), self.shutdown.clone()));
        if let Some(clients) = &inner.default_clients {
            let cleanup = clients.start_pool_cleanup(self.shutdown.clone());
            self.tracker.spawn(async move {
                if let Err(e) = cleanup.await {
                    debug!("Pool cleanup ended abnormally: {}", e);
                }
            });
        }
    }

    /// Stop taking work and wait for in-flight tasks to finish
    pub async fn stop(&self) {
        self.shutdown.cancel();
        self.inner.parent_queue.close().await;
        self.inner.child_queue.close().await;
        self.tracker.close();
        self.tracker.wait().await;
        info!(worker_id = %self.inner.config.workers.worker_id, "Transfer engine stopped");
    }

    /// Poll the store until the transfer reaches a terminal status
    pub async fn wait_for_transfer(&self, task_id: Uuid, timeout: Duration) -> Result<TransferTask> {
        let poll = async {
            let mut interval = tokio::time::interval(Duration::from_millis(50));
            loop {
                interval.tick().await;
                match self.inner.store.get_transfer(task_id).await? {
                    Some(task) if task.is_terminal() => return Ok(task),
                    Some(_) => {}
                    None => return Err(Error::not_found(format!("transfer {task_id}"))),
                }
            }
        };
        tokio::time::timeout(timeout, poll)
            .await
            .map_err(|_| Error::Timeout {
                seconds: timeout.as_secs(),
            })?
    }
}

async fn parent_loop(inner: Arc<EngineInner>, tracker: TaskTracker, shutdown: CancellationToken) {
    loop {
        let message = tokio::select! {
            () = shutdown.cancelled() => break,
            message = inner.parent_queue.next() => message,
        };
        let message = match message {
            Ok(Some(message)) => message,
            Ok(None) => break,
            Err(e) => {
                warn!("Failed to read the parent queue: {}", e);
                tokio::time::sleep(inner.config.queue.redelivery_delay()).await;
                continue;
            }
        };
        let slot = tokio::select! {
            () = shutdown.cancelled() => break,
            slot = inner.pools.reserve_parent() => slot,
        };
        let Ok(slot) = slot else { break };

        let inner = Arc::clone(&inner);
        let shutdown = shutdown.clone();
        tracker.spawn(async move {
            consume_parent(&inner, message, slot, &shutdown).await;
        });
    }
    debug!("Parent consumer stopped");
}

async fn consume_parent(
    inner: &EngineInner,
    message: Message<TransferTaskParent>,
    slot: OwnedSemaphorePermit,
    shutdown: &CancellationToken,
) {
    let parent_id = message.body.id;
    let result = async {
        let live = inner
            .store
            .live_workers(inner.config.workers.heartbeat_timeout())
            .await?;
        if !inner
            .store
            .assign_parent(parent_id, &inner.config.workers.worker_id, &live)
            .await?
        {
            debug!(%parent_id, "Parent task is owned elsewhere or finished");
            return Ok(());
        }
        run_parent(inner, parent_id, message.redelivered, slot, shutdown).await
    }
    .await;

    let outcome = match result {
        Ok(()) => inner.parent_queue.ack(message.tag).await,
        Err(e) => {
            warn!(%parent_id, "Parent task will be redelivered: {}", e);
            tokio::time::sleep(inner.config.queue.redelivery_delay()).await;
            inner.parent_queue.nack(message.tag, true).await
        }
    };
    if let Err(e) = outcome {
        warn!(%parent_id, "Failed to settle parent message: {}", e);
    }
}

async fn run_parent(
    inner: &EngineInner,
    parent_id: Uuid,
    recovered: bool,
    slot: OwnedSemaphorePermit,
    shutdown: &CancellationToken,
) -> Result<()> {
    let _slot = slot;
    let _worker = inner.pools.parent_worker().await?;
    inner.parents.process(parent_id, recovered, shutdown).await
}

async fn child_loop(inner: Arc<EngineInner>, tracker: TaskTracker, shutdown: CancellationToken) {
    loop {
        let message = tokio::select! {
            () = shutdown.cancelled() => break,
            message = inner.child_queue.next() => message,
        };
        let message = match message {
            Ok(Some(message)) => message,
            Ok(None) => break,
            Err(e) => {
                warn!("Failed to read the child queue: {}", e);
                tokio::time::sleep(inner.config.queue.redelivery_delay()).await;
                continue;
            }
        };
        let inner = Arc::clone(&inner);
        tracker.spawn(async move {
            consume_child(&inner, message).await;
        });
    }
    debug!("Child consumer stopped");
}

async fn consume_child(inner: &EngineInner, message: Message<TransferTaskChild>) {
    let child = &message.body;
    let guard = inner.cancels.register(child.task_id);
    let result = match inner.pools.child_worker(child.task_id).await {
        Ok(_permit) => inner.pipeline.run(child.id, guard.token()).await,
        Err(e) => Err(e),
    };
    drop(guard);

    // Failures are already recorded on the task; the message is not retried.
    let outcome = match result {
        Ok(()) => inner.child_queue.ack(message.tag).await,
        Err(e) => {
            debug!(child_id = %child.id, "Dropping child message: {}", e);
            inner.child_queue.nack(message.tag, false).await
        }
    };
    if let Err(e) = outcome {
        warn!(child_id = %child.id, "Failed to settle child message: {}", e);
    }
}

async fn scheduler_loop(inner: Arc<EngineInner>, tracker: TaskTracker, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(inner.config.workers.poll_interval().max(Duration::from_millis(10)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }
        // Only ask for as much as can be taken on right now.
        let available = inner.pools.parent_slots_available();
        let claimed = match inner.scheduler.claim_parents(available).await {
            Ok(claimed) => claimed,
            Err(e) => {
                warn!("Scheduler poll failed: {}", e);
                continue;
            }
        };
        for parent in claimed {
            let Ok(slot) = inner.pools.reserve_parent().await else {
                break;
            };
            let inner = Arc::clone(&inner);
            let shutdown = shutdown.clone();
            tracker.spawn(async move {
                let recovered = parent.status != TaskStatus::Accepted;
                if let Err(e) = run_parent(&inner, parent.id, recovered, slot, &shutdown).await {
                    warn!(parent_id = %parent.id, "Scheduled parent task failed: {}", e);
                }
            });
        }
    }
    debug!("Scheduler stopped");
}

async fn control_loop(inner: Arc<EngineInner>, shutdown: CancellationToken) {
    let mut subscriber = inner.control.subscribe();
    loop {
        let message = tokio::select! {
            () = shutdown.cancelled() => break,
            message = subscriber.recv() => message,
        };
        let Some(message) = message else { break };
        match message.action {
            ControlAction::Cancel => {
                if inner.cancels.cancel(message.task_id) {
                    info!(task_id = %message.task_id, "Interrupted in-flight children");
                }
            }
        }
    }
    debug!("Control listener stopped");
}

/// Assembles a [`TransferEngine`]
pub struct EngineBuilder {
    config: Config,
    store: Option<Arc<dyn TaskStore>>,
    parent_queue: Option<Arc<dyn WorkQueue>>,
    child_queue: Option<Arc<dyn WorkQueue>>,
    control: Option<ControlChannel>,
    systems: Option<Arc<dyn SystemsRegistry>>,
    permissions: Option<Arc<dyn PermissionService>>,
    clients: Option<Arc<dyn ClientFactory>>,
}

impl EngineBuilder {
    /// Start from `config`; unset collaborators get in-process defaults
    pub fn new(config: Config) -> Self {
        Self {
            config,
            store: None,
            parent_queue: None,
            child_queue: None,
            control: None,
            systems: None,
            permissions: None,
            clients: None,
        }
    }

    /// Use a task store
    pub fn store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use a parent queue
    pub fn parent_queue(mut self, queue: Arc<dyn WorkQueue>) -> Self {
        self.parent_queue = Some(queue);
        self
    }

    /// Use a child queue
    pub fn child_queue(mut self, queue: Arc<dyn WorkQueue>) -> Self {
        self.child_queue = Some(queue);
        self
    }

    /// Use a control channel, shared with other engines in the same process
    pub fn control(mut self, control: ControlChannel) -> Self {
        self.control = Some(control);
        self
    }

    /// Use a systems registry
    pub fn systems(mut self, systems: Arc<dyn SystemsRegistry>) -> Self {
        self.systems = Some(systems);
        self
    }

    /// Use a permission service
    pub fn permissions(mut self, permissions: Arc<dyn PermissionService>) -> Self {
        self.permissions = Some(permissions);
        self
    }

    /// Use a client factory
    pub fn client_factory(mut self, clients: Arc<dyn ClientFactory>) -> Self {
        self.clients = Some(clients);
        self
    }

    /// Build the engine
    pub fn build(self) -> Result<TransferEngine> {
        let config = self.config;
        for (name, retry) in [("transfer", &config.retry.transfer), ("service", &config.retry.service)] {
            retry
                .validate()
                .map_err(|e| Error::config(format!("retry.{name}: {e}")))?;
        }

        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryTaskStore::new()));
        let parent_queue = TaskQueue::new(self.parent_queue.unwrap_or_else(|| {
            Arc::new(MemoryQueue::new("parents", config.queue.parent_prefetch))
        }));
        let child_queue = TaskQueue::new(self.child_queue.unwrap_or_else(|| {
            Arc::new(MemoryQueue::new("children", config.queue.child_prefetch))
        }));
        let control = self
            .control
            .unwrap_or_else(|| ControlChannel::new(config.queue.control_capacity));
        let systems = self
            .systems
            .unwrap_or_else(|| Arc::new(StaticSystems::new()));
        let permissions = self
            .permissions
            .unwrap_or_else(|| Arc::new(StaticPermissions::allow_all()));
        let (clients, default_clients) = match self.clients {
            Some(clients) => (clients, None),
            None => {
                let factory = Arc::new(DefaultClientFactory::new(config.client.clone())?);
                (Arc::clone(&factory) as Arc<dyn ClientFactory>, Some(factory))
            }
        };

        let service = TransferRequestService::new(
            Arc::clone(&store),
            parent_queue.clone(),
            control.clone(),
            Arc::clone(&systems),
            permissions,
            config.security.clone(),
        );
        let scheduler = FairShareScheduler::new(
            Arc::clone(&store),
            config.workers.worker_id.clone(),
            config.scheduler.clone(),
            config.workers.heartbeat_timeout(),
        );
        let parents = ParentTaskWorker::new(
            Arc::clone(&store),
            child_queue.clone(),
            Arc::clone(&systems),
            Arc::clone(&clients),
            config.limits.clone(),
            &config.retry,
        );
        let pipeline = ChildTaskPipeline::new(
            Arc::clone(&store),
            systems,
            clients,
            ProgressMonitor::new(Arc::clone(&store), config.client.progress_interval()),
            config.retry.clone(),
            config.client.globus_poll_interval(),
        );

        let inner = EngineInner {
            pools: WorkerPools::new(&config.workers),
            cancels: Arc::new(CancelRegistry::new()),
            config,
            store,
            parent_queue,
            child_queue,
            control,
            scheduler,
            parents,
            pipeline,
            default_clients,
        };
        Ok(TransferEngine {
            inner: Arc::new(inner),
            service,
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        })
    }
}
