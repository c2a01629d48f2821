//! Integration test harness for the transfers workspace
//!
//! Provides two LOCAL systems rooted in temporary directories, a config with
//! short intervals and a client factory that injects upload faults.

#![warn(missing_docs)]
#![warn(clippy::all)]

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use transfers_client::{
    BackendTransferStatus, ByteStream, Capabilities, ClientFactory, DefaultClientFactory,
    ListOptions, NativeOp, NativeOpResult, RemoteDataClient,
};
use transfers_config::Config;
use transfers_engine::{StaticSystems, TransferEngine};
use transfers_types::{
    Error, FileInfo, Result, RetryConfig, SystemDescriptor, SystemType, TaskStatus,
    TransferDetails, TransferRequest, TransferRequestElement, TransferUri,
};
use uuid::Uuid;

/// Tenant every fixture system lives in
pub const TENANT: &str = "t1";
/// User every fixture request is made by
pub const USER: &str = "alice";
/// Id of the source system
pub const SOURCE: &str = "src";
/// Id of the destination system
pub const DESTINATION: &str = "dst";

/// Configuration with intervals short enough for tests
pub fn quick_config() -> Config {
    let mut config = Config::default();
    config.workers.poll_interval_secs = 1;
    config.workers.parent_pool_size = 2;
    config.workers.child_group_count = 2;
    config.workers.child_group_size = 2;
    config.client.progress_interval_ms = 10;
    config.queue.redelivery_delay_ms = 10;
    config.retry.transfer = RetryConfig::immediate(3);
    config.retry.service = RetryConfig::immediate(2);
    config
}

/// Two LOCAL systems backed by temporary directories
pub struct LocalSystems {
    source: TempDir,
    destination: TempDir,
    disabled: Vec<String>,
}

impl LocalSystems {
    /// Create both roots
    pub fn new() -> std::io::Result<Self> {
        Ok(Self {
            source: tempfile::tempdir()?,
            destination: tempfile::tempdir()?,
            disabled: Vec::new(),
        })
    }

    /// Mark a system as disabled in the registry built afterwards
    pub fn disable(mut self, system_id: &str) -> Self {
        self.disabled.push(system_id.to_string());
        self
    }

    /// Registry holding both systems
    pub fn registry(&self) -> StaticSystems {
        [
            (SOURCE, self.source.path()),
            (DESTINATION, self.destination.path()),
        ]
        .into_iter()
        .map(|(id, root)| {
            let mut system =
                SystemDescriptor::new(TENANT, id, SystemType::Local, root.to_string_lossy());
            system.enabled = !self.disabled.iter().any(|d| d == id);
            system
        })
        .fold(StaticSystems::new(), StaticSystems::with_system)
    }

    /// Write a file of `size` bytes under the source root
    pub fn write_source(&self, relative: &str, size: usize) -> std::io::Result<PathBuf> {
        let path = self.source.path().join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content: Vec<u8> = (0..size).map(|i| ((i * 7 + 13) % 256) as u8).collect();
        std::fs::write(&path, content)?;
        Ok(path)
    }

    /// Create an empty directory under the source root
    pub fn mkdir_source(&self, relative: &str) -> std::io::Result<()> {
        std::fs::create_dir_all(self.source.path().join(relative))
    }

    /// Absolute path of a file under the source root
    pub fn source_path(&self, relative: &str) -> PathBuf {
        self.source.path().join(relative)
    }

    /// Absolute path of a file under the destination root
    pub fn destination_path(&self, relative: &str) -> PathBuf {
        self.destination.path().join(relative)
    }
}

/// URI on the source system
pub fn source_uri(path: &str) -> TransferUri {
    TransferUri::tapis(TENANT, SOURCE, path)
}

/// URI on the destination system
pub fn destination_uri(path: &str) -> TransferUri {
    TransferUri::tapis(TENANT, DESTINATION, path)
}

/// Request made by [`USER`] in [`TENANT`]
pub fn request(elements: Vec<TransferRequestElement>) -> TransferRequest {
    TransferRequest {
        tenant_id: TENANT.to_string(),
        username: USER.to_string(),
        tag: None,
        elements,
    }
}

/// Build and start an engine over the fixture systems
pub fn start_engine(
    systems: &LocalSystems,
    config: Config,
    faults: Option<Arc<Faults>>,
) -> Result<TransferEngine> {
    let mut builder = TransferEngine::builder(config.clone()).systems(Arc::new(systems.registry()));
    if let Some(faults) = faults {
        builder = builder.client_factory(Arc::new(FaultyClientFactory::new(&config, faults)?));
    }
    let engine = builder.build()?;
    engine.start();
    Ok(engine)
}

/// Poll the details of a transfer until `done` holds
pub async fn wait_for_details(
    engine: &TransferEngine,
    task_id: Uuid,
    timeout: Duration,
    done: impl Fn(&TransferDetails) -> bool,
) -> Result<TransferDetails> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let details = engine
            .service()
            .get_transfer_details(TENANT, USER, task_id)
            .await?;
        if done(&details) {
            return Ok(details);
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(Error::Timeout {
                seconds: timeout.as_secs(),
            });
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Whether any child of the transfer is moving bytes
pub fn any_child_in_progress(details: &TransferDetails) -> bool {
    details
        .parents
        .iter()
        .flat_map(|p| &p.children)
        .any(|c| c.status == TaskStatus::InProgress)
}

/// Faults injected into uploads
#[derive(Debug, Default)]
pub struct Faults {
    /// Uploads to a path containing one of these fail without retry
    pub fail_paths: Vec<String>,
    /// Uploads failing with a transient error before any succeeds
    pub transient_failures: AtomicU32,
    /// Delay before each upload starts
    pub upload_delay: Duration,
    /// Uploads that reached the backend
    pub uploads: AtomicUsize,
}

impl Faults {
    /// Fail uploads to paths containing `fragment`
    pub fn failing(fragment: &str) -> Self {
        Self {
            fail_paths: vec![fragment.to_string()],
            ..Self::default()
        }
    }

    /// Fail the first `count` uploads with a transient error
    pub fn transient(count: u32) -> Self {
        Self {
            transient_failures: AtomicU32::new(count),
            ..Self::default()
        }
    }

    /// Stall every upload for `delay`
    pub fn slow(delay: Duration) -> Self {
        Self {
            upload_delay: delay,
            ..Self::default()
        }
    }

    fn check(&self, path: &str) -> Result<()> {
        if self.fail_paths.iter().any(|f| path.contains(f.as_str())) {
            return Err(Error::unrecoverable(format!("injected failure for {path}")));
        }
        let consumed = self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if consumed {
            return Err(Error::io(format!("injected transient failure for {path}")));
        }
        Ok(())
    }
}

/// Client factory wrapping every built-in client with [`Faults`]
pub struct FaultyClientFactory {
    inner: DefaultClientFactory,
    faults: Arc<Faults>,
}

impl FaultyClientFactory {
    /// Wrap the default factory
    pub fn new(config: &Config, faults: Arc<Faults>) -> Result<Self> {
        Ok(Self {
            inner: DefaultClientFactory::new(config.client.clone())?,
            faults,
        })
    }
}

#[async_trait]
impl ClientFactory for FaultyClientFactory {
    async fn client_for_system(
        &self,
        system: &SystemDescriptor,
    ) -> Result<Arc<dyn RemoteDataClient>> {
        let inner = self.inner.client_for_system(system).await?;
        Ok(Arc::new(FaultyClient {
            inner,
            faults: Arc::clone(&self.faults),
        }))
    }

    fn client_for_url(&self, uri: &TransferUri) -> Result<Arc<dyn RemoteDataClient>> {
        self.inner.client_for_url(uri)
    }
}

struct FaultyClient {
    inner: Arc<dyn RemoteDataClient>,
    faults: Arc<Faults>,
}

#[async_trait]
impl RemoteDataClient for FaultyClient {
    fn system_type(&self) -> SystemType {
        self.inner.system_type()
    }

    fn system_id(&self) -> &str {
        self.inner.system_id()
    }

    fn capabilities(&self) -> Capabilities {
        self.inner.capabilities()
    }

    async fn list(&self, path: &str, options: &ListOptions) -> Result<Vec<FileInfo>> {
        self.inner.list(path, options).await
    }

    async fn get_file_info(&self, path: &str, follow_links: bool) -> Result<Option<FileInfo>> {
        self.inner.get_file_info(path, follow_links).await
    }

    async fn get_stream(&self, path: &str) -> Result<ByteStream> {
        self.inner.get_stream(path).await
    }

    async fn upload(&self, path: &str, stream: ByteStream) -> Result<u64> {
        if !self.faults.upload_delay.is_zero() {
            tokio::time::sleep(self.faults.upload_delay).await;
        }
        self.faults.check(path)?;
        self.faults.uploads.fetch_add(1, Ordering::SeqCst);
        self.inner.upload(path, stream).await
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        self.inner.mkdir(path).await
    }

    async fn move_path(&self, from: &str, to: &str) -> Result<()> {
        self.inner.move_path(from, to).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.inner.delete(path).await
    }

    async fn native_op(&self, op: &NativeOp, path: &str, recursive: bool) -> Result<NativeOpResult> {
        self.inner.native_op(op, path, recursive).await
    }

    async fn submit_backend_transfer(
        &self,
        src_path: &str,
        destination: &SystemDescriptor,
        dest_path: &str,
        recursive: bool,
    ) -> Result<String> {
        self.inner
            .submit_backend_transfer(src_path, destination, dest_path, recursive)
            .await
    }

    async fn backend_transfer_status(&self, external_id: &str) -> Result<BackendTransferStatus> {
        self.inner.backend_transfer_status(external_id).await
    }

    async fn cancel_backend_transfer(&self, external_id: &str) -> Result<()> {
        self.inner.cancel_backend_transfer(external_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_faults_run_out() {
        let faults = Faults::transient(2);
        assert!(faults.check("/a").unwrap_err().is_retryable());
        assert!(faults.check("/a").is_err());
        assert!(faults.check("/a").is_ok());
    }

    #[test]
    fn test_path_faults_are_permanent() {
        let faults = Faults::failing("bad");
        assert!(!faults.check("/dir/bad.txt").unwrap_err().is_retryable());
        assert!(faults.check("/dir/good.txt").is_ok());
    }

    #[tokio::test]
    async fn test_registry_marks_disabled() {
        use transfers_engine::SystemsRegistry;

        let systems = LocalSystems::new().unwrap().disable(DESTINATION);
        let registry = systems.registry();
        assert_eq!(registry.len(), 2);
        let lookup = |id| registry.get_system(TENANT, id, USER, None);
        assert!(lookup(SOURCE).await.unwrap().unwrap().enabled);
        assert!(!lookup(DESTINATION).await.unwrap().unwrap().enabled);
    }
}
