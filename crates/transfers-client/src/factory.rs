//! Backend selection
//!
//! The backend variant is picked once here, from the system type. Everything
//! above only sees `Arc<dyn RemoteDataClient>`.

use crate::client::RemoteDataClient;
use crate::globus::GlobusClient;
use crate::http::HttpClient;
use crate::irods::IrodsClient;
use crate::local::LocalClient;
use crate::pool::PoolConfig;
use crate::s3::S3Client;
use crate::ssh::{SshClient, SshPool};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use transfers_config::ClientConfig;
use transfers_types::{Error, Result, SystemDescriptor, SystemType, TransferUri};

/// Produces clients for systems and plain URLs
#[async_trait]
pub trait ClientFactory: Send + Sync {
    /// Client for a registered system
    async fn client_for_system(&self, system: &SystemDescriptor) -> Result<Arc<dyn RemoteDataClient>>;

    /// Client for an `http(s)://` source
    fn client_for_url(&self, uri: &TransferUri) -> Result<Arc<dyn RemoteDataClient>>;

    /// Client for either kind of URI; Tapis URIs need their resolved system
    async fn client_for_uri(
        &self,
        uri: &TransferUri,
        system: Option<&SystemDescriptor>,
    ) -> Result<Arc<dyn RemoteDataClient>> {
        match (uri, system) {
            (TransferUri::Http { .. }, _) => self.client_for_url(uri),
            (TransferUri::Tapis { .. }, Some(system)) => self.client_for_system(system).await,
            (TransferUri::Tapis { system_id, .. }, None) => {
                Err(Error::not_found(format!("system {system_id}")))
            }
        }
    }
}

/// Tenant, system id and effective user
type CacheKey = (String, String, String);

/// Factory for the built-in backends
pub struct DefaultClientFactory {
    config: ClientConfig,
    ssh_pool: SshPool,
    http: reqwest::Client,
    cache: Mutex<HashMap<CacheKey, (SystemDescriptor, Arc<dyn RemoteDataClient>)>>,
}

impl DefaultClientFactory {
    /// Create a factory with a fresh SSH session pool
    pub fn new(config: ClientConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.http_timeout())
            .connect_timeout(Duration::from_secs(config.ssh_connect_timeout_secs.max(1)))
            .build()
            .map_err(|e| Error::config(format!("Failed to build HTTP client: {e}")))?;
        let ssh_pool = SshPool::new(PoolConfig {
            max_per_key: config.ssh_max_sessions_per_host,
            idle_timeout: config.ssh_idle_timeout(),
            ..PoolConfig::default()
        });
        Ok(Self {
            config,
            ssh_pool,
            http,
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// Periodically drop idle SSH sessions until `shutdown` fires
    pub fn start_pool_cleanup(&self, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        self.ssh_pool.start_cleanup_task(shutdown)
    }

    fn build(&self, system: &SystemDescriptor) -> Result<Arc<dyn RemoteDataClient>> {
        let client: Arc<dyn RemoteDataClient> = match system.system_type {
            SystemType::Local => Arc::new(LocalClient::new(system, self.config.stream_chunk_size)),
            SystemType::Linux => Arc::new(SshClient::new(
                system,
                self.ssh_pool.clone(),
                self.config.ssh_connect_timeout(),
                self.config.stream_chunk_size,
            )),
            SystemType::S3 => Arc::new(S3Client::new(system)?),
            SystemType::Irods => Arc::new(IrodsClient::new(system, self.http.clone())?),
            SystemType::Globus => Arc::new(GlobusClient::new(
                system,
                &self.config.globus_base_url,
                self.http.clone(),
            )?),
            SystemType::Http => Arc::new(HttpClient::new(system.host.clone(), self.http.clone())),
        };
        Ok(client)
    }
}

#[async_trait]
impl ClientFactory for DefaultClientFactory {
    async fn client_for_system(&self, system: &SystemDescriptor) -> Result<Arc<dyn RemoteDataClient>> {
        if !system.enabled {
            return Err(Error::SystemDisabled {
                system_id: system.id.clone(),
            });
        }
        let key = (
            system.tenant.clone(),
            system.id.clone(),
            system.effective_user.clone(),
        );
        let mut cache = self
            .cache
            .lock()
            .map_err(|_| Error::other("client cache lock poisoned"))?;
        if let Some((cached, client)) = cache.get(&key) {
            // A changed descriptor, such as rotated credentials, gets a new client.
            if cached == system {
                return Ok(Arc::clone(client));
            }
        }
        debug!(tenant = %system.tenant, system = %system.id, kind = %system.system_type, "Creating client");
        let client = self.build(system)?;
        cache.insert(key, (system.clone(), Arc::clone(&client)));
        Ok(client)
    }

    fn client_for_url(&self, uri: &TransferUri) -> Result<Arc<dyn RemoteDataClient>> {
        match uri {
            TransferUri::Http { url } => Ok(Arc::new(HttpClient::new(url.clone(), self.http.clone()))),
            TransferUri::Tapis { .. } => Err(Error::validation(format!(
                "{uri} is not an http(s) URL"
            ))),
        }
    }
}
