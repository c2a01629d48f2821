//! Keyed connection pooling with scoped checkout

use std::collections::HashMap;
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use transfers_types::{Error, Result};

/// Connection pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum connections checked out or idle per key
    pub max_per_key: usize,
    /// Idle connections older than this are dropped
    pub idle_timeout: Duration,
    /// How often the cleanup task runs
    pub cleanup_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_per_key: 8,
            idle_timeout: Duration::from_secs(300),
            cleanup_interval: Duration::from_secs(30),
        }
    }
}

struct Idle<T> {
    conn: T,
    last_used: Instant,
}

struct Shared<T> {
    config: PoolConfig,
    idle: Mutex<HashMap<String, Vec<Idle<T>>>>,
    limits: Mutex<HashMap<String, Arc<Semaphore>>>,
}

/// A pool of reusable connections grouped by an endpoint key.
///
/// Checked out connections are returned when the [`Pooled`] guard drops, on
/// every exit path. A guard marked broken discards its connection instead.
pub struct ConnectionPool<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for ConnectionPool<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Send + 'static> ConnectionPool<T> {
    /// Create a new connection pool
    pub fn new(config: PoolConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                idle: Mutex::new(HashMap::new()),
                limits: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn limit_for(&self, key: &str) -> Result<Arc<Semaphore>> {
        let mut limits = self
            .shared
            .limits
            .lock()
            .map_err(|_| Error::other("connection pool lock poisoned"))?;
        Ok(Arc::clone(limits.entry(key.to_string()).or_insert_with(|| {
            Arc::new(Semaphore::new(self.shared.config.max_per_key.max(1)))
        })))
    }

    fn take_idle(&self, key: &str) -> Option<T> {
        let mut idle = self.shared.idle.lock().ok()?;
        let connections = idle.get_mut(key)?;
        let timeout = self.shared.config.idle_timeout;
        while let Some(candidate) = connections.pop() {
            if candidate.last_used.elapsed() <= timeout {
                return Some(candidate.conn);
            }
        }
        None
    }

    /// Check out a connection for `key`, reusing an idle one or calling `connect`.
    ///
    /// Waits while `max_per_key` connections are already checked out.
    pub async fn checkout<F, Fut>(&self, key: &str, connect: F) -> Result<Pooled<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let permit = self
            .limit_for(key)?
            .acquire_owned()
            .await
            .map_err(|_| Error::other("connection pool closed"))?;

        let conn = match self.take_idle(key) {
            Some(conn) => {
                debug!(key, "Reusing pooled connection");
                conn
            }
            None => {
                debug!(key, "Opening new connection");
                connect().await?
            }
        };

        Ok(Pooled {
            conn: Some(conn),
            key: key.to_string(),
            shared: Arc::clone(&self.shared),
            broken: false,
            _permit: permit,
        })
    }

    /// Drop idle connections past the idle timeout
    pub fn cleanup_idle(&self) -> usize {
        let Ok(mut idle) = self.shared.idle.lock() else {
            return 0;
        };
        let timeout = self.shared.config.idle_timeout;
        let mut removed = 0;
        for connections in idle.values_mut() {
            let before = connections.len();
            connections.retain(|c| c.last_used.elapsed() <= timeout);
            removed += before - connections.len();
        }
        idle.retain(|_, v| !v.is_empty());
        if removed > 0 {
            info!("Cleaned up {} idle connections", removed);
        }
        removed
    }

    /// Number of idle connections across all keys
    pub fn idle_count(&self) -> usize {
        self.shared
            .idle
            .lock()
            .map(|idle| idle.values().map(Vec::len).sum())
            .unwrap_or(0)
    }

    /// Run [`Self::cleanup_idle`] periodically until `shutdown` fires
    pub fn start_cleanup_task(&self, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        let pool = self.clone();
        let every = self.shared.config.cleanup_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        pool.cleanup_idle();
                    }
                }
            }
        })
    }
}

/// A checked out connection
pub struct Pooled<T> {
    conn: Option<T>,
    key: String,
    shared: Arc<Shared<T>>,
    broken: bool,
    _permit: OwnedSemaphorePermit,
}

impl<T> Pooled<T> {
    /// Discard the connection instead of returning it to the pool
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }
}

impl<T> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Only taken in drop.
        self.conn.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl<T> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.conn.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl<T> Drop for Pooled<T> {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        if self.broken {
            debug!(key = %self.key, "Discarding broken connection");
            return;
        }
        if let Ok(mut idle) = self.shared.idle.lock() {
            idle.entry(self.key.clone()).or_default().push(Idle {
                conn,
                last_used: Instant::now(),
            });
        }
    }
}
