//! Configuration management for the transfers engine
//!
//! Configuration is assembled once at process start from built-in defaults, an
//! optional YAML/TOML/JSON file and `TRANSFERS__`-prefixed environment variables,
//! validated, and then handed to every component explicitly.
//!
//! # Examples
//!
//! ```rust,no_run
//! use transfers_config::ConfigBuilder;
//!
//! let config = ConfigBuilder::new()
//!     .add_defaults()
//!     .add_source_file("transfers.yaml")
//!     .add_env_prefix("TRANSFERS")
//!     .build()
//!     .expect("Failed to load configuration");
//!
//! println!("Parent workers: {}", config.workers.parent_pool_size);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use transfers_types::RetryConfig;

pub mod builder;
pub mod error;
pub mod loader;

pub use builder::ConfigBuilder;
pub use error::{ConfigError, ConfigResult};
pub use loader::ConfigLoader;

/// Environment variable prefix used by the loaders
pub const ENV_PREFIX: &str = "TRANSFERS";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Worker pools and polling
    pub workers: WorkersConfig,
    /// Parent task scheduling
    pub scheduler: SchedulerConfig,
    /// Retry policies per stage
    pub retry: RetrySettings,
    /// Anti-abuse limits
    pub limits: LimitsConfig,
    /// Remote data client tuning
    pub client: ClientConfig,
    /// Work queue consumption
    pub queue: QueueConfig,
    /// Trusted identities
    pub security: SecurityConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Worker pools and polling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkersConfig {
    /// Identity this process claims parent tasks under
    pub worker_id: String,
    /// Concurrent parent tasks
    pub parent_pool_size: usize,
    /// Number of child groups, children are routed by a hash of their top task id
    pub child_group_count: usize,
    /// Concurrent children per group
    pub child_group_size: usize,
    /// In-flight ceiling as a multiple of the pool sizes
    pub capacity_multiplier: usize,
    /// Scheduler polling interval in seconds
    pub poll_interval_secs: u64,
    /// Seconds without a heartbeat before a worker is considered dead
    pub heartbeat_timeout_secs: u64,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            worker_id: uuid::Uuid::new_v4().to_string(),
            parent_pool_size: num_cpus::get().max(1),
            child_group_count: 8,
            child_group_size: 4,
            capacity_multiplier: 5,
            poll_interval_secs: 5,
            heartbeat_timeout_secs: 60,
        }
    }
}

impl WorkersConfig {
    /// Scheduler polling interval
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Heartbeat liveness window
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    /// Maximum parent tasks in flight before the worker stops polling
    pub fn parent_capacity(&self) -> usize {
        self.parent_pool_size * self.capacity_multiplier
    }
}

/// Parent task scheduling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Upper bound of tasks returned per poll
    pub max_tasks_per_poll: usize,
    /// Tasks taken from one (tenant, user) group before moving on
    pub per_user_depth: usize,
    /// Accepted parents older than this are picked up even if their
    /// queue message was lost
    pub accepted_grace_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_tasks_per_poll: 50,
            per_user_depth: 10,
            accepted_grace_secs: 60,
        }
    }
}

/// Retry policies per stage
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Byte transfer stage
    pub transfer: RetryConfig,
    /// Bookkeeping stages
    pub service: RetryConfig,
    /// Attempts for parent staging on transient errors
    pub parent_attempts: u32,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            transfer: RetryConfig::transfer_default(),
            service: RetryConfig::service_default(),
            parent_attempts: 3,
        }
    }
}

/// Anti-abuse limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// A listing with more items fails its parent task
    pub max_listing_items: usize,
    /// Recursion depth limit for listings
    pub max_listing_depth: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_listing_items: 20_000,
            max_listing_depth: 20,
        }
    }
}

/// Remote data client tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// SSH session establishment timeout in seconds
    pub ssh_connect_timeout_secs: u64,
    /// Idle pooled SSH sessions are closed after this many seconds
    pub ssh_idle_timeout_secs: u64,
    /// Pooled SSH sessions per (host, port, user)
    pub ssh_max_sessions_per_host: usize,
    /// Read size when streaming bytes
    pub stream_chunk_size: usize,
    /// Interval between backend transfer status checks in seconds
    pub globus_poll_interval_secs: u64,
    /// Minimum interval between persisted progress updates in milliseconds
    pub progress_interval_ms: u64,
    /// Request timeout for HTTP based backends in seconds
    pub http_timeout_secs: u64,
    /// Globus Transfer API base URL
    pub globus_base_url: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ssh_connect_timeout_secs: 15,
            ssh_idle_timeout_secs: 300,
            ssh_max_sessions_per_host: 8,
            stream_chunk_size: 64 * 1024,
            globus_poll_interval_secs: 5,
            progress_interval_ms: 100,
            http_timeout_secs: 300,
            globus_base_url: "https://transfer.api.globus.org/v0.10".to_string(),
        }
    }
}

impl ClientConfig {
    /// SSH session establishment timeout
    pub fn ssh_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.ssh_connect_timeout_secs)
    }

    /// Idle eviction timeout for pooled sessions
    pub fn ssh_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.ssh_idle_timeout_secs)
    }

    /// Backend transfer polling interval
    pub fn globus_poll_interval(&self) -> Duration {
        Duration::from_secs(self.globus_poll_interval_secs)
    }

    /// Progress coalescing interval
    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    /// HTTP request timeout
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

/// Work queue consumption
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Unacknowledged parent messages allowed per worker
    pub parent_prefetch: usize,
    /// Unacknowledged child messages allowed per worker
    pub child_prefetch: usize,
    /// Delay before a requeued message becomes visible again, in milliseconds
    pub redelivery_delay_ms: u64,
    /// Buffered control messages per subscriber
    pub control_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            parent_prefetch: 4,
            child_prefetch: 64,
            redelivery_delay_ms: 1_000,
            control_capacity: 1_024,
        }
    }
}

impl QueueConfig {
    /// Redelivery delay
    pub fn redelivery_delay(&self) -> Duration {
        Duration::from_millis(self.redelivery_delay_ms)
    }
}

/// Trusted identities
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Service identities allowed to request shared-context access
    pub trusted_services: Vec<String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            trusted_services: vec!["jobs".to_string(), "files".to_string()],
        }
    }
}

impl SecurityConfig {
    /// Whether `username` is a trusted service
    pub fn is_trusted(&self, username: &str) -> bool {
        self.trusted_services.iter().any(|s| s == username)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Enable JSON formatting
    pub json_format: bool,
    /// Also write logs into this directory, rotated daily
    pub log_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            log_dir: None,
        }
    }
}
