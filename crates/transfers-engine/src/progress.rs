//! Coalesced byte-count updates
//!
//! Streams report every chunk; the store sees at most one write per interval
//! per child, plus a final one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use transfers_store::TaskStore;
use transfers_types::Result;
use uuid::Uuid;

/// Creates [`ProgressTracker`]s writing into a task store
#[derive(Clone)]
pub struct ProgressMonitor {
    store: Arc<dyn TaskStore>,
    interval: Duration,
}

impl ProgressMonitor {
    /// Flush at most once per `interval`
    pub fn new(store: Arc<dyn TaskStore>, interval: Duration) -> Self {
        Self {
            store,
            interval: interval.max(Duration::from_millis(1)),
        }
    }

    /// Start tracking one child transfer
    pub fn track(&self, child_id: Uuid) -> ProgressTracker {
        let latest = Arc::new(AtomicU64::new(0));
        let stop = CancellationToken::new();
        let flusher = {
            let latest = Arc::clone(&latest);
            let stop = stop.clone();
            let store = Arc::clone(&self.store);
            let every = self.interval;
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(every);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                let mut written = 0;
                loop {
                    tokio::select! {
                        () = stop.cancelled() => break,
                        _ = interval.tick() => {
                            let bytes = latest.load(Ordering::Acquire);
                            if bytes > written {
                                match store.record_child_progress(child_id, bytes).await {
                                    Ok(_) => written = bytes,
                                    Err(e) => warn!(%child_id, "Failed to record progress: {}", e),
                                }
                            }
                        }
                    }
                }
            })
        };
        ProgressTracker {
            child_id,
            latest,
            stop,
            flusher: Some(flusher),
            store: Arc::clone(&self.store),
        }
    }
}

/// Progress of one child transfer
pub struct ProgressTracker {
    child_id: Uuid,
    latest: Arc<AtomicU64>,
    stop: CancellationToken,
    flusher: Option<JoinHandle<()>>,
    store: Arc<dyn TaskStore>,
}

impl ProgressTracker {
    /// Record the total bytes moved so far
    pub fn update(&self, bytes: u64) {
        self.latest.fetch_max(bytes, Ordering::AcqRel);
    }

    /// Bytes recorded so far
    pub fn bytes(&self) -> u64 {
        self.latest.load(Ordering::Acquire)
    }

    /// A handle for the stream side
    pub fn counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.latest)
    }

    /// Stop periodic flushing and write the final count
    pub async fn finish(mut self) -> Result<u64> {
        self.stop.cancel();
        if let Some(flusher) = self.flusher.take() {
            if let Err(e) = flusher.await {
                debug!(child_id = %self.child_id, "Progress flusher ended abnormally: {}", e);
            }
        }
        let bytes = self.bytes();
        self.store.record_child_progress(self.child_id, bytes).await?;
        Ok(bytes)
    }
}

impl Drop for ProgressTracker {
    fn drop(&mut self) {
        // An interrupted transfer keeps what was already flushed.
        self.stop.cancel();
    }
}
