//! Fair-share parent task scheduling
//!
//! Candidates are grouped by (tenant, user). Each group contributes at most
//! `per_user_depth` tasks, oldest first, and groups are interleaved round-robin
//! so one heavy user cannot fill a whole poll.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};
use transfers_config::SchedulerConfig;
use transfers_store::TaskStore;
use transfers_types::{Result, TaskStatus, TransferTaskParent};

/// A parent task picked for a worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledParent {
    /// The task snapshot
    pub parent: TransferTaskParent,
    /// Higher runs first within its group
    pub priority: u32,
}

fn is_eligible(
    parent: &TransferTaskParent,
    live_workers: &[String],
    now: DateTime<Utc>,
    config: &SchedulerConfig,
) -> bool {
    if parent
        .assigned_to
        .as_ref()
        .is_some_and(|owner| live_workers.contains(owner))
    {
        return false;
    }
    match parent.status {
        TaskStatus::Staging | TaskStatus::Staged | TaskStatus::InProgress => true,
        // Normally delivered through the parent queue.
        TaskStatus::Accepted => {
            let grace = ChronoDuration::seconds(i64::try_from(config.accepted_grace_secs).unwrap_or(i64::MAX));
            parent.created + grace <= now
        }
        _ => false,
    }
}

/// Pick parent tasks for one poll.
///
/// `candidates` must be sorted oldest first. The result holds at most
/// `max_tasks_per_poll` entries.
pub fn select_for_worker(
    candidates: Vec<TransferTaskParent>,
    live_workers: &[String],
    now: DateTime<Utc>,
    config: &SchedulerConfig,
) -> Vec<ScheduledParent> {
    let depth = config.per_user_depth.max(1);
    let mut order: Vec<(String, String)> = Vec::new();
    let mut groups: HashMap<(String, String), VecDeque<TransferTaskParent>> = HashMap::new();

    for parent in candidates {
        if !is_eligible(&parent, live_workers, now, config) {
            continue;
        }
        let key = (parent.tenant_id.clone(), parent.username.clone());
        let group = groups.entry(key.clone()).or_insert_with(|| {
            order.push(key);
            VecDeque::new()
        });
        if group.len() < depth {
            group.push_back(parent);
        }
    }

    let mut selected = Vec::new();
    for round in 0..depth {
        for key in &order {
            if selected.len() >= config.max_tasks_per_poll {
                return selected;
            }
            if let Some(parent) = groups.get_mut(key).and_then(VecDeque::pop_front) {
                selected.push(ScheduledParent {
                    parent,
                    priority: u32::try_from(depth - round).unwrap_or(u32::MAX),
                });
            }
        }
    }
    selected
}

/// Claims parent tasks for one worker through the task store
#[derive(Clone)]
pub struct FairShareScheduler {
    store: Arc<dyn TaskStore>,
    worker_id: String,
    config: SchedulerConfig,
    heartbeat_timeout: Duration,
}

impl FairShareScheduler {
    /// Create a scheduler claiming under `worker_id`
    pub fn new(
        store: Arc<dyn TaskStore>,
        worker_id: impl Into<String>,
        config: SchedulerConfig,
        heartbeat_timeout: Duration,
    ) -> Self {
        Self {
            store,
            worker_id: worker_id.into(),
            config,
            heartbeat_timeout,
        }
    }

    /// Identity the scheduler claims under
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Parent tasks this worker should look at, in priority order, without claiming them
    pub async fn parents_for_worker(&self) -> Result<Vec<ScheduledParent>> {
        self.store.heartbeat(&self.worker_id).await?;
        let live = self.store.live_workers(self.heartbeat_timeout).await?;
        let candidates = self.store.candidate_parents().await?;
        Ok(select_for_worker(candidates, &live, Utc::now(), &self.config))
    }

    /// Claim up to `limit` parent tasks. A task another worker claimed first is skipped.
    pub async fn claim_parents(&self, limit: usize) -> Result<Vec<TransferTaskParent>> {
        if limit == 0 {
            self.store.heartbeat(&self.worker_id).await?;
            return Ok(Vec::new());
        }
        let scheduled = self.parents_for_worker().await?;
        let live = self.store.live_workers(self.heartbeat_timeout).await?;

        let mut claimed = Vec::new();
        for entry in scheduled {
            if claimed.len() >= limit {
                break;
            }
            if self
                .store
                .assign_parent(entry.parent.id, &self.worker_id, &live)
                .await?
            {
                trace!(parent_id = %entry.parent.id, priority = entry.priority, "Claimed parent task");
                claimed.push(entry.parent);
            }
        }
        if !claimed.is_empty() {
            debug!(worker_id = %self.worker_id, claimed = claimed.len(), "Scheduler claimed parent tasks");
        }
        Ok(claimed)
    }
}
