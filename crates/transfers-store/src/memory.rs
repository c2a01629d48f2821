//! In-memory task store
//!
//! All tables sit behind one lock, so every trait method is a transaction.

use crate::store::{Lifecycle, StageOutcome, StatusChange, TaskStore, Transition};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;
use transfers_types::{
    Error, Result, TaskStatus, TransferTask, TransferTaskChild, TransferTaskParent,
};
use uuid::Uuid;

#[derive(Debug, Default)]
struct Tables {
    tasks: HashMap<Uuid, TransferTask>,
    parents: HashMap<Uuid, TransferTaskParent>,
    children: HashMap<Uuid, TransferTaskChild>,
    parents_by_task: HashMap<Uuid, Vec<Uuid>>,
    children_by_parent: HashMap<Uuid, Vec<Uuid>>,
    heartbeats: HashMap<String, Instant>,
}

impl Tables {
    fn task_mut(&mut self, id: Uuid) -> Result<&mut TransferTask> {
        self.tasks
            .get_mut(&id)
            .ok_or_else(|| Error::not_found(format!("transfer {id}")))
    }

    fn parent_mut(&mut self, id: Uuid) -> Result<&mut TransferTaskParent> {
        self.parents
            .get_mut(&id)
            .ok_or_else(|| Error::not_found(format!("parent task {id}")))
    }

    fn child_mut(&mut self, id: Uuid) -> Result<&mut TransferTaskChild> {
        self.children
            .get_mut(&id)
            .ok_or_else(|| Error::not_found(format!("child task {id}")))
    }

    fn with_parents(&self, task: &TransferTask) -> TransferTask {
        let mut task = task.clone();
        task.parent_tasks = self
            .parents_by_task
            .get(&task.id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.parents.get(id).cloned())
            .collect();
        task
    }

    fn children_of(&self, parent_id: Uuid) -> impl Iterator<Item = &TransferTaskChild> {
        self.children_by_parent
            .get(&parent_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.children.get(id))
    }

    fn parent_ids(&self, task_id: Uuid) -> Vec<Uuid> {
        self.parents_by_task.get(&task_id).cloned().unwrap_or_default()
    }
}

/// Task store keeping everything in process memory
#[derive(Debug, Default)]
pub struct MemoryTaskStore {
    tables: RwLock<Tables>,
}

impl MemoryTaskStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn create_transfer(&self, task: &TransferTask) -> Result<()> {
        let mut tables = self.tables.write().await;
        if tables.tasks.contains_key(&task.id) {
            return Err(Error::store(format!("transfer {} already exists", task.id)));
        }
        if let Some(stray) = task.parent_tasks.iter().find(|p| p.task_id != task.id) {
            return Err(Error::store(format!(
                "parent task {} does not belong to transfer {}",
                stray.id, task.id
            )));
        }

        let mut stored = task.clone();
        let parents = std::mem::take(&mut stored.parent_tasks);
        tables
            .parents_by_task
            .insert(task.id, parents.iter().map(|p| p.id).collect());
        for parent in parents {
            tables.parents.insert(parent.id, parent);
        }
        tables.tasks.insert(task.id, stored);
        debug!(task_id = %task.id, "Persisted transfer");
        Ok(())
    }

    async fn get_transfer(&self, id: Uuid) -> Result<Option<TransferTask>> {
        let tables = self.tables.read().await;
        Ok(tables.tasks.get(&id).map(|task| tables.with_parents(task)))
    }

    async fn list_transfers(
        &self,
        tenant_id: &str,
        username: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<TransferTask>> {
        let tables = self.tables.read().await;
        let mut tasks: Vec<&TransferTask> = tables
            .tasks
            .values()
            .filter(|t| t.tenant_id == tenant_id && t.username == username)
            .collect();
        tasks.sort_by(|a, b| b.created.cmp(&a.created).then_with(|| b.id.cmp(&a.id)));
        Ok(tasks
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|task| tables.with_parents(task))
            .collect())
    }

    async fn set_transfer_status(&self, id: Uuid, change: StatusChange) -> Result<Transition> {
        let mut tables = self.tables.write().await;
        let task = tables.task_mut(id)?;
        Ok(Lifecycle {
            status: &mut task.status,
            start_time: &mut task.start_time,
            end_time: &mut task.end_time,
            error_message: &mut task.error_message,
        }
        .apply(&change, Utc::now()))
    }

    async fn get_parent(&self, id: Uuid) -> Result<Option<TransferTaskParent>> {
        Ok(self.tables.read().await.parents.get(&id).cloned())
    }

    async fn set_parent_status(&self, id: Uuid, change: StatusChange) -> Result<Transition> {
        let mut tables = self.tables.write().await;
        let parent = tables.parent_mut(id)?;
        let transition = Lifecycle {
            status: &mut parent.status,
            start_time: &mut parent.start_time,
            end_time: &mut parent.end_time,
            error_message: &mut parent.error_message,
        }
        .apply(&change, Utc::now());
        if transition == Transition::Applied {
            if let Some(message) = change.final_message {
                parent.final_message = Some(message);
            }
        }
        Ok(transition)
    }

    async fn assign_parent(&self, id: Uuid, worker_id: &str, live_workers: &[String]) -> Result<bool> {
        let mut tables = self.tables.write().await;
        let parent = tables.parent_mut(id)?;
        if parent.is_terminal() {
            return Ok(false);
        }
        let claimable = match parent.assigned_to.as_deref() {
            None => true,
            Some(owner) if owner == worker_id => true,
            Some(owner) => !live_workers.iter().any(|w| w == owner),
        };
        if claimable {
            parent.assigned_to = Some(worker_id.to_string());
        }
        Ok(claimable)
    }

    async fn stage_parent(
        &self,
        id: Uuid,
        total_bytes: u64,
        children: Vec<TransferTaskChild>,
    ) -> Result<StageOutcome> {
        let mut tables = self.tables.write().await;
        let status = tables.parent_mut(id)?.status;
        if status.is_terminal() {
            return Ok(StageOutcome::Rejected(status));
        }
        if status.rank() >= TaskStatus::Staged.rank() {
            return Ok(StageOutcome::AlreadyStaged(tables.children_of(id).cloned().collect()));
        }
        if let Some(stray) = children.iter().find(|c| c.parent_task_id != id) {
            return Err(Error::store(format!(
                "child task {} does not belong to parent {}",
                stray.id, id
            )));
        }

        let parent = tables.parent_mut(id)?;
        Lifecycle {
            status: &mut parent.status,
            start_time: &mut parent.start_time,
            end_time: &mut parent.end_time,
            error_message: &mut parent.error_message,
        }
        .apply(&StatusChange::to(TaskStatus::Staged), Utc::now());
        parent.total_bytes = total_bytes;

        let ids = tables.children_by_parent.entry(id).or_default();
        ids.extend(children.iter().map(|c| c.id));
        for child in &children {
            tables.children.insert(child.id, child.clone());
        }
        debug!(parent_id = %id, children = children.len(), total_bytes, "Staged parent task");
        Ok(StageOutcome::Staged(children))
    }

    async fn get_parent_children(&self, parent_id: Uuid) -> Result<Vec<TransferTaskChild>> {
        Ok(self.tables.read().await.children_of(parent_id).cloned().collect())
    }

    async fn get_child(&self, id: Uuid) -> Result<Option<TransferTaskChild>> {
        Ok(self.tables.read().await.children.get(&id).cloned())
    }

    async fn set_child_status(&self, id: Uuid, change: StatusChange) -> Result<Transition> {
        let mut tables = self.tables.write().await;
        let child = tables.child_mut(id)?;
        Ok(Lifecycle {
            status: &mut child.status,
            start_time: &mut child.start_time,
            end_time: &mut child.end_time,
            error_message: &mut child.error_message,
        }
        .apply(&change, Utc::now()))
    }

    async fn increment_child_retries(&self, id: Uuid) -> Result<u32> {
        let mut tables = self.tables.write().await;
        let child = tables.child_mut(id)?;
        child.retries = child.retries.saturating_add(1);
        Ok(child.retries)
    }

    async fn set_child_external_id(&self, id: Uuid, external_id: &str) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.child_mut(id)?.external_task_id = Some(external_id.to_string());
        Ok(())
    }

    async fn record_child_progress(&self, id: Uuid, bytes: u64) -> Result<u64> {
        let mut tables = self.tables.write().await;
        let child = tables.child_mut(id)?;
        let delta = bytes.saturating_sub(child.bytes_transferred);
        child.bytes_transferred = child.bytes_transferred.max(bytes);
        let parent_id = child.parent_task_id;

        let parent = tables.parent_mut(parent_id)?;
        parent.bytes_transferred = parent.bytes_transferred.saturating_add(delta);
        Ok(parent.bytes_transferred)
    }

    async fn child_status_counts(&self, parent_id: Uuid) -> Result<HashMap<TaskStatus, usize>> {
        let tables = self.tables.read().await;
        let mut counts = HashMap::new();
        for child in tables.children_of(parent_id) {
            *counts.entry(child.status).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn count_incomplete_children(&self, parent_id: Uuid) -> Result<usize> {
        let tables = self.tables.read().await;
        Ok(tables.children_of(parent_id).filter(|c| !c.is_terminal()).count())
    }

    async fn count_incomplete_children_for_top(&self, task_id: Uuid) -> Result<usize> {
        let tables = self.tables.read().await;
        Ok(tables
            .parent_ids(task_id)
            .into_iter()
            .map(|parent_id| tables.children_of(parent_id).filter(|c| !c.is_terminal()).count())
            .sum())
    }

    async fn count_incomplete_parents(&self, task_id: Uuid) -> Result<usize> {
        let tables = self.tables.read().await;
        Ok(tables
            .parent_ids(task_id)
            .iter()
            .filter_map(|id| tables.parents.get(id))
            .filter(|p| !p.is_terminal())
            .count())
    }

    async fn cancel_transfer(&self, task_id: Uuid) -> Result<bool> {
        let mut tables = self.tables.write().await;
        let now = Utc::now();
        let cancel = StatusChange::to(TaskStatus::Cancelled);
        let mut changed = false;

        for parent_id in tables.parent_ids(task_id) {
            let child_ids = tables.children_by_parent.get(&parent_id).cloned().unwrap_or_default();
            for child_id in child_ids {
                if let Some(child) = tables.children.get_mut(&child_id) {
                    changed |= Lifecycle {
                        status: &mut child.status,
                        start_time: &mut child.start_time,
                        end_time: &mut child.end_time,
                        error_message: &mut child.error_message,
                    }
                    .apply(&cancel, now)
                        == Transition::Applied;
                }
            }
            if let Some(parent) = tables.parents.get_mut(&parent_id) {
                changed |= Lifecycle {
                    status: &mut parent.status,
                    start_time: &mut parent.start_time,
                    end_time: &mut parent.end_time,
                    error_message: &mut parent.error_message,
                }
                .apply(&cancel, now)
                    == Transition::Applied;
            }
        }

        let task = tables.task_mut(task_id)?;
        changed |= Lifecycle {
            status: &mut task.status,
            start_time: &mut task.start_time,
            end_time: &mut task.end_time,
            error_message: &mut task.error_message,
        }
        .apply(&cancel, now)
            == Transition::Applied;
        Ok(changed)
    }

    async fn candidate_parents(&self) -> Result<Vec<TransferTaskParent>> {
        let tables = self.tables.read().await;
        let mut parents: Vec<TransferTaskParent> = tables
            .parents
            .values()
            .filter(|p| !p.is_terminal())
            .cloned()
            .collect();
        parents.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.id.cmp(&b.id)));
        Ok(parents)
    }

    async fn heartbeat(&self, worker_id: &str) -> Result<()> {
        self.tables
            .write()
            .await
            .heartbeats
            .insert(worker_id.to_string(), Instant::now());
        Ok(())
    }

    async fn live_workers(&self, timeout: Duration) -> Result<Vec<String>> {
        let tables = self.tables.read().await;
        let mut live: Vec<String> = tables
            .heartbeats
            .iter()
            .filter(|(_, seen)| seen.elapsed() <= timeout)
            .map(|(worker, _)| worker.clone())
            .collect();
        live.sort();
        Ok(live)
    }
}
