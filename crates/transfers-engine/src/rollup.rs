//! Completion rollup from children to parents to the top task
//!
//! Every check is a recount against the store, so running it twice, or from
//! several workers at once, converges on the same result.

use tracing::info;
use transfers_store::{StatusChange, TaskStore, Transition};
use transfers_types::{Result, TaskStatus};
use uuid::Uuid;

/// Terminal status for a parent whose children are all terminal. Failures
/// outrank cancellation.
pub fn parent_outcome(failed_optional: usize, failed: usize, cancelled: usize) -> TaskStatus {
    if failed > 0 {
        TaskStatus::Failed
    } else if failed_optional > 0 {
        TaskStatus::FailedOpt
    } else if cancelled > 0 {
        TaskStatus::Cancelled
    } else {
        TaskStatus::Completed
    }
}

/// Complete a staged parent once none of its children is pending
pub async fn check_parent(store: &dyn TaskStore, parent_id: Uuid) -> Result<Option<TaskStatus>> {
    let Some(parent) = store.get_parent(parent_id).await? else {
        return Ok(None);
    };
    if parent.is_terminal() {
        return Ok(Some(parent.status));
    }
    // Children are still being created while staging.
    if parent.status.rank() < TaskStatus::Staged.rank() {
        return Ok(None);
    }
    if store.count_incomplete_children(parent_id).await? > 0 {
        return Ok(None);
    }

    let counts = store.child_status_counts(parent_id).await?;
    let count = |status| counts.get(&status).copied().unwrap_or(0);
    let outcome = parent_outcome(
        count(TaskStatus::FailedOpt),
        count(TaskStatus::Failed),
        count(TaskStatus::Cancelled),
    );
    let change = match outcome {
        TaskStatus::Completed | TaskStatus::Cancelled => StatusChange::to(outcome).with_final_message(
            format!("Transferred {} items", count(TaskStatus::Completed)),
        ),
        _ => StatusChange::failed(
            outcome,
            format!(
                "{} of {} items failed",
                count(TaskStatus::FailedOpt) + count(TaskStatus::Failed),
                counts.values().sum::<usize>()
            ),
        ),
    };
    if store.set_parent_status(parent_id, change).await? == Transition::Applied {
        info!(%parent_id, status = %outcome, "Parent task finished");
    }
    Ok(Some(outcome))
}

/// Complete the top task once no parent and no child is pending
pub async fn check_top(store: &dyn TaskStore, task_id: Uuid) -> Result<Option<TaskStatus>> {
    let Some(task) = store.get_transfer(task_id).await? else {
        return Ok(None);
    };
    if task.is_terminal() {
        return Ok(Some(task.status));
    }
    if store.count_incomplete_parents(task_id).await? > 0
        || store.count_incomplete_children_for_top(task_id).await? > 0
    {
        return Ok(None);
    }

    // Optional failures never fail the request.
    let required_failure = task
        .parent_tasks
        .iter()
        .find(|p| !p.optional && p.status == TaskStatus::Failed);
    let change = match required_failure {
        Some(parent) => StatusChange::failed(
            TaskStatus::Failed,
            parent
                .error_message
                .clone()
                .unwrap_or_else(|| format!("Parent task {} failed", parent.id)),
        ),
        None if task.parent_tasks.iter().any(|p| p.status == TaskStatus::Cancelled) => {
            StatusChange::to(TaskStatus::Cancelled)
        }
        None => StatusChange::to(TaskStatus::Completed),
    };
    let status = change.status;
    if store.set_transfer_status(task_id, change).await? == Transition::Applied {
        info!(%task_id, %status, "Transfer finished");
    }
    Ok(Some(status))
}

/// Run the parent check, then the top task check
pub async fn check(store: &dyn TaskStore, parent_id: Uuid, task_id: Uuid) -> Result<()> {
    check_parent(store, parent_id).await?;
    check_top(store, task_id).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use transfers_store::MemoryTaskStore;
    use transfers_types::{
        TransferRequestElement, TransferTask, TransferTaskChild, TransferTaskParent, TransferUri,
    };

    async fn setup(optional: bool, children: usize) -> (MemoryTaskStore, TransferTask, Vec<TransferTaskChild>) {
        let store = MemoryTaskStore::new();
        let mut task = TransferTask::new("t1", "alice", None);
        let src = TransferUri::tapis("t1", "a", "/d");
        let dst = TransferUri::tapis("t1", "b", "/d");
        let parent = TransferTaskParent::new(
            &task,
            &TransferRequestElement::new(src.clone(), dst.clone()).optional(optional),
        );
        task.parent_tasks.push(parent.clone());
        store.create_transfer(&task).await.unwrap();
        let kids: Vec<_> = (0..children)
            .map(|i| TransferTaskChild::new(&parent, src.join(&i.to_string()), dst.join(&i.to_string()), false, 1))
            .collect();
        store.stage_parent(parent.id, children as u64, kids.clone()).await.unwrap();
        (store, task, kids)
    }

    #[test]
    fn test_parent_outcome() {
        assert_eq!(parent_outcome(0, 0, 0), TaskStatus::Completed);
        assert_eq!(parent_outcome(2, 0, 0), TaskStatus::FailedOpt);
        assert_eq!(parent_outcome(1, 1, 0), TaskStatus::Failed);
        assert_eq!(parent_outcome(0, 0, 3), TaskStatus::Cancelled);
        assert_eq!(parent_outcome(1, 0, 3), TaskStatus::FailedOpt);
    }

    #[tokio::test]
    async fn test_waits_for_children_then_completes() {
        let (store, task, kids) = setup(false, 2).await;
        let parent_id = task.parent_tasks[0].id;
        store
            .set_child_status(kids[0].id, StatusChange::to(TaskStatus::Completed))
            .await
            .unwrap();
        assert_eq!(check_parent(&store, parent_id).await.unwrap(), None);

        store
            .set_child_status(kids[1].id, StatusChange::to(TaskStatus::Completed))
            .await
            .unwrap();
        check(&store, parent_id, task.id).await.unwrap();
        check(&store, parent_id, task.id).await.unwrap();

        let top = store.get_transfer(task.id).await.unwrap().unwrap();
        assert_eq!(top.status, TaskStatus::Completed);
        assert_eq!(top.parent_tasks[0].status, TaskStatus::Completed);
        assert!(top.parent_tasks[0].final_message.is_some());
    }

    #[tokio::test]
    async fn test_optional_failure_completes_top() {
        let (store, task, kids) = setup(true, 1).await;
        store
            .set_child_status(kids[0].id, StatusChange::failed(TaskStatus::FailedOpt, "gone"))
            .await
            .unwrap();
        check(&store, task.parent_tasks[0].id, task.id).await.unwrap();

        let top = store.get_transfer(task.id).await.unwrap().unwrap();
        assert_eq!(top.parent_tasks[0].status, TaskStatus::FailedOpt);
        assert_eq!(top.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_staging_parent_is_left_alone() {
        let store = MemoryTaskStore::new();
        let mut task = TransferTask::new("t1", "alice", None);
        let element = TransferRequestElement::new(
            TransferUri::tapis("t1", "a", "/d"),
            TransferUri::tapis("t1", "b", "/d"),
        );
        task.parent_tasks.push(TransferTaskParent::new(&task, &element));
        store.create_transfer(&task).await.unwrap();
        let parent_id = task.parent_tasks[0].id;
        store
            .set_parent_status(parent_id, StatusChange::to(TaskStatus::Staging))
            .await
            .unwrap();

        check(&store, parent_id, task.id).await.unwrap();
        let top = store.get_transfer(task.id).await.unwrap().unwrap();
        assert_eq!(top.status, TaskStatus::Accepted);
        assert_eq!(top.parent_tasks[0].status, TaskStatus::Staging);
    }
}
