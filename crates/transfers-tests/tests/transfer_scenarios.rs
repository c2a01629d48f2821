//! End-to-end transfer scenarios
//!
//! Each test runs a full engine in process against two LOCAL systems rooted in
//! temporary directories.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use transfers_engine::TransferEngine;
use transfers_queue::{MemoryQueue, TaskQueue};
use transfers_store::TaskStore;
use transfers_tests::{
    any_child_in_progress, destination_uri, quick_config, request, source_uri, start_engine,
    wait_for_details, Faults, LocalSystems, TENANT, USER,
};
use transfers_types::{TaskStatus, TransferRequestElement, TransferTaskChild, TransferType};

const WAIT: Duration = Duration::from_secs(20);

#[tokio::test]
async fn test_directory_of_three_files() {
    let systems = LocalSystems::new().unwrap();
    systems.write_source("data/one.bin", 100).unwrap();
    systems.write_source("data/two.bin", 100).unwrap();
    systems.write_source("data/nested/three.bin", 100).unwrap();
    let engine = start_engine(&systems, quick_config(), None).unwrap();

    let task = engine
        .service()
        .create_transfer(request(vec![TransferRequestElement::new(
            source_uri("/data"),
            destination_uri("/copy"),
        )]))
        .await
        .unwrap();
    assert_eq!(task.status, TaskStatus::Accepted);
    assert_eq!(task.parent_tasks.len(), 1);

    let done = engine.wait_for_transfer(task.id, WAIT).await.unwrap();
    let details = engine
        .service()
        .get_transfer_details(TENANT, USER, task.id)
        .await
        .unwrap();
    engine.stop().await;

    assert_eq!(done.status, TaskStatus::Completed);
    assert!(done.start_time.is_some());
    assert!(done.end_time.is_some());

    let parent = &details.parents[0];
    assert_eq!(parent.parent.status, TaskStatus::Completed);
    assert_eq!(parent.parent.total_bytes, 300);
    assert_eq!(parent.parent.bytes_transferred, 300);
    let files: Vec<_> = parent.children.iter().filter(|c| !c.is_dir).collect();
    assert_eq!(files.len(), 3);
    assert!(files
        .iter()
        .all(|c| c.status == TaskStatus::Completed && c.bytes_transferred == 100));

    for name in ["one.bin", "two.bin", "nested/three.bin"] {
        assert_eq!(
            std::fs::read(systems.destination_path(&format!("copy/{name}"))).unwrap(),
            std::fs::read(systems.source_path(&format!("data/{name}"))).unwrap(),
        );
    }
}

#[tokio::test]
async fn test_single_file_to_new_name() {
    let systems = LocalSystems::new().unwrap();
    systems.write_source("report.csv", 42).unwrap();
    let engine = start_engine(&systems, quick_config(), None).unwrap();

    let task = engine
        .service()
        .create_transfer(request(vec![TransferRequestElement::new(
            source_uri("/report.csv"),
            destination_uri("/archive/report-2024.csv"),
        )]))
        .await
        .unwrap();
    let done = engine.wait_for_transfer(task.id, WAIT).await.unwrap();
    engine.stop().await;

    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(done.parent_tasks[0].total_bytes, 42);
    assert_eq!(
        std::fs::metadata(systems.destination_path("archive/report-2024.csv"))
            .unwrap()
            .len(),
        42
    );
}

#[tokio::test]
async fn test_missing_source_fails_request() {
    let systems = LocalSystems::new().unwrap();
    let engine = start_engine(&systems, quick_config(), None).unwrap();

    let task = engine
        .service()
        .create_transfer(request(vec![TransferRequestElement::new(
            source_uri("/nope"),
            destination_uri("/copy"),
        )]))
        .await
        .unwrap();
    let done = engine.wait_for_transfer(task.id, WAIT).await.unwrap();
    engine.stop().await;

    assert_eq!(done.status, TaskStatus::Failed);
    assert_eq!(done.parent_tasks[0].status, TaskStatus::Failed);
    assert!(done.error_message.is_some());
    assert!(done.end_time.is_some());
}

#[tokio::test]
async fn test_optional_failure_keeps_request_completed() {
    let systems = LocalSystems::new().unwrap();
    systems.write_source("good.txt", 10).unwrap();
    let engine = start_engine(&systems, quick_config(), None).unwrap();

    let task = engine
        .service()
        .create_transfer(request(vec![
            TransferRequestElement::new(source_uri("/good.txt"), destination_uri("/good.txt")),
            TransferRequestElement::new(source_uri("/missing.txt"), destination_uri("/missing.txt"))
                .optional(true),
        ]))
        .await
        .unwrap();
    let done = engine.wait_for_transfer(task.id, WAIT).await.unwrap();
    engine.stop().await;

    assert_eq!(done.status, TaskStatus::Completed);
    let statuses: Vec<_> = done.parent_tasks.iter().map(|p| p.status).collect();
    assert!(statuses.contains(&TaskStatus::Completed));
    assert!(statuses.contains(&TaskStatus::FailedOpt));
}

#[tokio::test]
async fn test_listing_over_limit_creates_no_children() {
    let systems = LocalSystems::new().unwrap();
    for i in 0..3 {
        systems.write_source(&format!("many/{i}.txt"), 5).unwrap();
    }
    let mut config = quick_config();
    config.limits.max_listing_items = 2;
    let engine = start_engine(&systems, config, None).unwrap();

    let task = engine
        .service()
        .create_transfer(request(vec![TransferRequestElement::new(
            source_uri("/many"),
            destination_uri("/many"),
        )]))
        .await
        .unwrap();
    let done = engine.wait_for_transfer(task.id, WAIT).await.unwrap();
    let details = engine
        .service()
        .get_transfer_details(TENANT, USER, task.id)
        .await
        .unwrap();
    engine.stop().await;

    assert_eq!(done.status, TaskStatus::Failed);
    assert!(details.parents[0].children.is_empty());
    assert!(details.parents[0]
        .parent
        .error_message
        .as_deref()
        .is_some_and(|m| m.contains("more than 2 items")));
}

#[tokio::test]
async fn test_empty_directory_completes() {
    let systems = LocalSystems::new().unwrap();
    systems.mkdir_source("empty").unwrap();
    let engine = start_engine(&systems, quick_config(), None).unwrap();

    let task = engine
        .service()
        .create_transfer(request(vec![TransferRequestElement::new(
            source_uri("/empty"),
            destination_uri("/empty"),
        )]))
        .await
        .unwrap();
    let done = engine.wait_for_transfer(task.id, WAIT).await.unwrap();
    engine.stop().await;

    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(done.parent_tasks[0].total_bytes, 0);
    assert_eq!(
        done.parent_tasks[0].final_message.as_deref(),
        Some("Source is empty")
    );
}

#[tokio::test]
async fn test_transient_upload_failures_are_retried() {
    let systems = LocalSystems::new().unwrap();
    systems.write_source("flaky.bin", 64).unwrap();
    let faults = Arc::new(Faults::transient(2));
    let engine = start_engine(&systems, quick_config(), Some(Arc::clone(&faults))).unwrap();

    let task = engine
        .service()
        .create_transfer(request(vec![TransferRequestElement::new(
            source_uri("/flaky.bin"),
            destination_uri("/flaky.bin"),
        )]))
        .await
        .unwrap();
    engine.wait_for_transfer(task.id, WAIT).await.unwrap();
    let details = engine
        .service()
        .get_transfer_details(TENANT, USER, task.id)
        .await
        .unwrap();
    engine.stop().await;

    assert_eq!(details.task.status, TaskStatus::Completed);
    let child = &details.parents[0].children[0];
    assert_eq!(child.retries, 3);
    assert_eq!(child.bytes_transferred, 64);
    assert_eq!(faults.uploads.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_required_child_failure_fails_ancestors() {
    let systems = LocalSystems::new().unwrap();
    systems.write_source("set/ok.txt", 10).unwrap();
    systems.write_source("set/bad.txt", 10).unwrap();
    let faults = Arc::new(Faults::failing("bad.txt"));
    let engine = start_engine(&systems, quick_config(), Some(faults)).unwrap();

    let task = engine
        .service()
        .create_transfer(request(vec![TransferRequestElement::new(
            source_uri("/set"),
            destination_uri("/set"),
        )]))
        .await
        .unwrap();
    let done = engine.wait_for_transfer(task.id, WAIT).await.unwrap();
    let details = engine
        .service()
        .get_transfer_details(TENANT, USER, task.id)
        .await
        .unwrap();
    engine.stop().await;

    assert_eq!(done.status, TaskStatus::Failed);
    assert_eq!(details.parents[0].parent.status, TaskStatus::Failed);
    let bad = details.parents[0]
        .children
        .iter()
        .find(|c| c.source_uri.to_string().ends_with("bad.txt"))
        .unwrap();
    assert_eq!(bad.status, TaskStatus::Failed);
    assert_eq!(bad.retries, 1);
}

#[tokio::test]
async fn test_cancel_running_transfer() {
    let systems = LocalSystems::new().unwrap();
    systems.write_source("slow/a.bin", 10).unwrap();
    systems.write_source("slow/b.bin", 10).unwrap();
    let faults = Arc::new(Faults::slow(Duration::from_secs(60)));
    let engine = start_engine(&systems, quick_config(), Some(faults)).unwrap();

    let task = engine
        .service()
        .create_transfer(request(vec![TransferRequestElement::new(
            source_uri("/slow"),
            destination_uri("/slow"),
        )]))
        .await
        .unwrap();
    wait_for_details(&engine, task.id, WAIT, any_child_in_progress)
        .await
        .unwrap();

    let cancelled = engine
        .service()
        .cancel_transfer(TENANT, USER, task.id)
        .await
        .unwrap();
    assert_eq!(cancelled.status, TaskStatus::Cancelled);

    let details = wait_for_details(&engine, task.id, WAIT, |d| {
        d.parents
            .iter()
            .flat_map(|p| &p.children)
            .all(|c| c.is_terminal())
    })
    .await
    .unwrap();
    tokio::time::timeout(WAIT, engine.stop()).await.unwrap();

    assert_eq!(details.task.status, TaskStatus::Cancelled);
    assert!(details.parents.iter().all(|p| p.parent.status == TaskStatus::Cancelled));
    assert!(details
        .parents
        .iter()
        .flat_map(|p| &p.children)
        .all(|c| c.status == TaskStatus::Cancelled));

    // A second cancel is a no-op on a finished transfer
    let again = engine
        .service()
        .cancel_transfer(TENANT, USER, task.id)
        .await
        .unwrap();
    assert_eq!(again.status, TaskStatus::Cancelled);
}

#[tokio::test]
async fn test_redelivered_children_do_not_double_count() {
    let systems = LocalSystems::new().unwrap();
    systems.write_source("dup/a.txt", 100).unwrap();
    systems.write_source("dup/b.txt", 200).unwrap();
    let config = quick_config();
    let child_queue = Arc::new(MemoryQueue::new("children", config.queue.child_prefetch));
    let engine = TransferEngine::builder(config)
        .systems(Arc::new(systems.registry()))
        .child_queue(Arc::clone(&child_queue) as _)
        .build()
        .unwrap();
    engine.start();

    let task = engine
        .service()
        .create_transfer(request(vec![TransferRequestElement::new(
            source_uri("/dup"),
            destination_uri("/dup"),
        )]))
        .await
        .unwrap();
    engine.wait_for_transfer(task.id, WAIT).await.unwrap();

    let store = engine.store();
    let parent_id = task.parent_tasks[0].id;
    let children = store.get_parent_children(parent_id).await.unwrap();
    let publisher: TaskQueue<TransferTaskChild> = TaskQueue::new(Arc::clone(&child_queue) as _);
    for child in &children {
        publisher.publish(child).await.unwrap();
    }

    let deadline = tokio::time::Instant::now() + WAIT;
    while child_queue.ready_count() + child_queue.unacked_count() > 0 {
        assert!(tokio::time::Instant::now() < deadline, "duplicates never drained");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    engine.stop().await;

    let parent = store.get_parent(parent_id).await.unwrap().unwrap();
    assert_eq!(parent.status, TaskStatus::Completed);
    assert_eq!(parent.bytes_transferred, 300);
    let after = store.get_parent_children(parent_id).await.unwrap();
    assert!(after
        .iter()
        .zip(&children)
        .all(|(a, b)| a.retries == b.retries && a.status == TaskStatus::Completed));
}

#[tokio::test]
async fn test_service_move_within_system() {
    let systems = LocalSystems::new().unwrap();
    systems.write_source("inbox/msg.txt", 12).unwrap();
    let engine = start_engine(&systems, quick_config(), None).unwrap();

    let task = engine
        .service()
        .create_transfer(request(vec![TransferRequestElement::new(
            source_uri("/inbox/msg.txt"),
            source_uri("/msg-moved.txt"),
        )
        .with_type(TransferType::ServiceMoveFileOrDirectory)]))
        .await
        .unwrap();
    let done = engine.wait_for_transfer(task.id, WAIT).await.unwrap();
    engine.stop().await;

    assert_eq!(done.status, TaskStatus::Completed);
    assert!(!systems.source_path("inbox/msg.txt").exists());
    assert_eq!(
        std::fs::metadata(systems.source_path("msg-moved.txt")).unwrap().len(),
        12
    );
}

#[tokio::test]
async fn test_transfers_listed_for_owner_only() {
    let systems = LocalSystems::new().unwrap();
    systems.write_source("f.txt", 1).unwrap();
    let engine = start_engine(&systems, quick_config(), None).unwrap();

    let mut ids = Vec::new();
    for _ in 0..2 {
        let task = engine
            .service()
            .create_transfer(request(vec![TransferRequestElement::new(
                source_uri("/f.txt"),
                destination_uri("/f.txt"),
            )]))
            .await
            .unwrap();
        ids.push(task.id);
    }
    for id in &ids {
        engine.wait_for_transfer(*id, WAIT).await.unwrap();
    }

    let mine = engine
        .service()
        .list_transfers(TENANT, USER, 0, 10)
        .await
        .unwrap();
    let theirs = engine
        .service()
        .list_transfers(TENANT, "mallory", 0, 10)
        .await
        .unwrap();
    let stolen = engine.service().get_transfer(TENANT, "mallory", ids[0]).await;
    engine.stop().await;

    assert_eq!(mine.len(), 2);
    assert!(theirs.is_empty());
    assert!(stolen.unwrap_err().is_not_found());
}
