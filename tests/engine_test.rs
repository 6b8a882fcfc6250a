mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use common::{test_config, wait_for, RecordingExecutor, WAIT};
use serde_json::json;
use taskq::TaskEngine;
use taskq_dispatcher::GetTaskOptions;
use taskq_domain::{
    entities::TaskStatus,
    ports::{Clock, TaskQueue},
    value_objects::{StatusTransition, SubmitTaskRequest, TaskUpdate},
};
use taskq_infrastructure::InMemoryTaskQueue;
use taskq_testing_utils::{ManualClock, Script, ScriptedExecutor, SubmitTaskRequestBuilder, TestEnv};

fn labelled(label: &str, priority: &str) -> SubmitTaskRequest {
    SubmitTaskRequestBuilder::new("recording")
        .priority(priority)
        .payload(json!({ "label": label }))
        .build()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_scenario_health_check_completes() {
    let dir = tempfile::tempdir().unwrap();
    let engine = TaskEngine::builder(test_config(&dir.path().join("a.db"), 2))
        .build()
        .await
        .unwrap();
    engine.start().await.unwrap();

    let receipt = engine
        .controller()
        .submit(
            SubmitTaskRequestBuilder::health_check()
                .tenant("t1")
                .priority("critical")
                .payload(json!({"message": "x"}))
                .build(),
        )
        .await
        .unwrap();
    assert_eq!(receipt.status, TaskStatus::Queued);
    assert_eq!(receipt.progress, 0);

    wait_for(&engine, receipt.task_id, TaskStatus::Completed).await;
    let details = engine
        .controller()
        .get(receipt.task_id, GetTaskOptions::default())
        .await
        .unwrap();
    let task = details.task;
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.progress, 100);
    assert_eq!(task.result.unwrap()["message"], "x");
    let completed_at = task.completed_at.unwrap();
    let started_at = task.started_at.unwrap();
    assert!(completed_at >= started_at);
    assert!(started_at >= task.created_at);

    engine.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_scenario_batch_partial_success() {
    let dir = tempfile::tempdir().unwrap();
    let engine = TaskEngine::builder(test_config(&dir.path().join("b.db"), 2))
        .build()
        .await
        .unwrap();
    engine.start().await.unwrap();

    let result = engine
        .controller()
        .submit_batch(
            vec![
                SubmitTaskRequestBuilder::health_check().build(),
                SubmitTaskRequestBuilder::new("mine_bitcoin").build(),
                SubmitTaskRequestBuilder::health_check().build(),
            ],
            false,
        )
        .await
        .unwrap();
    assert_eq!(result.total_submitted, 2);
    assert_eq!(result.total_failed, 1);

    for item in result.items.iter().filter_map(|i| i.receipt.as_ref()) {
        wait_for(&engine, item.task_id, TaskStatus::Completed).await;
    }
    engine.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_scenario_scheduled_task_waits_for_clock() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::starting_now());
    let engine = TaskEngine::builder(test_config(&dir.path().join("c.db"), 2))
        .clock(clock.clone())
        .build()
        .await
        .unwrap();
    engine.start().await.unwrap();

    let receipt = engine
        .controller()
        .submit(
            SubmitTaskRequestBuilder::health_check()
                .scheduled_for(clock.now() + ChronoDuration::seconds(60))
                .build(),
        )
        .await
        .unwrap();
    assert_eq!(receipt.status, TaskStatus::Queued);

    tokio::time::sleep(Duration::from_millis(300)).await;
    let task = engine.lifecycle().get(receipt.task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Queued);
    assert!(task.worker_id.is_none());

    clock.advance_secs(61);
    let task = wait_for(&engine, receipt.task_id, TaskStatus::Completed).await;
    assert!(task.started_at.unwrap() >= task.scheduled_for.unwrap());

    engine.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_priority_precedence_on_single_slot() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = RecordingExecutor::new();
    let engine = TaskEngine::builder(test_config(&dir.path().join("p.db"), 1))
        .executor(recorder.clone())
        .build()
        .await
        .unwrap();

    let controller = engine.controller();
    for (label, priority) in [
        ("low", "low"),
        ("normal", "normal"),
        ("critical", "critical"),
        ("high", "high"),
    ] {
        controller.submit(labelled(label, priority)).await.unwrap();
    }

    engine.start().await.unwrap();
    assert!(TestEnv::wait_for(|| async { recorder.order().len() == 4 }, WAIT).await);
    assert_eq!(recorder.order(), vec!["critical", "high", "normal", "low"]);
    engine.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_bounded_retries_end_in_failed() {
    let dir = tempfile::tempdir().unwrap();
    let executor = ScriptedExecutor::new("flaky", Script::AlwaysFail("boom".to_string()));
    let engine = TaskEngine::builder(test_config(&dir.path().join("r.db"), 2))
        .executor(executor.clone())
        .build()
        .await
        .unwrap();
    engine.start().await.unwrap();

    let receipt = engine
        .controller()
        .submit(SubmitTaskRequestBuilder::new("flaky").max_retries(3).build())
        .await
        .unwrap();
    let task = wait_for(&engine, receipt.task_id, TaskStatus::Failed).await;
    assert_eq!(task.retry_count, 3);
    assert_eq!(executor.calls(), 4);
    assert!(task.error_message.unwrap().contains("boom"));

    let history = engine
        .lifecycle()
        .repository()
        .history(receipt.task_id)
        .await
        .unwrap();
    let count = |status: TaskStatus| history.iter().filter(|h| h.new_status == status).count();
    assert_eq!(count(TaskStatus::Processing), 4);
    assert_eq!(count(TaskStatus::Retrying), 3);
    assert_eq!(count(TaskStatus::Failed), 1);
    assert_eq!(history.last().unwrap().new_status, TaskStatus::Failed);

    // 终态幂等：失败任务不能取消，记录保持不变
    let err = engine
        .controller()
        .cancel(receipt.task_id, "test")
        .await
        .unwrap_err();
    assert!(err.is_conflict());
    let after = engine.lifecycle().get(receipt.task_id).await.unwrap();
    assert_eq!(after.status, TaskStatus::Failed);
    assert_eq!(after.updated_at, task.updated_at);

    engine.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_completed_task_rejects_retry() {
    let dir = tempfile::tempdir().unwrap();
    let engine = TaskEngine::builder(test_config(&dir.path().join("i.db"), 1))
        .build()
        .await
        .unwrap();
    engine.start().await.unwrap();

    let receipt = engine
        .controller()
        .submit(SubmitTaskRequestBuilder::health_check().build())
        .await
        .unwrap();
    let done = wait_for(&engine, receipt.task_id, TaskStatus::Completed).await;

    let err = engine
        .controller()
        .retry(receipt.task_id, "test")
        .await
        .unwrap_err();
    assert!(err.is_conflict());
    let after = engine.lifecycle().get(receipt.task_id).await.unwrap();
    assert_eq!(after.status, TaskStatus::Completed);
    assert_eq!(after.retry_count, done.retry_count);
    assert_eq!(after.updated_at, done.updated_at);

    engine.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_canceled_queued_task_is_never_claimed() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = RecordingExecutor::new();
    let engine = TaskEngine::builder(test_config(&dir.path().join("x.db"), 2))
        .executor(recorder.clone())
        .build()
        .await
        .unwrap();

    let controller = engine.controller();
    let canceled = controller.submit(labelled("canceled", "critical")).await.unwrap();
    let kept = controller.submit(labelled("kept", "low")).await.unwrap();
    let task = controller.cancel(canceled.task_id, "test").await.unwrap();
    assert_eq!(task.status, TaskStatus::Canceled);

    engine.start().await.unwrap();
    wait_for(&engine, kept.task_id, TaskStatus::Completed).await;
    // 再等一个恢复周期，确认不会被重新入队
    tokio::time::sleep(Duration::from_millis(1_200)).await;

    assert_eq!(recorder.order(), vec!["kept"]);
    let task = engine.lifecycle().get(canceled.task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Canceled);
    assert!(task.worker_id.is_none());
    engine.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_timeout_and_panic_go_through_retry_path() {
    let dir = tempfile::tempdir().unwrap();
    let slow = ScriptedExecutor::sleep("slow", Duration::from_secs(30));
    let broken = ScriptedExecutor::panic("broken");
    let engine = TaskEngine::builder(test_config(&dir.path().join("t.db"), 2))
        .executor(slow.clone())
        .executor(broken.clone())
        .build()
        .await
        .unwrap();
    engine.start().await.unwrap();

    let controller = engine.controller();
    let slow_id = controller
        .submit(
            SubmitTaskRequestBuilder::new("slow")
                .timeout_ms(200)
                .max_retries(0)
                .build(),
        )
        .await
        .unwrap()
        .task_id;
    let broken_id = controller
        .submit(SubmitTaskRequestBuilder::new("broken").max_retries(1).build())
        .await
        .unwrap()
        .task_id;

    let timed_out = wait_for(&engine, slow_id, TaskStatus::Failed).await;
    assert!(timed_out.error_message.unwrap().contains("200ms"));
    let panicked = wait_for(&engine, broken_id, TaskStatus::Failed).await;
    assert_eq!(panicked.retry_count, 1);
    assert_eq!(broken.calls(), 2);

    // 两个 Worker 在超时和 panic 之后仍然可用
    let receipt = controller
        .submit(SubmitTaskRequestBuilder::health_check().build())
        .await
        .unwrap();
    wait_for(&engine, receipt.task_id, TaskStatus::Completed).await;
    engine.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_two_engines_share_store_without_double_execution() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shared.db");
    let recorder = RecordingExecutor::new();

    // 两个引擎各自持有独立的内存队列，只通过存储的条件更新协调
    let first = TaskEngine::builder(test_config(&path, 3))
        .queue(Arc::new(InMemoryTaskQueue::new()) as Arc<dyn TaskQueue>)
        .executor(recorder.clone())
        .build()
        .await
        .unwrap();
    let second = TaskEngine::builder(test_config(&path, 3))
        .queue(Arc::new(InMemoryTaskQueue::new()) as Arc<dyn TaskQueue>)
        .executor(recorder.clone())
        .build()
        .await
        .unwrap();

    let mut ids = Vec::new();
    for i in 0..30 {
        let receipt = first
            .controller()
            .submit(labelled(&format!("task-{i}"), "normal"))
            .await
            .unwrap();
        ids.push(receipt.task_id);
    }

    // 第二个引擎启动时的恢复扫描会把同一批任务推入自己的队列
    second.start().await.unwrap();
    first.start().await.unwrap();

    for id in &ids {
        wait_for(&first, *id, TaskStatus::Completed).await;
    }
    tokio::time::sleep(Duration::from_millis(300)).await;

    let mut executed = recorder.order();
    assert_eq!(executed.len(), 30);
    executed.sort();
    executed.dedup();
    assert_eq!(executed.len(), 30);

    first.shutdown().await.unwrap();
    second.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_engine_start_stop_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let engine = TaskEngine::builder(test_config(&dir.path().join("l.db"), 1))
        .build()
        .await
        .unwrap();
    assert!(!engine.is_running().await);
    engine.stop().await.unwrap();

    engine.start().await.unwrap();
    assert!(engine.is_running().await);
    let err = engine.start().await.unwrap_err();
    assert_eq!(err.error_code(), "INTERNAL_ERROR");

    engine.stop().await.unwrap();
    assert!(!engine.is_running().await);
    engine.start().await.unwrap();
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_engine_start_failure_leaves_engine_stopped() {
    let dir = tempfile::tempdir().unwrap();
    let engine = TaskEngine::builder(test_config(&dir.path().join("f.db"), 1))
        .build()
        .await
        .unwrap();

    // Worker 池已被单独启动，引擎启动失败并收回恢复扫描任务
    engine.pool().start().await.unwrap();
    let err = engine.start().await.unwrap_err();
    assert_eq!(err.error_code(), "INTERNAL_ERROR");
    assert!(!engine.is_running().await);

    engine.pool().stop().await.unwrap();
    engine.start().await.unwrap();
    assert!(engine.is_running().await);
    engine.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_claims_on_sqlite_have_single_winner() {
    let dir = tempfile::tempdir().unwrap();
    let engine = TaskEngine::builder(test_config(&dir.path().join("s.db"), 1))
        .build()
        .await
        .unwrap();
    let receipt = engine
        .controller()
        .submit(SubmitTaskRequestBuilder::health_check().build())
        .await
        .unwrap();

    let mut handles = Vec::new();
    for i in 0..200 {
        let repo = engine.lifecycle().repository().clone();
        let id = receipt.task_id;
        handles.push(tokio::spawn(async move {
            let now = chrono::Utc::now();
            repo.update_status(
                id,
                TaskStatus::Queued,
                StatusTransition::new(TaskStatus::Processing, format!("w-{i}"), now).with_update(
                    TaskUpdate::new()
                        .worker_id(Some(format!("w-{i}")))
                        .started_at(Some(now)),
                ),
            )
            .await
        }));
    }

    let mut winners = Vec::new();
    for handle in handles {
        match handle.await.unwrap() {
            Ok(outcome) => winners.push(outcome.task.worker_id),
            Err(e) => assert!(e.is_conflict(), "unexpected error: {e}"),
        }
    }
    assert_eq!(winners.len(), 1);

    let task = engine.lifecycle().get(receipt.task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Processing);
    assert_eq!(task.worker_id, winners[0]);
    let history = engine
        .lifecycle()
        .repository()
        .history(receipt.task_id)
        .await
        .unwrap();
    assert_eq!(history.len(), 2);
    engine.shutdown().await.unwrap();
}
