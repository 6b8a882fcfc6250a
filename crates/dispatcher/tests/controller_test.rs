mod common;

use std::sync::Arc;

use chrono::Duration;
use common::Harness;
use serde_json::json;
use taskq_dispatcher::GetTaskOptions;
use taskq_domain::{
    entities::{Payload, TaskStatus},
    ports::Clock,
    events::EventFilter,
    repositories::TaskRepository,
    value_objects::{StatusTransition, TaskQuery, TaskUpdate},
};
use taskq_testing_utils::{queue_unavailable, MockTaskQueue, SubmitTaskRequestBuilder};

#[tokio::test]
async fn test_submit_returns_queued_receipt() {
    let h = Harness::new();
    let receipt = h
        .controller
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
    assert_eq!(receipt.queue_position, 1);
    assert!(h.queue.contains(receipt.task_id).await.unwrap());

    let task = h.task(receipt.task_id).await;
    assert_eq!(task.tenant_id, "t1");
    assert_eq!(task.max_retries, 3);
    assert_eq!(task.timeout_ms, 300_000);
    assert!(task.worker_id.is_none());
}

#[tokio::test]
async fn test_submit_validation_errors_never_persist() {
    let h = Harness::new();
    let cases = vec![
        SubmitTaskRequestBuilder::new("mine_bitcoin").build(),
        SubmitTaskRequestBuilder::health_check().tenant("  ").build(),
        SubmitTaskRequestBuilder::health_check().priority("urgent").build(),
        SubmitTaskRequestBuilder::health_check().without_payload().build(),
        SubmitTaskRequestBuilder::health_check().max_retries(50).build(),
        SubmitTaskRequestBuilder::health_check().timeout_ms(0).build(),
        SubmitTaskRequestBuilder::health_check()
            .timeout_ms(10 * 3_600_000)
            .build(),
    ];

    for request in cases {
        let err = h.controller.submit(request).await.unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR", "{err}");
        assert!(!err.is_retryable());
    }
    assert_eq!(h.repo.count(), 0);
    assert_eq!(h.queue.len().await.unwrap(), 0);
}

#[tokio::test]
async fn test_queue_position_respects_priority() {
    let h = Harness::new();
    for _ in 0..3 {
        h.controller
            .submit(SubmitTaskRequestBuilder::health_check().priority("low").build())
            .await
            .unwrap();
    }
    let critical = h
        .controller
        .submit(SubmitTaskRequestBuilder::health_check().priority("critical").build())
        .await
        .unwrap();
    assert_eq!(critical.queue_position, 1);

    let normal = h
        .controller
        .submit(SubmitTaskRequestBuilder::health_check().build())
        .await
        .unwrap();
    assert_eq!(normal.queue_position, 2);
}

#[tokio::test]
async fn test_batch_partial_success() {
    let h = Harness::new();
    let requests = vec![
        SubmitTaskRequestBuilder::health_check().build(),
        SubmitTaskRequestBuilder::new("not_a_type").build(),
        SubmitTaskRequestBuilder::health_check().priority("high").build(),
    ];

    let result = h.controller.submit_batch(requests, false).await.unwrap();
    assert_eq!(result.total_submitted, 2);
    assert_eq!(result.total_failed, 1);
    assert_eq!(result.items.len(), 3);
    assert!(!result.items[1].is_success());
    assert_eq!(result.items[1].error_code.as_deref(), Some("VALIDATION_ERROR"));
    assert_eq!(h.repo.count(), 2);
    assert_eq!(h.queue.len().await.unwrap(), 2);
}

#[tokio::test]
async fn test_batch_fail_on_first_error_rejects_whole_batch() {
    let h = Harness::new();
    let requests = vec![
        SubmitTaskRequestBuilder::health_check().build(),
        SubmitTaskRequestBuilder::health_check().priority("bogus").build(),
    ];

    let err = h.controller.submit_batch(requests, true).await.unwrap_err();
    assert_eq!(err.error_code(), "VALIDATION_ERROR");
    assert!(err.to_string().contains("第 1 个任务"));
    assert_eq!(h.repo.count(), 0);
}

#[tokio::test]
async fn test_batch_fail_on_first_error_stops_on_infrastructure_error() {
    let h = Harness::new();
    h.repo.set_unavailable(true);
    let requests = vec![
        SubmitTaskRequestBuilder::health_check().build(),
        SubmitTaskRequestBuilder::health_check().build(),
    ];

    let result = h.controller.submit_batch(requests, true).await.unwrap();
    assert_eq!(result.total_submitted, 0);
    assert_eq!(result.total_failed, 1);
    assert_eq!(result.items[0].error_code.as_deref(), Some("DATABASE_UNAVAILABLE"));
}

#[tokio::test]
async fn test_submit_reports_store_unavailable() {
    let h = Harness::new();
    h.repo.set_unavailable(true);
    let err = h
        .controller
        .submit(SubmitTaskRequestBuilder::health_check().build())
        .await
        .unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(err.error_code(), "DATABASE_UNAVAILABLE");
}

#[tokio::test]
async fn test_submit_survives_queue_outage() {
    let mut queue = MockTaskQueue::new();
    queue.expect_push().returning(|_| Err(queue_unavailable()));
    let h = Harness::with_queue(Arc::new(queue));

    let receipt = h
        .controller
        .submit(SubmitTaskRequestBuilder::health_check().build())
        .await
        .unwrap();
    // 任务已持久化，入队由恢复扫描补齐
    assert_eq!(receipt.queue_position, 0);
    assert_eq!(h.task(receipt.task_id).await.status, TaskStatus::Queued);
}

#[tokio::test]
async fn test_cancel_queued_task_is_never_claimed() {
    let h = Harness::new();
    let task = h.submit(SubmitTaskRequestBuilder::health_check().build()).await;

    let canceled = h.controller.cancel(task.id, "operator").await.unwrap();
    assert_eq!(canceled.status, TaskStatus::Canceled);
    assert!(canceled.completed_at.is_some());
    assert!(!h.queue.contains(task.id).await.unwrap());
    assert!(h.claim("worker-1").await.is_none());
    assert_eq!(h.task(task.id).await.status, TaskStatus::Canceled);
}

#[tokio::test]
async fn test_cancel_processing_signals_worker() {
    let h = Harness::new();
    let task = h.submit(SubmitTaskRequestBuilder::health_check().build()).await;
    let claimed = h.claim("worker-1").await.unwrap();
    let token = h.cancellations.register(claimed.id);

    let canceled = h.controller.cancel(task.id, "operator").await.unwrap();
    assert_eq!(canceled.status, TaskStatus::Canceled);
    assert!(token.is_cancelled());

    // 取消后的执行结果被丢弃
    let err = h
        .retry
        .complete(&claimed, Payload::new(), "worker-1")
        .await
        .unwrap_err();
    assert!(err.is_conflict());
    assert_eq!(h.task(task.id).await.status, TaskStatus::Canceled);
}

#[tokio::test]
async fn test_terminal_states_reject_cancel_and_retry() {
    let h = Harness::new();
    let task = h.submit(SubmitTaskRequestBuilder::health_check().build()).await;
    let claimed = h.claim("worker-1").await.unwrap();
    h.retry
        .complete(&claimed, Payload::new(), "worker-1")
        .await
        .unwrap();
    let before = h.task(task.id).await;

    let err = h.controller.retry(task.id, "operator").await.unwrap_err();
    assert!(err.is_conflict());
    let err = h.controller.cancel(task.id, "operator").await.unwrap_err();
    assert!(err.is_conflict());

    assert_eq!(h.task(task.id).await, before);

    let err = h
        .controller
        .cancel(uuid::Uuid::new_v4(), "operator")
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_operator_retry_resets_failed_task() {
    let h = Harness::new();
    let task = h
        .submit(SubmitTaskRequestBuilder::health_check().max_retries(0).build())
        .await;
    let claimed = h.claim("worker-1").await.unwrap();
    let failed = h
        .retry
        .handle_failure(
            &claimed,
            &taskq_dispatcher::ExecutionFailure::error("boom"),
            "worker-1",
        )
        .await
        .unwrap();
    assert_eq!(failed.status, TaskStatus::Failed);

    // failed 任务不能取消
    assert!(h.controller.cancel(task.id, "operator").await.unwrap_err().is_conflict());

    let receipt = h.controller.retry(task.id, "operator").await.unwrap();
    assert_eq!(receipt.status, TaskStatus::Queued);
    let reset = h.task(task.id).await;
    assert_eq!(reset.retry_count, 0);
    assert_eq!(reset.progress, 0);
    assert!(reset.error_message.is_none());
    assert!(reset.worker_id.is_none());
    assert!(reset.started_at.is_none());
    assert!(reset.completed_at.is_none());
    assert!(h.queue.contains(task.id).await.unwrap());
}

#[tokio::test]
async fn test_progress_updates_are_clamped_and_monotonic() {
    let h = Harness::new();
    let task = h.submit(SubmitTaskRequestBuilder::health_check().build()).await;

    // 排队中不接受进度
    let err = h
        .controller
        .update_progress(task.id, 10, None, "worker-1")
        .await
        .unwrap_err();
    assert!(err.is_conflict());

    h.claim("worker-1").await.unwrap();
    let updated = h
        .controller
        .update_progress(task.id, 40, Some("parsing".into()), "worker-1")
        .await
        .unwrap();
    assert_eq!(updated.progress, 40);

    let err = h
        .controller
        .update_progress(task.id, 20, None, "worker-1")
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "VALIDATION_ERROR");

    let clamped = h
        .controller
        .update_progress(task.id, 250, None, "worker-1")
        .await
        .unwrap();
    assert_eq!(clamped.progress, 100);
    assert_eq!(clamped.status, TaskStatus::Processing);
}

#[tokio::test]
async fn test_subscribe_receives_transitions_in_order() {
    let h = Harness::new();
    let mut all = h.controller.subscribe(EventFilter::for_tenant("t-events")).await.unwrap();

    let task = h
        .submit(SubmitTaskRequestBuilder::health_check().tenant("t-events").build())
        .await;
    let mut single = h.controller.subscribe(EventFilter::for_task(task.id)).await.unwrap();

    let claimed = h.claim("worker-1").await.unwrap();
    h.controller
        .update_progress(task.id, 50, Some("half".into()), "worker-1")
        .await
        .unwrap();
    h.retry
        .complete(&claimed, Payload::new(), "worker-1")
        .await
        .unwrap();

    let created = all.recv().await.unwrap();
    assert_eq!(created.event_type(), "created");
    assert_eq!(all.recv().await.unwrap().new_status, TaskStatus::Processing);

    let mut statuses = Vec::new();
    while let Some(event) = single.recv().await {
        statuses.push((event.new_status, event.progress));
    }
    assert_eq!(
        statuses,
        vec![
            (TaskStatus::Processing, 0),
            (TaskStatus::Processing, 50),
            (TaskStatus::Completed, 100),
        ]
    );
}

#[tokio::test]
async fn test_subscribe_to_finished_task_yields_snapshot() {
    let h = Harness::new();
    let task = h.submit(SubmitTaskRequestBuilder::health_check().build()).await;
    h.controller.cancel(task.id, "operator").await.unwrap();

    let mut sub = h.controller.subscribe(EventFilter::for_task(task.id)).await.unwrap();
    let snapshot = sub.recv().await.unwrap();
    assert_eq!(snapshot.new_status, TaskStatus::Canceled);
    assert_eq!(snapshot.event_type(), "snapshot");
    assert!(sub.recv().await.is_none());

    let err = h
        .controller
        .subscribe(EventFilter::for_task(uuid::Uuid::new_v4()))
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_get_with_history_and_without_result() {
    let h = Harness::new();
    let task = h.submit(SubmitTaskRequestBuilder::health_check().build()).await;
    let claimed = h.claim("worker-1").await.unwrap();
    let mut result = Payload::new();
    result.insert("answer".into(), json!(42));
    h.retry.complete(&claimed, result, "worker-1").await.unwrap();

    let details = h
        .controller
        .get(
            task.id,
            GetTaskOptions {
                include_result: true,
                include_history: true,
            },
        )
        .await
        .unwrap();
    assert_eq!(details.task.result.as_ref().unwrap()["answer"], 42);
    let history = details.history.unwrap();
    assert_eq!(history.len(), 3);
    assert_eq!(history[0].actor, "system");
    assert_eq!(history[1].actor, "worker-1");

    let details = h
        .controller
        .get(
            task.id,
            GetTaskOptions {
                include_result: false,
                include_history: false,
            },
        )
        .await
        .unwrap();
    assert!(details.task.result.is_none());
    assert!(details.history.is_none());
}

#[tokio::test]
async fn test_list_and_statistics() {
    let h = Harness::new();
    for tenant in ["a", "a", "b"] {
        h.submit(SubmitTaskRequestBuilder::health_check().tenant(tenant).build())
            .await;
    }
    let claimed = h.claim("worker-1").await.unwrap();
    h.clock.advance(Duration::milliseconds(250));
    h.retry
        .complete(&claimed, Payload::new(), "worker-1")
        .await
        .unwrap();

    let page = h
        .controller
        .list(&TaskQuery {
            page_size: 2,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(page.total, 3);
    assert_eq!(page.items.len(), 2);

    let err = h
        .controller
        .list(&TaskQuery {
            page: 0,
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "VALIDATION_ERROR");

    let stats = h.controller.statistics(None).await.unwrap();
    assert_eq!(stats.total, 3);
    assert_eq!(stats.counts.completed, 1);
    assert_eq!(stats.counts.queued, 2);
    assert_eq!(stats.success_rate, Some(1.0));
    assert_eq!(stats.avg_processing_ms, Some(250.0));
    assert_eq!(stats.completed_recently, 1);
    assert_eq!(stats.queue.depth, 2);
    assert_eq!(stats.queue.backend, "memory");
    assert_eq!(stats.by_tenant["a"].total() + stats.by_tenant["b"].total(), 3);

    let tenant_b = h.controller.statistics(Some("b")).await.unwrap();
    assert_eq!(tenant_b.total, 1);
}

#[tokio::test]
async fn test_cancel_task_processing_in_another_process() {
    let h = Harness::new();
    let task = h.submit(SubmitTaskRequestBuilder::health_check().build()).await;

    // 另一个实例领取了任务，本进程没有对应的取消令牌
    let now = h.clock.now();
    h.repo
        .update_status(
            task.id,
            TaskStatus::Queued,
            StatusTransition::new(TaskStatus::Processing, "remote", now)
                .with_update(TaskUpdate::new().worker_id(Some("remote".into())).started_at(Some(now))),
        )
        .await
        .unwrap();

    let canceled = h.controller.cancel(task.id, "operator").await.unwrap();
    assert_eq!(canceled.status, TaskStatus::Canceled);
    assert_eq!(canceled.worker_id.as_deref(), Some("remote"));
    assert_eq!(h.cancellations.active_count(), 0);
}
