//! 任务引擎指标
//!
//! 通过 `metrics` 门面记录，未安装 recorder 时所有调用均为空操作

use metrics::{counter, gauge, histogram};

pub struct MetricsCollector;

impl MetricsCollector {
    pub fn record_task_submitted(task_type: &str, priority: &str) {
        counter!(
            "taskq_tasks_submitted_total",
            "task_type" => task_type.to_string(),
            "priority" => priority.to_string()
        )
        .increment(1);
    }

    pub fn record_submit_rejected(reason: &'static str) {
        counter!("taskq_tasks_rejected_total", "reason" => reason).increment(1);
    }

    pub fn record_task_claimed(task_type: &str) {
        counter!("taskq_tasks_claimed_total", "task_type" => task_type.to_string()).increment(1);
    }

    pub fn record_claim_discarded() {
        counter!("taskq_claims_discarded_total").increment(1);
    }

    /// 记录一次执行结束，status 取 completed / failed / retrying / canceled
    pub fn record_task_finished(task_type: &str, status: &str, duration_seconds: f64) {
        counter!(
            "taskq_tasks_finished_total",
            "task_type" => task_type.to_string(),
            "status" => status.to_string()
        )
        .increment(1);
        histogram!(
            "taskq_task_execution_duration_seconds",
            "task_type" => task_type.to_string()
        )
        .record(duration_seconds);
    }

    pub fn record_task_retry(task_type: &str) {
        counter!("taskq_task_retries_total", "task_type" => task_type.to_string()).increment(1);
    }

    pub fn record_task_timeout(task_type: &str) {
        counter!("taskq_task_timeouts_total", "task_type" => task_type.to_string()).increment(1);
    }

    pub fn record_executor_panic(task_type: &str) {
        counter!("taskq_executor_panics_total", "task_type" => task_type.to_string())
            .increment(1);
    }

    pub fn record_recovered(kind: &'static str, n: usize) {
        counter!("taskq_recovery_actions_total", "kind" => kind).increment(n as u64);
    }

    pub fn set_queue_depth(depth: usize) {
        gauge!("taskq_queue_depth").set(depth as f64);
    }

    pub fn set_busy_workers(busy: usize) {
        gauge!("taskq_busy_workers").set(busy as f64);
    }

    pub fn set_subscribers(count: usize) {
        gauge!("taskq_event_subscribers").set(count as f64);
    }

    pub fn record_events_dropped(n: u64) {
        counter!("taskq_events_dropped_total").increment(n);
    }
}
