//! 测试数据构建器

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use taskq_domain::entities::{Payload, Task, TaskPriority, TaskStatus};
use taskq_domain::value_objects::SubmitTaskRequest;

fn payload_from(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        other => {
            let mut map = Payload::new();
            map.insert("value".to_string(), other);
            map
        }
    }
}

/// 构建任务实体
pub struct TaskBuilder {
    task: Task,
}

impl TaskBuilder {
    pub fn new() -> Self {
        Self {
            task: Task::new(
                "health_check",
                "tenant-test",
                payload_from(json!({"message": "test"})),
                Utc::now(),
            ),
        }
    }

    pub fn with_task_type(mut self, task_type: &str) -> Self {
        self.task.task_type = task_type.into();
        self
    }

    pub fn with_tenant(mut self, tenant_id: &str) -> Self {
        self.task.tenant_id = tenant_id.to_string();
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.task.priority = priority;
        self
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.task.status = status;
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.task.payload = payload_from(payload);
        self
    }

    pub fn with_retries(mut self, retry_count: u32, max_retries: u32) -> Self {
        self.task.retry_count = retry_count;
        self.task.max_retries = max_retries;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.task.timeout_ms = timeout_ms;
        self
    }

    pub fn with_created_at(mut self, at: DateTime<Utc>) -> Self {
        self.task.created_at = at;
        self.task.updated_at = at;
        self
    }

    pub fn with_scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.task.scheduled_for = Some(at);
        self
    }

    /// 模拟已被领取的任务
    pub fn claimed_by(mut self, worker_id: &str, at: DateTime<Utc>) -> Self {
        self.task.status = TaskStatus::Processing;
        self.task.worker_id = Some(worker_id.to_string());
        self.task.started_at = Some(at);
        self
    }

    pub fn build(self) -> Task {
        self.task
    }
}

impl Default for TaskBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// 构建提交请求
pub struct SubmitTaskRequestBuilder {
    request: SubmitTaskRequest,
}

impl SubmitTaskRequestBuilder {
    pub fn new(task_type: &str) -> Self {
        Self {
            request: SubmitTaskRequest::new(
                task_type,
                "tenant-test",
                payload_from(json!({"message": "test"})),
            ),
        }
    }

    pub fn health_check() -> Self {
        Self::new("health_check")
    }

    pub fn tenant(mut self, tenant_id: &str) -> Self {
        self.request.tenant_id = tenant_id.to_string();
        self
    }

    pub fn priority(mut self, priority: &str) -> Self {
        self.request.priority = Some(priority.to_string());
        self
    }

    pub fn payload(mut self, payload: Value) -> Self {
        self.request.payload = Some(payload_from(payload));
        self
    }

    pub fn without_payload(mut self) -> Self {
        self.request.payload = None;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.request.max_retries = Some(max_retries);
        self
    }

    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.request.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.request.scheduled_for = Some(at);
        self
    }

    pub fn build(self) -> SubmitTaskRequest {
        self.request
    }
}
