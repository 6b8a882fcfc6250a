//! 测试等待辅助

use std::future::Future;
use std::time::Duration;

use taskq_domain::entities::{Task, TaskStatus};
use taskq_domain::repositories::TaskRepository;
use tokio::time::{sleep, Instant};
use uuid::Uuid;

pub struct TestEnv;

impl TestEnv {
    /// 轮询直到条件成立或超时
    pub async fn wait_for<F, Fut>(mut condition: F, timeout: Duration) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition().await {
                return true;
            }
            sleep(Duration::from_millis(10)).await;
        }
        condition().await
    }
}

/// 等待任务进入指定状态，超时返回 None
pub async fn wait_for_status(
    repo: &dyn TaskRepository,
    id: Uuid,
    status: TaskStatus,
    timeout: Duration,
) -> Option<Task> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Ok(Some(task)) = repo.get(id).await {
            if task.status == status {
                return Some(task);
            }
        }
        if Instant::now() >= deadline {
            return None;
        }
        sleep(Duration::from_millis(10)).await;
    }
}
