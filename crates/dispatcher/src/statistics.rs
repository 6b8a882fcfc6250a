//! 统计聚合
//!
//! 计数与耗时来自存储，队列深度来自队列，Worker 状态来自 Worker 池快照；
//! 只做读取，不持有任何会阻塞 Worker 的锁。

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use taskq_domain::{
    entities::{WorkerInfo, WorkerState},
    ports::{Clock, TaskQueue, WorkerPoolState},
    repositories::TaskRepository,
    value_objects::StatusCounts,
};
use taskq_errors::EngineResult;
use taskq_infrastructure::MetricsCollector;

/// 吞吐量统计窗口（分钟）
const THROUGHPUT_WINDOW_MINUTES: i64 = 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStats {
    pub backend: String,
    /// 含尚未到期的延迟条目
    pub depth: usize,
    pub ready: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerPoolSnapshot {
    pub running: bool,
    pub pool_size: usize,
    pub idle: usize,
    pub busy: usize,
    pub stopping: usize,
    pub stopped: usize,
    pub workers: Vec<WorkerInfo>,
}

impl WorkerPoolSnapshot {
    pub fn from_state(state: &dyn WorkerPoolState) -> Self {
        let workers = state.workers();
        let count = |s: WorkerState| workers.iter().filter(|w| w.state == s).count();
        Self {
            running: state.is_running(),
            pool_size: state.pool_size(),
            idle: count(WorkerState::Idle),
            busy: count(WorkerState::Busy),
            stopping: count(WorkerState::Stopping),
            stopped: count(WorkerState::Stopped),
            workers,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatistics {
    pub generated_at: DateTime<Utc>,
    pub tenant_id: Option<String>,
    pub total: u64,
    pub counts: StatusCounts,
    pub success_rate: Option<f64>,
    pub avg_processing_ms: Option<f64>,
    /// 最近一个窗口内完成的任务数
    pub completed_recently: u64,
    pub throughput_per_minute: f64,
    pub by_type: BTreeMap<String, StatusCounts>,
    pub by_priority: BTreeMap<String, StatusCounts>,
    pub by_tenant: BTreeMap<String, StatusCounts>,
    pub queue: QueueStats,
    pub workers: WorkerPoolSnapshot,
}

pub struct StatisticsAggregator {
    repo: Arc<dyn TaskRepository>,
    queue: Arc<dyn TaskQueue>,
    clock: Arc<dyn Clock>,
    pool: RwLock<Option<Arc<dyn WorkerPoolState>>>,
}

impl StatisticsAggregator {
    pub fn new(
        repo: Arc<dyn TaskRepository>,
        queue: Arc<dyn TaskQueue>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            repo,
            queue,
            clock,
            pool: RwLock::new(None),
        }
    }

    /// Worker 池在控制器之后创建，启动时再挂上
    pub fn attach_worker_pool(&self, pool: Arc<dyn WorkerPoolState>) {
        match self.pool.write() {
            Ok(mut guard) => *guard = Some(pool),
            Err(poisoned) => *poisoned.into_inner() = Some(pool),
        }
    }

    fn worker_snapshot(&self) -> WorkerPoolSnapshot {
        let pool = match self.pool.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        pool.map(|p| WorkerPoolSnapshot::from_state(p.as_ref()))
            .unwrap_or_default()
    }

    pub async fn collect(&self, tenant_id: Option<&str>) -> EngineResult<TaskStatistics> {
        let now = self.clock.now();
        let aggregate = self.repo.aggregate(tenant_id).await?;
        let since = now - chrono::Duration::minutes(THROUGHPUT_WINDOW_MINUTES);
        let completed_recently = self.repo.count_completed_since(tenant_id, since).await?;

        let depth = self.queue.len().await?;
        let ready = self.queue.ready_len(now).await?;
        MetricsCollector::set_queue_depth(depth);

        Ok(TaskStatistics {
            generated_at: now,
            tenant_id: tenant_id.map(str::to_string),
            total: aggregate.counts.total(),
            counts: aggregate.counts,
            success_rate: aggregate.counts.success_rate(),
            avg_processing_ms: aggregate.avg_processing_ms,
            completed_recently,
            throughput_per_minute: completed_recently as f64 / THROUGHPUT_WINDOW_MINUTES as f64,
            by_type: aggregate.by_type,
            by_priority: aggregate.by_priority,
            by_tenant: aggregate.by_tenant,
            queue: QueueStats {
                backend: self.queue.backend_name().to_string(),
                depth,
                ready,
            },
            workers: self.worker_snapshot(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedPool(Vec<WorkerInfo>);

    impl WorkerPoolState for FixedPool {
        fn workers(&self) -> Vec<WorkerInfo> {
            self.0.clone()
        }

        fn pool_size(&self) -> usize {
            self.0.len()
        }

        fn is_running(&self) -> bool {
            true
        }
    }

    #[test]
    fn test_worker_snapshot_counts_states() {
        let now = Utc::now();
        let mut busy = WorkerInfo::new("w-1", now);
        busy.state = WorkerState::Busy;
        let idle = WorkerInfo::new("w-2", now);
        let mut stopped = WorkerInfo::new("w-3", now);
        stopped.state = WorkerState::Stopped;

        let snapshot = WorkerPoolSnapshot::from_state(&FixedPool(vec![busy, idle, stopped]));
        assert!(snapshot.running);
        assert_eq!(snapshot.pool_size, 3);
        assert_eq!(snapshot.busy, 1);
        assert_eq!(snapshot.idle, 1);
        assert_eq!(snapshot.stopped, 1);
    }
}
