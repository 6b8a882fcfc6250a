//! Worker池
//!
//! 固定数量的执行槽位，每个槽位循环领取并执行任务，一次只处理一个任务。
//! 队列为空时在 `idle_poll_min_ms` 与 `idle_poll_max_ms` 之间指数退避等待，
//! 有新任务入队时被提前唤醒。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use taskq_config::WorkerConfig;
use taskq_dispatcher::{ClaimCoordinator, TaskLifecycle};
use taskq_domain::{
    entities::{Task, WorkerInfo, WorkerState},
    ports::{Clock, WorkerPoolState},
};
use taskq_errors::{EngineError, EngineResult};
use taskq_infrastructure::MetricsCollector;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::runner::TaskRunner;

/// 各槽位的簿记信息，按槽位下标索引
#[derive(Default)]
struct WorkerBook {
    workers: RwLock<Vec<WorkerInfo>>,
}

impl WorkerBook {
    fn reset(&self, workers: Vec<WorkerInfo>) {
        *self.write() = workers;
    }

    fn snapshot(&self) -> Vec<WorkerInfo> {
        match self.workers.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn update(&self, index: usize, f: impl FnOnce(&mut WorkerInfo)) {
        if let Some(worker) = self.write().get_mut(index) {
            f(worker);
        }
    }

    fn set_all(&self, state: WorkerState) {
        for worker in self.write().iter_mut() {
            if worker.state != WorkerState::Stopped {
                worker.state = state;
            }
        }
    }

    fn busy_count(&self) -> usize {
        self.snapshot()
            .iter()
            .filter(|w| w.state == WorkerState::Busy)
            .count()
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Vec<WorkerInfo>> {
        match self.workers.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

pub struct WorkerPool {
    config: WorkerConfig,
    runner: Arc<TaskRunner>,
    coordinator: Arc<ClaimCoordinator>,
    clock: Arc<dyn Clock>,
    book: Arc<WorkerBook>,
    running: AtomicBool,
    shutdown: Mutex<Option<CancellationToken>>,
    handles: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(
        config: WorkerConfig,
        runner: Arc<TaskRunner>,
        lifecycle: &TaskLifecycle,
        coordinator: Arc<ClaimCoordinator>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            runner,
            coordinator,
            clock: lifecycle.clock(),
            book: Arc::new(WorkerBook::default()),
            running: AtomicBool::new(false),
            shutdown: Mutex::new(None),
            handles: tokio::sync::Mutex::new(Vec::new()),
        })
    }

    pub fn runner(&self) -> &Arc<TaskRunner> {
        &self.runner
    }

    pub fn worker_ids(&self) -> Vec<String> {
        self.book
            .snapshot()
            .into_iter()
            .map(|w| w.worker_id)
            .collect()
    }

    pub async fn start(self: &Arc<Self>) -> EngineResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(EngineError::Internal("Worker池已在运行".into()));
        }

        let now = self.clock.now();
        let ids: Vec<String> = (0..self.config.pool_size)
            .map(|index| worker_id(&self.config.worker_id_prefix, index))
            .collect();
        self.book
            .reset(ids.iter().map(|id| WorkerInfo::new(id.as_str(), now)).collect());

        let token = CancellationToken::new();
        let mut handles = self.handles.lock().await;
        for (index, id) in ids.into_iter().enumerate() {
            let slot = WorkerSlot {
                index,
                worker_id: id,
                runner: Arc::clone(&self.runner),
                coordinator: Arc::clone(&self.coordinator),
                clock: Arc::clone(&self.clock),
                book: Arc::clone(&self.book),
                idle_min: Duration::from_millis(self.config.idle_poll_min_ms.max(1)),
                idle_max: Duration::from_millis(self.config.idle_poll_max_ms.max(1)),
                shutdown: token.clone(),
            };
            handles.push(tokio::spawn(slot.run()));
        }
        *self.lock_shutdown() = Some(token);

        info!("Worker池已启动，槽位数: {}", self.config.pool_size);
        Ok(())
    }

    /// 停止领取新任务，等待执行中的任务结束，超过 `shutdown_timeout_seconds` 后强制终止
    ///
    /// 被强制终止的任务保持 processing，由恢复扫描处理。
    pub async fn stop(&self) -> EngineResult<()> {
        if !self.running.load(Ordering::SeqCst) {
            return Ok(());
        }
        info!("正在停止Worker池");

        if let Some(token) = self.lock_shutdown().take() {
            token.cancel();
        }
        self.book.set_all(WorkerState::Stopping);
        self.coordinator.notify();

        let handles = std::mem::take(&mut *self.handles.lock().await);
        let timeout = Duration::from_secs(self.config.shutdown_timeout_seconds);
        let deadline = tokio::time::Instant::now() + timeout;
        for mut handle in handles {
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                warn!("Worker 未在 {:?} 内退出，强制终止", timeout);
                handle.abort();
            }
        }

        self.book.set_all(WorkerState::Stopped);
        self.running.store(false, Ordering::SeqCst);
        MetricsCollector::set_busy_workers(0);
        info!("Worker池已停止");
        Ok(())
    }

    fn lock_shutdown(&self) -> std::sync::MutexGuard<'_, Option<CancellationToken>> {
        match self.shutdown.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl WorkerPoolState for WorkerPool {
    fn workers(&self) -> Vec<WorkerInfo> {
        self.book.snapshot()
    }

    fn pool_size(&self) -> usize {
        self.config.pool_size
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// `{prefix}-{hostname}-{pid}-{index}`，多进程共享存储时保证唯一
fn worker_id(prefix: &str, index: usize) -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string());
    format!("{}-{}-{}-{}", prefix, host, std::process::id(), index)
}

struct WorkerSlot {
    index: usize,
    worker_id: String,
    runner: Arc<TaskRunner>,
    coordinator: Arc<ClaimCoordinator>,
    clock: Arc<dyn Clock>,
    book: Arc<WorkerBook>,
    idle_min: Duration,
    idle_max: Duration,
    shutdown: CancellationToken,
}

impl WorkerSlot {
    async fn run(self) {
        debug!(worker_id = %self.worker_id, "Worker 已启动");
        let mut idle_wait = self.idle_min;

        while !self.shutdown.is_cancelled() {
            let now = self.clock.now();
            self.book.update(self.index, |w| w.last_heartbeat = now);

            match self.coordinator.claim_next(&self.worker_id).await {
                Ok(Some(task)) => {
                    idle_wait = self.idle_min;
                    self.process(task).await;
                }
                Ok(None) => {
                    self.idle(idle_wait).await;
                    idle_wait = (idle_wait * 2).min(self.idle_max);
                }
                Err(e) => {
                    warn!(worker_id = %self.worker_id, "领取任务失败: {}", e);
                    self.idle(idle_wait).await;
                    idle_wait = (idle_wait * 2).min(self.idle_max);
                }
            }
        }

        self.book.update(self.index, |w| {
            w.state = WorkerState::Stopped;
            w.current_task = None;
        });
        debug!(worker_id = %self.worker_id, "Worker 已退出");
    }

    async fn idle(&self, wait: Duration) {
        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            _ = self.coordinator.wait_for_work(wait) => {}
        }
    }

    async fn process(&self, task: Task) {
        let now = self.clock.now();
        self.book.update(self.index, |w| {
            if w.state == WorkerState::Idle {
                w.state = WorkerState::Busy;
            }
            w.current_task = Some(task.id);
            w.last_heartbeat = now;
        });
        MetricsCollector::set_busy_workers(self.book.busy_count());

        let started = Instant::now();
        let succeeded = self.runner.run(&task, &self.worker_id).await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        let now = self.clock.now();
        self.book.update(self.index, |w| {
            w.record_finished(succeeded, elapsed_ms, now);
            if w.state == WorkerState::Busy {
                w.state = WorkerState::Idle;
            }
        });
        MetricsCollector::set_busy_workers(self.book.busy_count());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_worker_ids_are_distinct() {
        let a = worker_id("worker", 0);
        let b = worker_id("worker", 1);
        assert_ne!(a, b);
        assert!(a.starts_with("worker-"));
        assert!(a.ends_with("-0"));
    }

    #[test]
    fn test_book_state_transitions() {
        let book = WorkerBook::default();
        let now = Utc::now();
        book.reset(vec![WorkerInfo::new("w-0", now), WorkerInfo::new("w-1", now)]);

        book.update(0, |w| w.state = WorkerState::Busy);
        assert_eq!(book.busy_count(), 1);

        book.update(1, |w| w.state = WorkerState::Stopped);
        book.set_all(WorkerState::Stopping);
        let states: Vec<_> = book.snapshot().iter().map(|w| w.state).collect();
        assert_eq!(states, vec![WorkerState::Stopping, WorkerState::Stopped]);

        // 越界下标被忽略
        book.update(5, |w| w.processed = 99);
        assert!(book.snapshot().iter().all(|w| w.processed == 0));
    }
}
