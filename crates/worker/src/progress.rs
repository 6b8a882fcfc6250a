use std::sync::Arc;

use taskq_dispatcher::TaskLifecycle;
use taskq_domain::ports::{clamp_progress, ProgressReporter, ProgressUpdate};
use taskq_errors::EngineError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// 每次执行的进度通道容量
const PROGRESS_BUFFER: usize = 64;

/// 进度中继：把执行器上报的进度写入存储并广播
///
/// 进度截断到 [0, 100]；回退或任务已不在 processing 时丢弃该次上报。
pub struct ProgressRelay {
    handle: JoinHandle<u64>,
    closing: CancellationToken,
}

impl ProgressRelay {
    pub fn spawn(
        lifecycle: Arc<TaskLifecycle>,
        task_id: Uuid,
        worker_id: String,
    ) -> (ProgressReporter, Self) {
        let (reporter, receiver) = ProgressReporter::channel(task_id, PROGRESS_BUFFER);
        let closing = CancellationToken::new();
        let handle = tokio::spawn(relay(lifecycle, worker_id, receiver, closing.clone()));
        (reporter, Self { handle, closing })
    }

    /// 关闭通道并等待已缓冲的上报写完，返回成功写入的次数
    ///
    /// 关闭后执行器再上报会得到 false；缓冲中的上报仍会落库。
    /// 超过 `timeout` 才中止中继，此时尚未写入的上报被丢弃。
    pub async fn finish(self, timeout: std::time::Duration) -> u64 {
        self.closing.cancel();
        let mut handle = self.handle;
        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(applied)) => applied,
            Ok(Err(e)) => {
                warn!("进度中继异常退出: {}", e);
                0
            }
            Err(_) => {
                handle.abort();
                warn!("进度中继在 {:?} 内未写完缓冲的上报，剩余上报被丢弃", timeout);
                0
            }
        }
    }
}

async fn relay(
    lifecycle: Arc<TaskLifecycle>,
    worker_id: String,
    mut receiver: mpsc::Receiver<ProgressUpdate>,
    closing: CancellationToken,
) -> u64 {
    let mut applied = 0;
    let mut closed = false;
    loop {
        let update = tokio::select! {
            update = receiver.recv() => update,
            _ = closing.cancelled(), if !closed => {
                // 拒绝新的上报，缓冲中的照常处理
                receiver.close();
                closed = true;
                continue;
            }
        };
        let Some(update) = update else { break };
        let progress = clamp_progress(update.progress);
        match lifecycle
            .progress(update.task_id, progress, &worker_id, update.message)
            .await
        {
            Ok(_) => applied += 1,
            Err(EngineError::Validation(msg)) => {
                debug!(task_id = %update.task_id, "忽略进度上报: {}", msg);
            }
            Err(e) if e.is_conflict() || e.is_not_found() => {
                debug!(task_id = %update.task_id, "任务已不在执行中，停止中继进度");
                break;
            }
            Err(e) => warn!(task_id = %update.task_id, "写入进度失败: {}", e),
        }
    }
    applied
}
