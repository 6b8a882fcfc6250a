//! 脚本化执行器
//!
//! 按预设行为执行的 `TaskExecutor`，用于驱动 Worker 池的各种执行结果。

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use taskq_domain::entities::Payload;
use taskq_domain::ports::{ExecutionContext, ProgressReporter, TaskExecutor};
use taskq_errors::{EngineError, EngineResult};
use tokio::sync::Notify;

#[derive(Debug, Clone)]
pub enum Script {
    /// 返回 `{"echo": payload, "attempt": n}`
    Succeed,
    AlwaysFail(String),
    /// 前 n 次失败，之后成功
    FailTimes(u32),
    /// 不理会取消，睡眠指定时间后成功
    Sleep(Duration),
    Panic(String),
    /// 依次上报进度后成功
    ProgressSteps(Vec<i64>),
    /// 一直等待直到收到取消信号
    WaitForCancel,
}

pub struct ScriptedExecutor {
    name: String,
    script: Script,
    calls: AtomicU32,
    started: Notify,
}

impl ScriptedExecutor {
    pub fn new(name: &str, script: Script) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            script,
            calls: AtomicU32::new(0),
            started: Notify::new(),
        })
    }

    pub fn succeed(name: &str) -> Arc<Self> {
        Self::new(name, Script::Succeed)
    }

    pub fn always_fail(name: &str) -> Arc<Self> {
        Self::new(name, Script::AlwaysFail("scripted failure".to_string()))
    }

    pub fn fail_times(name: &str, n: u32) -> Arc<Self> {
        Self::new(name, Script::FailTimes(n))
    }

    pub fn sleep(name: &str, duration: Duration) -> Arc<Self> {
        Self::new(name, Script::Sleep(duration))
    }

    pub fn panic(name: &str) -> Arc<Self> {
        Self::new(name, Script::Panic("scripted panic".to_string()))
    }

    pub fn progress_steps(name: &str, steps: Vec<i64>) -> Arc<Self> {
        Self::new(name, Script::ProgressSteps(steps))
    }

    pub fn cooperative_wait(name: &str) -> Arc<Self> {
        Self::new(name, Script::WaitForCancel)
    }

    /// 已被调用的次数
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// 等待执行开始，执行先于等待发生时也会立即返回
    pub async fn wait_started(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.started.notified())
            .await
            .is_ok()
    }
}

fn echo(payload: Payload, attempt: u32) -> Payload {
    let mut result = Payload::new();
    result.insert("echo".to_string(), serde_json::Value::Object(payload));
    result.insert("attempt".to_string(), json!(attempt));
    result
}

#[async_trait]
impl TaskExecutor for ScriptedExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "scripted test executor"
    }

    async fn execute(
        &self,
        context: ExecutionContext,
        payload: Payload,
        progress: ProgressReporter,
    ) -> EngineResult<Payload> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.started.notify_one();

        match &self.script {
            Script::Succeed => Ok(echo(payload, context.attempt)),
            Script::AlwaysFail(message) => Err(EngineError::execution(message.clone())),
            Script::FailTimes(n) => {
                if call <= *n {
                    Err(EngineError::execution(format!("scripted failure {call}/{n}")))
                } else {
                    Ok(echo(payload, context.attempt))
                }
            }
            Script::Sleep(duration) => {
                tokio::time::sleep(*duration).await;
                Ok(echo(payload, context.attempt))
            }
            Script::Panic(message) => panic!("{}", message),
            Script::ProgressSteps(steps) => {
                for step in steps {
                    progress.report(*step, Some(format!("step {step}"))).await;
                    tokio::task::yield_now().await;
                }
                Ok(echo(payload, context.attempt))
            }
            Script::WaitForCancel => {
                context.cancelled().await;
                Err(EngineError::Canceled)
            }
        }
    }
}
