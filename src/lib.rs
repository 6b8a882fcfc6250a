//! # TaskQ
//!
//! 持久化优先级任务队列与异步执行引擎。
//!
//! 上游服务通过 [`TaskController`] 提交任务，任务记录写入 SQLite，
//! 由 Worker 池按优先级领取并交给注册的执行器执行；失败按指数退避重试，
//! 状态变化通过广播器推送给订阅者。
//!
//! ```no_run
//! use taskq::{TaskEngine, AppConfig};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let engine = TaskEngine::builder(AppConfig::default()).build().await?;
//! engine.start().await?;
//! let controller = engine.controller();
//! // controller.submit(...)
//! engine.stop().await?;
//! # Ok(())
//! # }
//! ```
//!
//! [`TaskController`]: taskq_dispatcher::TaskController

pub mod app;
pub mod engine;
pub mod shutdown;

pub use app::Application;
pub use engine::{TaskEngine, TaskEngineBuilder};
pub use shutdown::{wait_for_shutdown_signal, ShutdownManager};

pub use taskq_config::AppConfig;
pub use taskq_dispatcher::TaskController;
pub use taskq_domain::ports::{ExecutionContext, TaskExecutor};
pub use taskq_errors::{EngineError, EngineResult};
