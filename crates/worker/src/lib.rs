//! 任务执行层
//!
//! 执行器注册表、内置执行器、进度中继和固定大小的Worker池。

pub mod executors;
pub mod pool;
pub mod progress;
pub mod registry;
pub mod runner;

pub use executors::HealthCheckExecutor;
pub use pool::WorkerPool;
pub use progress::ProgressRelay;
pub use registry::ExecutorRegistry;
pub use runner::{ExecutionOutcome, TaskRunner};
