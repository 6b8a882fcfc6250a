//! 调度核心
//!
//! 领取协调、执行结果与重试处理、取消、恢复扫描和统计聚合，以及对外的任务控制器。

pub mod cancellation;
pub mod claim;
pub mod controller;
pub mod lifecycle;
pub mod recovery_service;
pub mod retry_service;
pub mod statistics;

pub use cancellation::CancellationRegistry;
pub use claim::ClaimCoordinator;
pub use controller::{GetTaskOptions, TaskController};
pub use lifecycle::TaskLifecycle;
pub use recovery_service::{RecoveryReport, RecoveryService};
pub use retry_service::{BackoffPolicy, ExecutionFailure, FailureKind, RetryDecision, TaskRetryService};
pub use statistics::{QueueStats, StatisticsAggregator, TaskStatistics, WorkerPoolSnapshot};
