pub mod broadcast;
pub mod database;
pub mod observability;
pub mod queue;

pub use broadcast::{StatusBroadcaster, Subscription};
pub use database::{DatabaseManager, SqliteTaskRepository};
pub use observability::MetricsCollector;
pub use queue::{create_task_queue, InMemoryTaskQueue, RedisTaskQueue};
