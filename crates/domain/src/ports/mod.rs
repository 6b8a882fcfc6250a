//! 外部能力端口
//!
//! 队列、执行器、时钟以及运行时状态查询的抽象，由基础设施层和 Worker 层提供实现

pub mod clock;
pub mod executor;
pub mod queue;
pub mod runtime;

pub use clock::*;
pub use executor::*;
pub use queue::*;
pub use runtime::*;
