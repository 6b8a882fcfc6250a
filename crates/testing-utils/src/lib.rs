//! 测试工具
//!
//! 供各个 crate 的测试共享：测试数据构建器、手动时钟、脚本化执行器、
//! 内存任务仓储、队列 mock、Redis 测试容器以及等待辅助函数。
//!
//! ```toml
//! [dev-dependencies]
//! taskq-testing-utils = { path = "../testing-utils" }
//! ```

pub mod builders;
pub mod clock;
pub mod containers;
pub mod executors;
pub mod helpers;
pub mod mocks;

pub use builders::*;
pub use clock::*;
pub use containers::*;
pub use executors::*;
pub use helpers::*;
pub use mocks::*;
