use std::fmt::Debug;

use chrono::{DateTime, Utc};

/// 时间来源
///
/// 所有时间戳、退避计算和定时任务的就绪判断都经由该接口取当前时间，测试中可替换为手动时钟
pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
