use crate::validation::{ConfigValidator, ValidationUtils};
use serde::{Deserialize, Serialize};

/// 订阅者缓冲区溢出时的处理策略
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// 丢弃最旧的事件，订阅继续
    #[default]
    DropOldest,
    /// 断开订阅
    Disconnect,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    pub subscriber_buffer: usize,
    pub overflow_policy: OverflowPolicy,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            subscriber_buffer: 256,
            overflow_policy: OverflowPolicy::DropOldest,
        }
    }
}

impl ConfigValidator for BroadcastConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_count(
            self.subscriber_buffer,
            "broadcast.subscriber_buffer",
            65_536,
        )
    }
}
