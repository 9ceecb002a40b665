// 摄像头视频流服务 - 重连策略
//
// 最多尝试 `max_attempts` 次，两次尝试之间固定等待 `backoff`。

use std::time::Duration;

/// 重连策略配置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// 最大尝试次数
    pub max_attempts: u32,
    /// 两次尝试之间的等待时间
    pub backoff: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::fixed(3, Duration::from_secs(1))
    }
}

impl ReconnectPolicy {
    pub fn fixed(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts,
            backoff,
        }
    }

    /// 第 `attempt` 次失败（从0开始）之后需要等待的时间
    ///
    /// 最后一次尝试之后不再等待，返回 `None`。
    pub fn delay_after(&self, attempt: u32) -> Option<Duration> {
        (attempt + 1 < self.max_attempts).then_some(self.backoff)
    }
}
