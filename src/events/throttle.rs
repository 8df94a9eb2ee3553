//! 进度事件节流器
//!
//! 用于控制进度事件的发布频率，避免事件风暴
//! 时间由调用方传入（与上传管理器共用同一个时钟）

use std::time::Duration;

/// 默认节流间隔（毫秒）
pub const DEFAULT_THROTTLE_INTERVAL_MS: u64 = 500;

/// 进度事件节流器
///
/// 典型用法：每次更新进度时调用 `should_emit(now)`，返回 true 时才发布事件
#[derive(Debug, Clone)]
pub struct ProgressThrottler {
    /// 上次发布事件的时间，None 表示尚未发布过
    last_emit: Option<Duration>,
    /// 节流间隔
    interval: Duration,
}

impl ProgressThrottler {
    /// 创建新的节流器
    ///
    /// # 参数
    /// * `interval` - 最小发布间隔
    pub fn new(interval: Duration) -> Self {
        Self {
            last_emit: None,
            interval,
        }
    }

    /// 使用指定毫秒间隔创建节流器
    pub fn with_millis(interval_ms: u64) -> Self {
        Self::new(Duration::from_millis(interval_ms))
    }

    /// 检查是否应该发布事件
    ///
    /// 首次调用或距离上次发布已达到节流间隔时返回 true 并更新时间戳
    pub fn should_emit(&mut self, now: Duration) -> bool {
        match self.last_emit {
            Some(last) if now.saturating_sub(last) < self.interval => false,
            _ => {
                self.last_emit = Some(now);
                true
            }
        }
    }

    /// 强制发布（用于分片完成时）
    ///
    /// 不检查时间间隔，直接更新时间戳
    pub fn force_emit(&mut self, now: Duration) {
        self.last_emit = Some(now);
    }

    /// 重置节流器状态
    pub fn reset(&mut self) {
        self.last_emit = None;
    }
}

impl Default for ProgressThrottler {
    fn default() -> Self {
        Self::with_millis(DEFAULT_THROTTLE_INTERVAL_MS)
    }
}
