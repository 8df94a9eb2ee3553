// 上传速度统计
//
// - 分片级：两次进度采样之间的字节增量 / 时间增量
// - 文件级：当前速度为活跃分片速度之和，平均速度为指数滑动平均
// - 全局：对未暂停文件求和

use std::time::Duration;

/// 默认平滑系数
pub const DEFAULT_SPEED_SMOOTHING_FACTOR: f64 = 0.1;

/// 分片速度采样
#[derive(Debug, Clone, Default)]
pub struct ChunkSpeed {
    /// 上次采样时间，None 表示分片不在传输中
    last_at: Option<Duration>,
    /// 上次采样时的已上传字节数
    last_bytes: u64,
    /// 当前速度 (bytes/s)
    current: f64,
}

impl ChunkSpeed {
    /// 请求开始，以开始时间作为第一个采样点
    pub fn start(&mut self, now: Duration) {
        self.last_at = Some(now);
        self.last_bytes = 0;
        self.current = 0.0;
    }

    /// 采样并返回当前速度
    ///
    /// 时间增量为 0 时沿用上次速度
    pub fn sample(&mut self, now: Duration, uploaded_bytes: u64) -> f64 {
        let Some(last_at) = self.last_at else {
            return self.current;
        };

        let elapsed = now.saturating_sub(last_at);
        if elapsed.is_zero() {
            return self.current;
        }

        let delta = uploaded_bytes.saturating_sub(self.last_bytes);
        self.current = delta as f64 / elapsed.as_secs_f64();
        self.last_at = Some(now);
        self.last_bytes = uploaded_bytes;
        self.current
    }

    /// 停止传输，速度归零
    pub fn stop(&mut self) {
        self.last_at = None;
        self.last_bytes = 0;
        self.current = 0.0;
    }

    pub fn current(&self) -> f64 {
        self.current
    }
}

/// 文件级速度统计
#[derive(Debug, Clone)]
pub struct SpeedTracker {
    /// 平滑系数 α
    smoothing_factor: f64,
    /// 当前速度 (bytes/s)
    current: f64,
    /// 平均速度 (bytes/s)
    average: f64,
}

impl SpeedTracker {
    pub fn new(smoothing_factor: f64) -> Self {
        Self {
            smoothing_factor: smoothing_factor.clamp(0.0, 1.0),
            current: 0.0,
            average: 0.0,
        }
    }

    /// 进度采样：更新当前速度并做一次指数平滑
    ///
    /// `average' = α·current + (1-α)·average`
    pub fn update(&mut self, current: f64) {
        self.current = current;
        self.average =
            self.smoothing_factor * current + (1.0 - self.smoothing_factor) * self.average;
    }

    /// 分片结束时只刷新当前速度，不参与平滑
    pub fn set_current(&mut self, current: f64) {
        self.current = current;
    }

    /// 没有活跃分片时归零
    pub fn reset(&mut self) {
        self.current = 0.0;
        self.average = 0.0;
    }

    pub fn current(&self) -> f64 {
        self.current
    }

    pub fn average(&self) -> f64 {
        self.average
    }
}

impl Default for SpeedTracker {
    fn default() -> Self {
        Self::new(DEFAULT_SPEED_SMOOTHING_FACTOR)
    }
}

/// 估算剩余时间（秒）
///
/// - 暂停：返回 0，表示"停滞/未知"
/// - 当前速度 > 0：剩余字节 / 当前速度
/// - 当前速度为 0：剩余字节为 0 时返回 0，否则返回正无穷
pub fn time_remaining(remaining_bytes: u64, current_speed: f64, paused: bool) -> f64 {
    if paused {
        return 0.0;
    }
    if current_speed > 0.0 {
        return remaining_bytes as f64 / current_speed;
    }
    if remaining_bytes == 0 {
        0.0
    } else {
        f64::INFINITY
    }
}
