// 时钟与定时器
//
// 上传管理器本身是单线程、事件驱动的，不直接 sleep：
// - 重试退避、延迟的 complete 事件都登记在 TimerQueue 中
// - 驱动方（UploadDriver 或测试）推进时钟后调用 `UploadManager::tick()` 触发到期定时器

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// 单调时钟，返回自任意起点以来的时长
pub trait Clock: Send + Sync {
    fn now(&self) -> Duration;
}

/// 基于 tokio Instant 的单调时钟（tokio 暂停时间下同样可用）
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    origin: tokio::time::Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: tokio::time::Instant::now(),
        }
    }

    /// 把时钟时间换算为 tokio Instant（用于 sleep_until）
    pub fn instant_at(&self, at: Duration) -> tokio::time::Instant {
        self.origin + at
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// 手动推进的时钟，克隆之间共享同一时间
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    millis: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// 时钟前进指定时长
    pub fn advance(&self, by: Duration) {
        self.millis
            .fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set(&self, at: Duration) {
        self.millis.store(at.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_millis(self.millis.load(Ordering::SeqCst))
    }
}

/// 定时器 ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(pub u64);

/// 可取消的定时器队列
///
/// 到期顺序：截止时间升序，相同截止时间按登记顺序
#[derive(Debug)]
pub struct TimerQueue<K> {
    next_id: u64,
    queue: BTreeMap<(Duration, TimerId), K>,
    deadlines: HashMap<TimerId, Duration>,
}

impl<K> TimerQueue<K> {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            queue: BTreeMap::new(),
            deadlines: HashMap::new(),
        }
    }

    /// 登记定时器
    pub fn schedule(&mut self, deadline: Duration, kind: K) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        self.queue.insert((deadline, id), kind);
        self.deadlines.insert(id, deadline);
        id
    }

    /// 取消定时器，返回是否存在
    pub fn cancel(&mut self, id: TimerId) -> bool {
        match self.deadlines.remove(&id) {
            Some(deadline) => self.queue.remove(&(deadline, id)).is_some(),
            None => false,
        }
    }

    /// 取出一个已到期的定时器
    pub fn pop_due(&mut self, now: Duration) -> Option<(TimerId, K)> {
        let (&(deadline, id), _) = self.queue.iter().next()?;
        if deadline > now {
            return None;
        }
        self.deadlines.remove(&id);
        self.queue.remove(&(deadline, id)).map(|kind| (id, kind))
    }

    /// 最近的截止时间
    pub fn next_deadline(&self) -> Option<Duration> {
        self.queue.keys().next().map(|(deadline, _)| *deadline)
    }

    pub fn contains(&self, id: TimerId) -> bool {
        self.deadlines.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl<K> Default for TimerQueue<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_shared() {
        let clock = ManualClock::new();
        let other = clock.clone();
        clock.advance(Duration::from_millis(150));
        assert_eq!(other.now(), Duration::from_millis(150));
    }

    #[test]
    fn test_pop_due_in_order() {
        let mut timers = TimerQueue::new();
        timers.schedule(Duration::from_millis(20), "b");
        timers.schedule(Duration::from_millis(10), "a");
        timers.schedule(Duration::from_millis(20), "c");

        assert_eq!(timers.next_deadline(), Some(Duration::from_millis(10)));
        assert!(timers.pop_due(Duration::from_millis(5)).is_none());

        let now = Duration::from_millis(20);
        let fired: Vec<_> = std::iter::from_fn(|| timers.pop_due(now))
            .map(|(_, kind)| kind)
            .collect();
        assert_eq!(fired, vec!["a", "b", "c"]);
        assert!(timers.is_empty());
    }

    #[test]
    fn test_cancel() {
        let mut timers = TimerQueue::new();
        let id = timers.schedule(Duration::from_millis(10), ());
        assert!(timers.contains(id));
        assert!(timers.cancel(id));
        assert!(!timers.cancel(id));
        assert!(timers.pop_due(Duration::from_secs(1)).is_none());
    }
}
