//! 同步事件总线
//!
//! - 订阅者按订阅顺序依次收到事件
//! - 发布在调用线程内同步完成，没有隐藏的异步
//! - 可按事件种类订阅，也可订阅全部事件

use super::types::{EventKind, UploadEvent};
use std::fmt;
use tracing::trace;

/// 事件处理函数
pub type EventHandler = Box<dyn FnMut(&UploadEvent) + Send>;

/// 订阅 ID，用于取消订阅
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscriber {
    id: SubscriptionId,
    /// None 表示订阅全部事件
    kind: Option<EventKind>,
    handler: EventHandler,
}

/// 事件总线
pub struct EventBus {
    next_id: u64,
    subscribers: Vec<Subscriber>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            subscribers: Vec::new(),
        }
    }

    fn add(&mut self, kind: Option<EventKind>, handler: EventHandler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        self.subscribers.push(Subscriber { id, kind, handler });
        id
    }

    /// 订阅指定种类的事件
    pub fn subscribe<F>(&mut self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: FnMut(&UploadEvent) + Send + 'static,
    {
        self.add(Some(kind), Box::new(handler))
    }

    /// 订阅全部事件
    pub fn subscribe_all<F>(&mut self, handler: F) -> SubscriptionId
    where
        F: FnMut(&UploadEvent) + Send + 'static,
    {
        self.add(None, Box::new(handler))
    }

    /// 取消订阅
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|s| s.id != id);
        self.subscribers.len() != before
    }

    /// 发布事件
    pub fn publish(&mut self, event: &UploadEvent) {
        trace!("发布事件: {}", event.event_type_name());
        let kind = event.kind();
        for subscriber in &mut self.subscribers {
            if subscriber.kind.map_or(true, |k| k == kind) {
                (subscriber.handler)(event);
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uploader::FileId;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn test_subscribers_in_order() {
        let mut bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let first = seen.clone();
        bus.subscribe_all(move |e| first.lock().push(format!("a:{}", e.event_type_name())));
        let second = seen.clone();
        bus.subscribe_all(move |e| second.lock().push(format!("b:{}", e.event_type_name())));

        bus.publish(&UploadEvent::UploadStart);
        assert_eq!(*seen.lock(), vec!["a:uploadStart", "b:uploadStart"]);
    }

    #[test]
    fn test_filter_by_kind() {
        let mut bus = EventBus::new();
        let count = Arc::new(Mutex::new(0));

        let c = count.clone();
        bus.subscribe(EventKind::FileRetry, move |_| *c.lock() += 1);

        bus.publish(&UploadEvent::UploadStart);
        bus.publish(&UploadEvent::FileRetry {
            file: FileId(1),
            chunk: 0,
        });
        assert_eq!(*count.lock(), 1);
    }

    #[test]
    fn test_unsubscribe() {
        let mut bus = EventBus::new();
        let count = Arc::new(Mutex::new(0));

        let c = count.clone();
        let id = bus.subscribe_all(move |_| *c.lock() += 1);
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));

        bus.publish(&UploadEvent::Complete);
        assert_eq!(*count.lock(), 0);
        assert_eq!(bus.subscriber_count(), 0);
    }
}
