//! 进程内监听回调分发
//!
//! 每个后端在进程内只建立一条订阅（Redis 频道 / etcd watch 流），
//! 收到的事件通过 `WatchHub` 扇出给所有已注册的回调。投递语义为至多一次：
//! 没有重放，回调失败也不会重新投递。

use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tracing::{error, warn};

use super::instance::WatchEvent;

/// 回调执行结果
pub type CallbackResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// 监听回调
pub type WatchCallback = Arc<dyn Fn(&WatchEvent) -> CallbackResult + Send + Sync>;

/// 回调注册句柄，用于 `unwatch`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchId(u64);

/// 监听回调列表
#[derive(Default)]
pub struct WatchHub {
    next_id: AtomicU64,
    callbacks: RwLock<BTreeMap<WatchId, WatchCallback>>,
}

impl WatchHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册回调
    pub fn subscribe(&self, callback: WatchCallback) -> WatchId {
        let id = WatchId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.write().insert(id, callback);
        id
    }

    /// 移除回调，返回是否存在
    pub fn unsubscribe(&self, id: WatchId) -> bool {
        self.write().remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.write().clear();
    }

    /// 把事件投递给所有回调
    ///
    /// 单个回调返回错误或 panic 只记录日志，不影响其他回调
    pub fn dispatch(&self, event: &WatchEvent) {
        let snapshot: Vec<(WatchId, WatchCallback)> = self
            .read()
            .iter()
            .map(|(id, cb)| (*id, cb.clone()))
            .collect();

        for (id, callback) in snapshot {
            match catch_unwind(AssertUnwindSafe(|| callback(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(
                        watch_id = id.0,
                        event_type = event.event_type.as_str(),
                        instance_id = %event.instance.instance_id,
                        error = %e,
                        "Watch callback failed"
                    );
                }
                Err(_) => {
                    error!(
                        watch_id = id.0,
                        event_type = event.event_type.as_str(),
                        instance_id = %event.instance.instance_id,
                        "Watch callback panicked"
                    );
                }
            }
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<WatchId, WatchCallback>> {
        self.callbacks.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<WatchId, WatchCallback>> {
        self.callbacks.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::instance::{ServiceInstance, WatchEventType};
    use std::sync::Mutex;

    fn recorder() -> (WatchCallback, Arc<Mutex<Vec<WatchEventType>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let cb: WatchCallback = Arc::new(move |event: &WatchEvent| {
            sink.lock().unwrap().push(event.event_type);
            Ok(())
        });
        (cb, seen)
    }

    #[test]
    fn every_subscriber_gets_one_copy() {
        let hub = WatchHub::new();
        let (a, seen_a) = recorder();
        let (b, seen_b) = recorder();
        hub.subscribe(a);
        hub.subscribe(b);

        hub.dispatch(&WatchEvent::put(ServiceInstance::new("chat", "c1")));

        assert_eq!(*seen_a.lock().unwrap(), vec![WatchEventType::Put]);
        assert_eq!(*seen_b.lock().unwrap(), vec![WatchEventType::Put]);
    }

    #[test]
    fn failing_callbacks_do_not_block_others() {
        let hub = WatchHub::new();
        hub.subscribe(Arc::new(|_: &WatchEvent| Err("boom".into())));
        hub.subscribe(Arc::new(|_: &WatchEvent| panic!("subscriber bug")));
        let (ok, seen) = recorder();
        hub.subscribe(ok);

        hub.dispatch(&WatchEvent::delete(ServiceInstance::new("world", "w1")));

        assert_eq!(*seen.lock().unwrap(), vec![WatchEventType::Delete]);
        assert_eq!(hub.len(), 3);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let hub = WatchHub::new();
        let (cb, seen) = recorder();
        let id = hub.subscribe(cb);
        assert!(hub.unsubscribe(id));
        assert!(!hub.unsubscribe(id));

        hub.dispatch(&WatchEvent::put(ServiceInstance::new("chat", "c1")));
        assert!(seen.lock().unwrap().is_empty());
        assert!(hub.is_empty());
    }
}
