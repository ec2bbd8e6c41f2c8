//! 集成测试公共工具：内存版注册中心后端

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use gameops_discovery::discovery::{
    DiscoveryProvider, InstanceStats, Leadership, ServiceInstance, ServiceStatus, WatchCallback,
    WatchEvent, WatchHub, WatchId,
};
use tokio::sync::watch;
use gameops_discovery::error::{DiscoveryError, Result};

/// 内存后端，事件同步投递给回调
pub struct MemoryProvider {
    records: Mutex<BTreeMap<(String, String), ServiceInstance>>,
    hub: WatchHub,
    expiry_events: bool,
    watch_unavailable: AtomicBool,
    campaigns: AtomicUsize,
    leader: Mutex<Option<watch::Sender<bool>>>,
    closed: AtomicBool,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::with_expiry_events(false)
    }

    pub fn with_expiry_events(expiry_events: bool) -> Self {
        Self {
            records: Mutex::new(BTreeMap::new()),
            hub: WatchHub::new(),
            expiry_events,
            watch_unavailable: AtomicBool::new(false),
            campaigns: AtomicUsize::new(0),
            leader: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// 之后的 watch 调用全部失败
    pub fn fail_watch(&self) {
        self.watch_unavailable.store(true, Ordering::SeqCst);
    }

    pub fn campaign_count(&self) -> usize {
        self.campaigns.load(Ordering::SeqCst)
    }

    /// 模拟选主租约过期
    pub fn revoke_leadership(&self) -> bool {
        match self.leader.lock().unwrap().take() {
            Some(tx) => tx.send(false).is_ok(),
            None => false,
        }
    }

    /// 模拟 TTL 到期：记录消失，不产生事件
    pub fn expire(&self, instance_id: &str, service_type: &str) -> bool {
        self.records
            .lock()
            .unwrap()
            .remove(&(service_type.to_string(), instance_id.to_string()))
            .is_some()
    }

    /// 直接写入记录（不产生事件），用于构造过期数据
    pub fn insert_raw(&self, instance: ServiceInstance) {
        self.records.lock().unwrap().insert(
            (instance.service_type.clone(), instance.instance_id.clone()),
            instance,
        );
    }

    pub fn watcher_count(&self) -> usize {
        self.hub.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DiscoveryProvider for MemoryProvider {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn register(&self, mut instance: ServiceInstance, _ttl_seconds: u64) -> Result<()> {
        instance.touch();
        self.insert_raw(instance.clone());
        self.hub.dispatch(&WatchEvent::put(instance));
        Ok(())
    }

    async fn heartbeat(&self, instance_id: &str, service_type: &str) -> Result<()> {
        let key = (service_type.to_string(), instance_id.to_string());
        if let Some(instance) = self.records.lock().unwrap().get_mut(&key) {
            instance.touch();
        }
        Ok(())
    }

    async fn unregister(&self, instance_id: &str, service_type: &str) -> Result<()> {
        let removed = self
            .records
            .lock()
            .unwrap()
            .remove(&(service_type.to_string(), instance_id.to_string()));
        if let Some(instance) = removed {
            self.hub.dispatch(&WatchEvent::delete(instance));
        }
        Ok(())
    }

    async fn update_status(
        &self,
        instance_id: &str,
        service_type: &str,
        status: ServiceStatus,
        stats: Option<InstanceStats>,
        meta: Option<HashMap<String, serde_json::Value>>,
    ) -> Result<ServiceInstance> {
        let updated = {
            let mut records = self.records.lock().unwrap();
            let instance = records
                .get_mut(&(service_type.to_string(), instance_id.to_string()))
                .ok_or_else(|| DiscoveryError::not_found(instance_id, service_type))?;
            instance.status = status;
            if let Some(stats) = stats {
                instance.instance_stats = Some(stats);
            }
            if let Some(meta) = meta {
                instance.meta.get_or_insert_with(HashMap::new).extend(meta);
            }
            instance.touch();
            instance.clone()
        };
        self.hub.dispatch(&WatchEvent::put(updated.clone()));
        Ok(updated)
    }

    async fn get_services(&self, service_type: Option<&str>) -> Result<Vec<ServiceInstance>> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .values()
            .filter(|i| service_type.is_none_or(|t| i.service_type == t))
            .cloned()
            .collect())
    }

    async fn get_service(
        &self,
        instance_id: &str,
        service_type: &str,
    ) -> Result<Option<ServiceInstance>> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .get(&(service_type.to_string(), instance_id.to_string()))
            .cloned())
    }

    async fn watch(&self, callback: WatchCallback) -> Result<WatchId> {
        if self.watch_unavailable.load(Ordering::SeqCst) {
            return Err(DiscoveryError::backend_unavailable("pubsub down"));
        }
        Ok(self.hub.subscribe(callback))
    }

    fn unwatch(&self, id: WatchId) -> bool {
        self.hub.unsubscribe(id)
    }

    fn emits_expiry_events(&self) -> bool {
        self.expiry_events
    }

    async fn campaign(&self, _election: &str, _candidate: &str) -> Result<Leadership> {
        let (tx, rx) = watch::channel(true);
        *self.leader.lock().unwrap() = Some(tx);
        self.campaigns.fetch_add(1, Ordering::SeqCst);
        Ok(Leadership::new(rx))
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.hub.clear();
        Ok(())
    }
}

/// 带端口和内网地址的测试实例
pub fn instance(service_type: &str, instance_id: &str, status: ServiceStatus) -> ServiceInstance {
    ServiceInstance::new(service_type, format!("{service_type}-{instance_id}"))
        .with_instance_id(instance_id)
        .with_addresses("203.0.113.10", "10.0.0.10")
        .with_tcp_port(7000)
        .with_status(status)
}
