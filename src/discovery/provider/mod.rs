//! 服务注册存储后端抽象和实现
//!
//! 两种后端（Redis、etcd）实现同一个 `DiscoveryProvider` trait，
//! 只有工厂会根据配置选择具体实现

pub mod etcd;
pub mod redis;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::DiscoveryConfig;
use crate::discovery::instance::{InstanceStats, ServiceInstance, ServiceStatus};
use crate::discovery::watch::{WatchCallback, WatchId};
use crate::error::Result;

pub use self::etcd::EtcdProvider;
pub use self::redis::RedisProvider;

/// 服务注册存储后端 trait
///
/// 注意：由于需要动态分发（dyn），使用 async-trait
#[async_trait]
pub trait DiscoveryProvider: Send + Sync {
    /// 后端名称（日志用）
    fn name(&self) -> &'static str;

    /// 注册服务实例
    ///
    /// 写入实例并启动内部自动心跳（见 `RegistrationSettings::heartbeat_period`）。
    /// `ttl_seconds` 为 0 时使用配置的默认 TTL。
    /// 重复注册同一个键会覆盖旧值并重启心跳任务。
    async fn register(&self, instance: ServiceInstance, ttl_seconds: u64) -> Result<()>;

    /// 显式续期
    ///
    /// 键已经不存在时只记录警告，不返回错误
    async fn heartbeat(&self, instance_id: &str, service_type: &str) -> Result<()>;

    /// 注销服务实例（幂等）
    async fn unregister(&self, instance_id: &str, service_type: &str) -> Result<()>;

    /// 更新状态、统计和注解，同时续期
    ///
    /// 实例不存在时返回 `InstanceNotFound`
    async fn update_status(
        &self,
        instance_id: &str,
        service_type: &str,
        status: ServiceStatus,
        stats: Option<InstanceStats>,
        meta: Option<HashMap<String, serde_json::Value>>,
    ) -> Result<ServiceInstance>;

    /// 获取所有存活实例，可按类型过滤
    async fn get_services(&self, service_type: Option<&str>) -> Result<Vec<ServiceInstance>>;

    /// 按 `(instance_id, type)` 查询单个实例
    async fn get_service(&self, instance_id: &str, service_type: &str)
    -> Result<Option<ServiceInstance>>;

    /// 注册变更回调（所有类型的 put/delete 事件）
    async fn watch(&self, callback: WatchCallback) -> Result<WatchId>;

    /// 移除回调
    fn unwatch(&self, id: WatchId) -> bool;

    /// TTL 过期是否会以 delete 事件出现在 watch 中
    fn emits_expiry_events(&self) -> bool;

    /// 竞选领导者，返回时当前进程已成为领导者
    ///
    /// 默认实现不做协调，直接返回永不丢失的领导权（每个进程都视为领导者）
    async fn campaign(&self, _election: &str, _candidate: &str) -> Result<Leadership> {
        Ok(Leadership::unconditional())
    }

    /// 释放连接、租约、定时任务和订阅
    async fn close(&self) -> Result<()>;
}

/// 心跳间隔下限
const MIN_HEARTBEAT_PERIOD: Duration = Duration::from_millis(500);

/// 自动心跳间隔：TTL 的一半，最少 500ms
pub fn heartbeat_period(ttl_seconds: u64) -> Duration {
    Duration::from_millis(ttl_seconds.max(1).saturating_mul(1000) / 2).max(MIN_HEARTBEAT_PERIOD)
}

/// 注册设置：默认 TTL 和内部自动心跳
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistrationSettings {
    /// register 时是否启动内部自动心跳
    pub auto_heartbeat: bool,
    /// `ttl_seconds` 为 0 时使用的 TTL（秒）
    pub default_ttl: u64,
    /// 自动心跳的最长间隔
    pub max_heartbeat_interval: Duration,
}

impl RegistrationSettings {
    pub fn from_config(config: &DiscoveryConfig) -> Self {
        // updatedAt 必须在 unresponsive_after 之内刷新，否则清理任务会删除存活实例
        let staleness_bound =
            Duration::from_millis(config.unresponsive_after.saturating_mul(1000) / 2);
        Self {
            auto_heartbeat: config.auto_heartbeat,
            default_ttl: config.default_ttl.max(1),
            max_heartbeat_interval: Duration::from_secs(config.heartbeat_interval.max(1))
                .min(staleness_bound),
        }
    }

    pub fn with_auto_heartbeat(mut self, enabled: bool) -> Self {
        self.auto_heartbeat = enabled;
        self
    }

    pub fn ttl_or_default(&self, ttl_seconds: u64) -> u64 {
        if ttl_seconds == 0 {
            self.default_ttl
        } else {
            ttl_seconds
        }
    }

    /// TTL 的一半，不超过 `max_heartbeat_interval`，不低于 500ms
    pub fn heartbeat_period(&self, ttl_seconds: u64) -> Duration {
        heartbeat_period(ttl_seconds)
            .min(self.max_heartbeat_interval)
            .max(MIN_HEARTBEAT_PERIOD)
    }
}

impl Default for RegistrationSettings {
    fn default() -> Self {
        Self::from_config(&DiscoveryConfig::default())
    }
}

/// 竞选成功后持有的领导权
///
/// 后端发现领导权丢失（选主租约过期）时 `lost()` 返回；
/// 发送端被丢弃也视为丢失。
pub struct Leadership {
    held: Option<watch::Receiver<bool>>,
}

impl Leadership {
    /// 永不丢失的领导权（不做协调的后端）
    pub fn unconditional() -> Self {
        Self { held: None }
    }

    /// 由后端通过 `watch::Sender<bool>` 维护的领导权，发送 `false` 表示丢失
    pub fn new(held: watch::Receiver<bool>) -> Self {
        Self { held: Some(held) }
    }

    pub fn is_held(&self) -> bool {
        match &self.held {
            None => true,
            Some(rx) => *rx.borrow() && rx.has_changed().is_ok(),
        }
    }

    /// 等待领导权丢失
    pub async fn lost(&mut self) {
        match self.held.as_mut() {
            None => std::future::pending::<()>().await,
            Some(rx) => {
                let _ = rx.wait_for(|held| !*held).await;
            }
        }
    }
}

/// 把状态更新应用到实例上（meta 按键合并）
pub(crate) fn apply_status_update(
    instance: &mut ServiceInstance,
    status: ServiceStatus,
    stats: Option<InstanceStats>,
    meta: Option<HashMap<String, serde_json::Value>>,
) {
    instance.status = status;
    if let Some(stats) = stats {
        instance.instance_stats = Some(stats);
    }
    if let Some(meta) = meta {
        instance
            .meta
            .get_or_insert_with(HashMap::new)
            .extend(meta);
    }
    instance.touch();
}

/// 每个实例一个的后台心跳任务
///
/// 以 `type:id` 为键保存任务句柄，替换、注销和关闭时精确取消
#[derive(Default)]
pub(crate) struct HeartbeatTasks {
    handles: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl HeartbeatTasks {
    /// 启动新任务，同键旧任务先被取消
    pub fn spawn<F>(&self, key: String, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task);
        if let Some(old) = self.lock().insert(key, handle) {
            old.abort();
        }
    }

    /// 取消任务，返回是否存在
    pub fn cancel(&self, key: &str) -> bool {
        match self.lock().remove(key) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) -> usize {
        let handles: Vec<JoinHandle<()>> = self.lock().drain().map(|(_, h)| h).collect();
        let count = handles.len();
        for handle in handles {
            handle.abort();
        }
        count
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
        self.handles.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for HeartbeatTasks {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn heartbeat_period_is_half_ttl() {
        assert_eq!(heartbeat_period(30), Duration::from_secs(15));
        assert_eq!(heartbeat_period(2), Duration::from_secs(1));
        assert_eq!(heartbeat_period(1), Duration::from_millis(500));
        assert_eq!(heartbeat_period(0), Duration::from_millis(500));
    }

    #[test]
    fn heartbeat_stays_within_unresponsive_window() {
        let config = DiscoveryConfig::default();
        let settings = RegistrationSettings::from_config(&config);
        let window = Duration::from_secs(config.unresponsive_after);

        for ttl in [1, 30, 120, 300, 3600] {
            assert!(settings.heartbeat_period(ttl) < window, "ttl {ttl}");
        }
        assert_eq!(settings.heartbeat_period(300), Duration::from_secs(15));
        assert_eq!(settings.heartbeat_period(2), Duration::from_secs(1));

        let tight = RegistrationSettings::from_config(&DiscoveryConfig {
            heartbeat_interval: 300,
            unresponsive_after: 20,
            ..Default::default()
        });
        assert_eq!(tight.heartbeat_period(600), Duration::from_secs(10));
    }

    #[test]
    fn zero_ttl_uses_configured_default() {
        let settings = RegistrationSettings::from_config(&DiscoveryConfig {
            default_ttl: 45,
            ..Default::default()
        });
        assert_eq!(settings.ttl_or_default(0), 45);
        assert_eq!(settings.ttl_or_default(10), 10);
        assert!(!settings.with_auto_heartbeat(false).auto_heartbeat);
    }

    #[tokio::test]
    async fn leadership_reports_loss() {
        assert!(Leadership::unconditional().is_held());

        let (tx, rx) = watch::channel(true);
        let mut leadership = Leadership::new(rx);
        assert!(leadership.is_held());

        tx.send_replace(false);
        tokio::time::timeout(Duration::from_secs(1), leadership.lost())
            .await
            .unwrap();
        assert!(!leadership.is_held());

        let (tx, rx) = watch::channel(true);
        let mut dropped = Leadership::new(rx);
        drop(tx);
        tokio::time::timeout(Duration::from_secs(1), dropped.lost())
            .await
            .unwrap();
    }

    #[test]
    fn status_update_merges_meta() {
        let mut instance = ServiceInstance::new("chat", "c1").with_meta("instanceName", "Chat #1");
        let before = instance.updated_at;
        std::thread::sleep(Duration::from_millis(2));

        apply_status_update(
            &mut instance,
            ServiceStatus::Ready,
            Some(InstanceStats {
                cpu_usage: 12.5,
                memory_used: 512,
                memory_total: 2048,
            }),
            Some(HashMap::from([("users".to_string(), json!(42))])),
        );

        assert_eq!(instance.status, ServiceStatus::Ready);
        assert_eq!(instance.instance_stats.as_ref().unwrap().memory_total, 2048);
        assert_eq!(instance.meta_str("instanceName"), Some("Chat #1"));
        assert_eq!(instance.meta.as_ref().unwrap()["users"], json!(42));
        assert!(instance.updated_at > before);
    }

    #[tokio::test]
    async fn respawn_replaces_previous_task() {
        let tasks = HeartbeatTasks::default();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<&'static str>();

        let first = tx.clone();
        tasks.spawn("chat:1".to_string(), async move {
            loop {
                let _ = first.send("first");
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        tasks.spawn("chat:1".to_string(), async move {
            let _ = tx.send("second");
            std::future::pending::<()>().await;
        });
        tokio::time::sleep(Duration::from_millis(30)).await;

        let mut seen = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            seen.push(msg);
        }
        let second_at = seen.iter().position(|m| *m == "second").unwrap();
        assert!(seen[second_at + 1..].iter().all(|m| *m != "first"));

        assert!(tasks.cancel("chat:1"));
        assert!(!tasks.contains("chat:1"));
        assert_eq!(tasks.cancel_all(), 0);
    }
}
