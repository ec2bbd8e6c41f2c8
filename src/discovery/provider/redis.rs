//! Redis 服务注册后端
//!
//! - 实例：字符串键 `service:instance:<type>:<id>`，值为 JSON，依赖 Redis 键过期
//! - 类型索引：集合 `service:type:<type>`，保存该类型下的实例 ID
//! - 变更通知：所有写操作在 `service:events` 频道发布 `{type, instance}`
//!
//! 键过期由 Redis 自己删除，不会产生 delete 事件；需要感知过期的调用方
//! 应定期重新拉取（见 `emits_expiry_events`）。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{DiscoveryProvider, HeartbeatTasks, RegistrationSettings, apply_status_update};
use crate::config::RedisConfig;
use crate::discovery::instance::{
    InstanceStats, ServiceInstance, ServiceStatus, WatchEvent, registry_key,
};
use crate::discovery::watch::{WatchCallback, WatchHub, WatchId};
use crate::error::{DiscoveryError, Result};

/// 实例键前缀
pub const INSTANCE_KEY_PREFIX: &str = "service:instance";
/// 类型集合键前缀
pub const TYPE_KEY_PREFIX: &str = "service:type";
/// 变更事件频道
pub const EVENTS_CHANNEL: &str = "service:events";
/// 续期后的最小 TTL（秒）
pub const MIN_RENEWED_TTL_SECS: u64 = 30;

/// `service:instance:<type>:<id>`
pub fn instance_key(service_type: &str, instance_id: &str) -> String {
    format!("{}:{}:{}", INSTANCE_KEY_PREFIX, service_type, instance_id)
}

/// `service:type:<type>`
pub fn type_key(service_type: &str) -> String {
    format!("{}:{}", TYPE_KEY_PREFIX, service_type)
}

/// 续期策略：剩余 TTL 翻倍，不低于 30 秒
///
/// 没有过期时间的键（TTL = -1）按下限处理
pub fn renewed_ttl(current_ttl: i64) -> u64 {
    let doubled = current_ttl.max(0).saturating_mul(2) as u64;
    doubled.max(MIN_RENEWED_TTL_SECS)
}

/// 只在键仍然存在时覆盖写入（`SET key value XX EX ttl`）
///
/// 续期和状态更新与注销并发时，不会把已删除的实例写回来
fn rewrite_existing_cmd(key: &str, payload: &str, ttl_seconds: u64) -> redis::Cmd {
    let mut cmd = redis::cmd("SET");
    cmd.arg(key)
        .arg(payload)
        .arg("XX")
        .arg("EX")
        .arg(ttl_seconds.max(1));
    cmd
}

/// Redis 服务注册后端
pub struct RedisProvider {
    inner: Arc<RedisInner>,
}

struct RedisInner {
    client: redis::Client,
    conn: ConnectionManager,
    hub: WatchHub,
    heartbeats: HeartbeatTasks,
    subscriber: Mutex<Option<JoinHandle<()>>>,
    settings: RegistrationSettings,
    closed: AtomicBool,
}

impl RedisProvider {
    /// 连接 Redis
    pub async fn connect(config: &RedisConfig, settings: RegistrationSettings) -> Result<Self> {
        let client = redis::Client::open(config.url())?;
        let conn = ConnectionManager::new(client.clone()).await?;

        info!(
            host = %config.host,
            port = config.port,
            db = config.db,
            "Redis discovery provider connected"
        );

        Ok(Self {
            inner: Arc::new(RedisInner {
                client,
                conn,
                hub: WatchHub::new(),
                heartbeats: HeartbeatTasks::default(),
                subscriber: Mutex::new(None),
                settings,
                closed: AtomicBool::new(false),
            }),
        })
    }

    fn start_heartbeat(&self, instance_id: &str, service_type: &str, ttl_seconds: u64) {
        let weak: Weak<RedisInner> = Arc::downgrade(&self.inner);
        let instance_id = instance_id.to_string();
        let service_type = service_type.to_string();
        let period = self.inner.settings.heartbeat_period(ttl_seconds);

        self.inner.heartbeats.spawn(
            registry_key(&instance_id, &service_type),
            async move {
                let mut ticker = tokio::time::interval(period);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let Some(inner) = weak.upgrade() else { break };
                    match inner.renew(&instance_id, &service_type).await {
                        Ok(true) => {
                            debug!(instance_id = %instance_id, service_type = %service_type, "Heartbeat sent");
                        }
                        Ok(false) => {
                            warn!(instance_id = %instance_id, service_type = %service_type, "Heartbeat skipped, instance already expired");
                        }
                        Err(e) => {
                            error!(instance_id = %instance_id, service_type = %service_type, error = %e, "Failed to send heartbeat");
                        }
                    }
                }
            },
        );
    }

    async fn ensure_subscribed(&self) -> Result<()> {
        let mut subscriber = self.inner.subscriber.lock().await;
        if subscriber.as_ref().is_some_and(|h| !h.is_finished()) {
            return Ok(());
        }

        let mut pubsub = self.inner.client.get_async_pubsub().await?;
        pubsub.subscribe(EVENTS_CHANNEL).await?;

        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            let mut messages = Box::pin(pubsub.into_on_message());
            while let Some(msg) = messages.next().await {
                let Some(inner) = weak.upgrade() else { break };
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(error = %e, "Invalid payload on discovery channel");
                        continue;
                    }
                };
                match serde_json::from_str::<WatchEvent>(&payload) {
                    Ok(event) => inner.hub.dispatch(&event),
                    Err(e) => warn!(error = %e, "Failed to decode discovery event"),
                }
            }
            warn!(channel = EVENTS_CHANNEL, "Redis discovery subscription ended");
        });

        *subscriber = Some(handle);
        info!(channel = EVENTS_CHANNEL, "Subscribed to discovery events");
        Ok(())
    }
}

impl RedisInner {
    async fn write(&self, instance: &ServiceInstance, ttl_seconds: u64) -> Result<()> {
        let payload = serde_json::to_string(instance)?;
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .set_ex(
                instance_key(&instance.service_type, &instance.instance_id),
                payload,
                ttl_seconds.max(1),
            )
            .ignore()
            .sadd(type_key(&instance.service_type), &instance.instance_id)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn read(&self, instance_id: &str, service_type: &str) -> Result<Option<ServiceInstance>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(instance_key(service_type, instance_id)).await?;
        value
            .map(|v| serde_json::from_str(&v).map_err(DiscoveryError::from))
            .transpose()
    }

    async fn publish(&self, event: &WatchEvent) -> Result<()> {
        let payload = serde_json::to_string(event)?;
        let mut conn = self.conn.clone();
        let _: () = conn.publish(EVENTS_CHANNEL, payload).await?;
        Ok(())
    }

    /// 覆盖已存在的实例并设置新 TTL，键已不存在时返回 false
    ///
    /// 不写类型集合：键存在说明注册时已经加入
    async fn rewrite_existing(&self, instance: &ServiceInstance, ttl_seconds: u64) -> Result<bool> {
        let payload = serde_json::to_string(instance)?;
        let key = instance_key(&instance.service_type, &instance.instance_id);
        let mut conn = self.conn.clone();
        let reply: Option<String> = rewrite_existing_cmd(&key, &payload, ttl_seconds)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    /// 续期，键不存在时返回 false
    async fn renew(&self, instance_id: &str, service_type: &str) -> Result<bool> {
        let key = instance_key(service_type, instance_id);
        let mut conn = self.conn.clone();
        let current_ttl: i64 = conn.ttl(&key).await?;
        if current_ttl == -2 {
            return Ok(false);
        }

        let Some(mut instance) = self.read(instance_id, service_type).await? else {
            return Ok(false);
        };
        instance.touch();
        self.rewrite_existing(&instance, renewed_ttl(current_ttl)).await
    }

    async fn list_types(&self) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = conn.keys(format!("{}:*", TYPE_KEY_PREFIX)).await?;
        let prefix = format!("{}:", TYPE_KEY_PREFIX);
        Ok(keys
            .into_iter()
            .filter_map(|k| k.strip_prefix(&prefix).map(str::to_string))
            .collect())
    }

    async fn list_type(&self, service_type: &str) -> Result<Vec<ServiceInstance>> {
        let mut conn = self.conn.clone();
        let set_key = type_key(service_type);
        let ids: Vec<String> = conn.smembers(&set_key).await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<String> = ids.iter().map(|id| instance_key(service_type, id)).collect();
        let values: Vec<Option<String>> = conn.mget(&keys).await?;

        let mut instances = Vec::with_capacity(values.len());
        let mut expired = Vec::new();
        for (id, value) in ids.iter().zip(values) {
            match value {
                Some(raw) => match serde_json::from_str::<ServiceInstance>(&raw) {
                    Ok(instance) => instances.push(instance),
                    Err(e) => {
                        warn!(instance_id = %id, service_type = %service_type, error = %e, "Skipping undecodable instance")
                    }
                },
                None => expired.push(id.clone()),
            }
        }

        // 过期实例的 ID 仍留在类型集合里，顺手清掉
        if !expired.is_empty() {
            debug!(service_type = %service_type, count = expired.len(), "Pruning expired ids from type set");
            let _: () = conn.srem(&set_key, &expired).await?;
        }

        Ok(instances)
    }
}

#[async_trait]
impl DiscoveryProvider for RedisProvider {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn register(&self, mut instance: ServiceInstance, ttl_seconds: u64) -> Result<()> {
        let ttl_seconds = self.inner.settings.ttl_or_default(ttl_seconds);
        instance.touch();
        self.inner.write(&instance, ttl_seconds).await?;

        if self.inner.settings.auto_heartbeat {
            self.start_heartbeat(&instance.instance_id, &instance.service_type, ttl_seconds);
        }

        info!(
            instance_id = %instance.instance_id,
            service_type = %instance.service_type,
            ttl_seconds = ttl_seconds,
            "Service registered"
        );

        self.inner.publish(&WatchEvent::put(instance)).await
    }

    async fn heartbeat(&self, instance_id: &str, service_type: &str) -> Result<()> {
        if !self.inner.renew(instance_id, service_type).await? {
            warn!(
                instance_id = %instance_id,
                service_type = %service_type,
                "Heartbeat for unknown instance ignored"
            );
        }
        Ok(())
    }

    async fn unregister(&self, instance_id: &str, service_type: &str) -> Result<()> {
        self.inner
            .heartbeats
            .cancel(&registry_key(instance_id, service_type));

        let existing = self.inner.read(instance_id, service_type).await?;

        // 集合最后一个成员被移除后 Redis 会自动删除该集合
        let mut conn = self.inner.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .del(instance_key(service_type, instance_id))
            .ignore()
            .srem(type_key(service_type), instance_id)
            .ignore()
            .query_async(&mut conn)
            .await?;

        match existing {
            Some(instance) => {
                info!(instance_id = %instance_id, service_type = %service_type, "Service unregistered");
                self.inner.publish(&WatchEvent::delete(instance)).await
            }
            None => {
                debug!(instance_id = %instance_id, service_type = %service_type, "Unregister of absent instance");
                Ok(())
            }
        }
    }

    async fn update_status(
        &self,
        instance_id: &str,
        service_type: &str,
        status: ServiceStatus,
        stats: Option<InstanceStats>,
        meta: Option<HashMap<String, serde_json::Value>>,
    ) -> Result<ServiceInstance> {
        let key = instance_key(service_type, instance_id);
        let mut conn = self.inner.conn.clone();
        let current_ttl: i64 = conn.ttl(&key).await?;

        let mut instance = self
            .inner
            .read(instance_id, service_type)
            .await?
            .ok_or_else(|| DiscoveryError::not_found(instance_id, service_type))?;

        apply_status_update(&mut instance, status, stats, meta);
        if !self.inner.rewrite_existing(&instance, renewed_ttl(current_ttl)).await? {
            return Err(DiscoveryError::not_found(instance_id, service_type));
        }

        debug!(
            instance_id = %instance_id,
            service_type = %service_type,
            status = %status,
            "Service status updated"
        );

        self.inner.publish(&WatchEvent::put(instance.clone())).await?;
        Ok(instance)
    }

    async fn get_services(&self, service_type: Option<&str>) -> Result<Vec<ServiceInstance>> {
        let types = match service_type {
            Some(t) => vec![t.to_string()],
            None => self.inner.list_types().await?,
        };

        let mut services = Vec::new();
        for t in types {
            services.extend(self.inner.list_type(&t).await?);
        }
        Ok(services)
    }

    async fn get_service(
        &self,
        instance_id: &str,
        service_type: &str,
    ) -> Result<Option<ServiceInstance>> {
        self.inner.read(instance_id, service_type).await
    }

    async fn watch(&self, callback: WatchCallback) -> Result<WatchId> {
        let id = self.inner.hub.subscribe(callback);
        if let Err(e) = self.ensure_subscribed().await {
            self.inner.hub.unsubscribe(id);
            return Err(e);
        }
        Ok(id)
    }

    fn unwatch(&self, id: WatchId) -> bool {
        self.inner.hub.unsubscribe(id)
    }

    fn emits_expiry_events(&self) -> bool {
        false
    }

    async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let cancelled = self.inner.heartbeats.cancel_all();
        if let Some(handle) = self.inner.subscriber.lock().await.take() {
            handle.abort();
        }
        self.inner.hub.clear();

        info!(heartbeats_cancelled = cancelled, "Redis discovery provider closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout() {
        assert_eq!(instance_key("chat", "abc"), "service:instance:chat:abc");
        assert_eq!(type_key("world"), "service:type:world");
    }

    #[test]
    fn renewal_doubles_with_floor() {
        assert_eq!(renewed_ttl(100), 200);
        assert_eq!(renewed_ttl(16), 32);
        assert_eq!(renewed_ttl(10), 30);
        assert_eq!(renewed_ttl(1), 30);
        assert_eq!(renewed_ttl(-1), 30);
    }

    #[test]
    fn renewal_never_recreates_missing_keys() {
        let cmd = rewrite_existing_cmd("service:instance:chat:abc", "{}", 60);
        let args: Vec<String> = cmd
            .args_iter()
            .filter_map(|arg| match arg {
                redis::Arg::Simple(bytes) => Some(String::from_utf8_lossy(bytes).to_string()),
                _ => None,
            })
            .collect();
        assert_eq!(
            args,
            vec!["SET", "service:instance:chat:abc", "{}", "XX", "EX", "60"]
        );
    }
}
