//! etcd 服务注册后端
//!
//! 实例存储在 `/services/<type>/<id>`，绑定到 TTL 为 `ttl_seconds` 的租约上。
//! 租约 ID 缓存在进程内（键为 `type:id`），续期、注销和状态更新都依赖这份缓存。
//! 租约到期会删除键，并通过 watch 流以 delete 事件的形式出现。
//!
//! 每次写入都以 put 事件出现在 watch 中，包括心跳刷新 updatedAt 的写入。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{Client, EventType, GetOptions, PutOptions, WatchOptions};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{DiscoveryProvider, HeartbeatTasks, Leadership, RegistrationSettings, apply_status_update};
use crate::config::EtcdConfig;
use crate::discovery::instance::{
    InstanceStats, ServiceInstance, ServiceStatus, WatchEvent, registry_key,
};
use crate::discovery::watch::{WatchCallback, WatchHub, WatchId};
use crate::error::{DiscoveryError, ErrorCode, Result, map_backend_error};

/// 所有实例键的公共前缀
pub const SERVICES_PREFIX: &str = "/services/";

/// 选主租约 TTL（秒）
const ELECTION_LEASE_TTL: i64 = 10;

/// `/services/<type>/<id>`
pub fn service_key(service_type: &str, instance_id: &str) -> String {
    format!("{}{}/{}", SERVICES_PREFIX, service_type, instance_id)
}

/// `/services/<type>/`
pub fn type_prefix(service_type: &str) -> String {
    format!("{}{}/", SERVICES_PREFIX, service_type)
}

/// 从 `/services/<type>/<id>` 解析出 `(type, id)`
pub fn parse_service_key(key: &str) -> Option<(&str, &str)> {
    let rest = key.strip_prefix(SERVICES_PREFIX)?;
    let (service_type, instance_id) = rest.split_once('/')?;
    if service_type.is_empty() || instance_id.is_empty() || instance_id.contains('/') {
        return None;
    }
    Some((service_type, instance_id))
}

/// 租约 TTL（秒），超出 etcd 可表示的范围时报参数错误
fn lease_ttl(ttl_seconds: u64) -> Result<i64> {
    i64::try_from(ttl_seconds.max(1)).map_err(|_| {
        DiscoveryError::invalid_parameter(format!("ttl_seconds {ttl_seconds} exceeds lease range"))
    })
}

/// 解析键值，无法解析的值记录警告后丢弃
fn decode_instance(key: &[u8], value: &[u8]) -> Option<ServiceInstance> {
    match serde_json::from_slice::<ServiceInstance>(value) {
        Ok(instance) => Some(instance),
        Err(e) => {
            warn!(key = %String::from_utf8_lossy(key), error = %e, "Skipping undecodable etcd value");
            None
        }
    }
}

/// etcd 服务注册后端
pub struct EtcdProvider {
    inner: Arc<EtcdInner>,
}

struct EtcdInner {
    client: Client,
    leases: Mutex<HashMap<String, i64>>,
    heartbeats: HeartbeatTasks,
    watcher: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    hub: WatchHub,
    settings: RegistrationSettings,
    closed: AtomicBool,
}

impl EtcdProvider {
    /// 连接 etcd
    pub async fn connect(config: &EtcdConfig, settings: RegistrationSettings) -> Result<Self> {
        if config.hosts.is_empty() {
            return Err(DiscoveryError::missing_setting("discovery.etcd.hosts"));
        }

        let client = Client::connect(config.hosts.clone(), None).await?;

        info!(hosts = ?config.hosts, "etcd discovery provider connected");

        Ok(Self {
            inner: Arc::new(EtcdInner {
                client,
                leases: Mutex::new(HashMap::new()),
                heartbeats: HeartbeatTasks::default(),
                watcher: tokio::sync::Mutex::new(None),
                hub: WatchHub::new(),
                settings,
                closed: AtomicBool::new(false),
            }),
        })
    }

    fn start_heartbeat(&self, instance_id: &str, service_type: &str, ttl_seconds: u64) {
        let weak: Weak<EtcdInner> = Arc::downgrade(&self.inner);
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
                            debug!(instance_id = %instance_id, service_type = %service_type, "Lease keep-alive sent");
                        }
                        Ok(false) => {
                            warn!(instance_id = %instance_id, service_type = %service_type, "Lease keep-alive skipped, lease gone");
                        }
                        Err(e) => {
                            error!(instance_id = %instance_id, service_type = %service_type, error = %e, "Lease keep-alive failed");
                        }
                    }
                }
            },
        );
    }

    async fn ensure_watching(&self) -> Result<()> {
        let mut watcher_slot = self.inner.watcher.lock().await;
        if watcher_slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return Ok(());
        }

        let mut client = self.inner.client.clone();
        let opts = WatchOptions::new().with_prefix().with_prev_key();
        let (watcher, mut stream) = client.watch(SERVICES_PREFIX, Some(opts)).await?;

        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            // watcher 被丢弃时 watch 会被取消
            let _watcher = watcher;
            loop {
                let resp = match stream.message().await {
                    Ok(Some(resp)) => resp,
                    Ok(None) => break,
                    Err(e) => {
                        error!(error = %e, "etcd watch stream error");
                        break;
                    }
                };
                let Some(inner) = weak.upgrade() else { break };
                for event in resp.events() {
                    if let Some(watch_event) = decode_event(event) {
                        inner.hub.dispatch(&watch_event);
                    }
                }
            }
            warn!(prefix = SERVICES_PREFIX, "etcd discovery watch ended");
        });

        *watcher_slot = Some(handle);
        info!(prefix = SERVICES_PREFIX, "Watching discovery prefix");
        Ok(())
    }
}

/// 把 etcd watch 事件转换为注册中心事件
fn decode_event(event: &etcd_client::Event) -> Option<WatchEvent> {
    match event.event_type() {
        EventType::Put => {
            let kv = event.kv()?;
            decode_instance(kv.key(), kv.value()).map(WatchEvent::put)
        }
        EventType::Delete => match event.prev_kv().filter(|kv| !kv.value().is_empty()) {
            Some(prev) => decode_instance(prev.key(), prev.value()).map(WatchEvent::delete),
            None => {
                let key = event.kv().map(|kv| String::from_utf8_lossy(kv.key()).to_string());
                warn!(key = ?key, "Delete event without previous value, dropped");
                None
            }
        },
    }
}

impl EtcdInner {
    fn cached_lease(&self, key: &str) -> Option<i64> {
        self.lock_leases().get(key).copied()
    }

    fn lock_leases(&self) -> std::sync::MutexGuard<'_, HashMap<String, i64>> {
        self.leases.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 单次续约，租约已过期或不存在时返回 false
    async fn keepalive_once(&self, lease_id: i64) -> Result<bool> {
        let mut client = self.client.clone();
        let (mut keeper, mut stream) = match client.lease_keep_alive(lease_id).await {
            Ok(pair) => pair,
            Err(etcd_client::Error::LeaseKeepAliveError(_)) => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        keeper.keep_alive().await?;
        match stream.message().await? {
            Some(resp) => Ok(resp.ttl() > 0),
            None => Ok(false),
        }
    }

    async fn read(&self, instance_id: &str, service_type: &str) -> Result<Option<ServiceInstance>> {
        let mut client = self.client.clone();
        let resp = client.get(service_key(service_type, instance_id), None).await?;
        match resp.kvs().first() {
            Some(kv) => Ok(Some(serde_json::from_slice(kv.value())?)),
            None => Ok(None),
        }
    }

    async fn put(&self, instance: &ServiceInstance, lease_id: Option<i64>) -> Result<()> {
        let value = serde_json::to_vec(instance)?;
        let opts = lease_id.map(|id| PutOptions::new().with_lease(id));
        let mut client = self.client.clone();
        client
            .put(service_key(&instance.service_type, &instance.instance_id), value, opts)
            .await?;
        Ok(())
    }

    /// 续约并刷新 updatedAt；没有缓存租约或租约已失效时返回 false
    async fn renew(&self, instance_id: &str, service_type: &str) -> Result<bool> {
        let key = registry_key(instance_id, service_type);
        let Some(lease_id) = self.cached_lease(&key) else {
            return Ok(false);
        };

        if !self.keepalive_once(lease_id).await? {
            self.lock_leases().remove(&key);
            return Ok(false);
        }

        if let Some(mut instance) = self.read(instance_id, service_type).await? {
            instance.touch();
            self.put(&instance, Some(lease_id)).await?;
        }
        Ok(true)
    }

    async fn revoke(&self, lease_id: i64) -> Result<()> {
        let mut client = self.client.clone();
        client.lease_revoke(lease_id).await?;
        Ok(())
    }
}

#[async_trait]
impl DiscoveryProvider for EtcdProvider {
    fn name(&self) -> &'static str {
        "etcd"
    }

    async fn register(&self, mut instance: ServiceInstance, ttl_seconds: u64) -> Result<()> {
        let key = instance.registry_key();
        let ttl_seconds = self.inner.settings.ttl_or_default(ttl_seconds);
        let lease_secs = lease_ttl(ttl_seconds)?;
        let mut client = self.inner.client.clone();
        let lease = client.lease_grant(lease_secs, None).await?;
        let lease_id = lease.id();

        instance.touch();
        self.inner.put(&instance, Some(lease_id)).await?;

        let previous = self.inner.lock_leases().insert(key.clone(), lease_id);
        if let Some(old_lease) = previous.filter(|old| *old != lease_id) {
            if let Err(e) = self.inner.revoke(old_lease).await {
                debug!(lease_id = old_lease, error = %e, "Old lease already gone");
            }
        }

        if self.inner.settings.auto_heartbeat {
            self.start_heartbeat(&instance.instance_id, &instance.service_type, ttl_seconds);
        }

        info!(
            instance_id = %instance.instance_id,
            service_type = %instance.service_type,
            lease_id = lease_id,
            ttl_seconds = ttl_seconds,
            "Service registered"
        );
        Ok(())
    }

    async fn heartbeat(&self, instance_id: &str, service_type: &str) -> Result<()> {
        if !self.inner.renew(instance_id, service_type).await? {
            warn!(
                instance_id = %instance_id,
                service_type = %service_type,
                "Heartbeat ignored, no live lease for instance"
            );
        }
        Ok(())
    }

    async fn unregister(&self, instance_id: &str, service_type: &str) -> Result<()> {
        let key = registry_key(instance_id, service_type);
        self.inner.heartbeats.cancel(&key);

        let lease = self.inner.lock_leases().remove(&key);
        let revoked = match lease {
            Some(lease_id) => match self.inner.revoke(lease_id).await {
                Ok(()) => true,
                Err(e) => {
                    debug!(lease_id = lease_id, error = %e, "Lease revoke failed, deleting key directly");
                    false
                }
            },
            None => false,
        };

        if !revoked {
            let mut client = self.inner.client.clone();
            client.delete(service_key(service_type, instance_id), None).await?;
        }

        info!(instance_id = %instance_id, service_type = %service_type, "Service unregistered");
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
        let mut instance = self
            .inner
            .read(instance_id, service_type)
            .await?
            .ok_or_else(|| DiscoveryError::not_found(instance_id, service_type))?;

        apply_status_update(&mut instance, status, stats, meta);

        let lease = self.inner.cached_lease(&registry_key(instance_id, service_type));
        if let Some(lease_id) = lease {
            let _ = self.inner.keepalive_once(lease_id).await?;
        } else {
            warn!(
                instance_id = %instance_id,
                service_type = %service_type,
                "No cached lease, status written without expiry"
            );
        }
        self.inner.put(&instance, lease).await?;

        debug!(
            instance_id = %instance_id,
            service_type = %service_type,
            status = %status,
            "Service status updated"
        );
        Ok(instance)
    }

    async fn get_services(&self, service_type: Option<&str>) -> Result<Vec<ServiceInstance>> {
        let prefix = match service_type {
            Some(t) => type_prefix(t),
            None => SERVICES_PREFIX.to_string(),
        };

        let mut client = self.inner.client.clone();
        let listing = client
            .get(prefix, Some(GetOptions::new().with_prefix().with_keys_only()))
            .await?;

        let mut services = Vec::with_capacity(listing.kvs().len());
        for kv in listing.kvs() {
            let key = String::from_utf8_lossy(kv.key()).to_string();
            let Some((t, id)) = parse_service_key(&key) else {
                continue;
            };
            match self.inner.read(id, t).await {
                Ok(Some(instance)) => services.push(instance),
                Ok(None) => {}
                Err(e) if e.code() == Some(ErrorCode::DeserializationError) => {
                    warn!(key = %key, error = %e, "Skipping undecodable instance");
                }
                Err(e) => return Err(e),
            }
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
        if let Err(e) = self.ensure_watching().await {
            self.inner.hub.unsubscribe(id);
            return Err(e);
        }
        Ok(id)
    }

    fn unwatch(&self, id: WatchId) -> bool {
        self.inner.hub.unsubscribe(id)
    }

    fn emits_expiry_events(&self) -> bool {
        true
    }

    async fn campaign(&self, election: &str, candidate: &str) -> Result<Leadership> {
        let key = format!("election:{}", election);
        let mut client = self.inner.client.clone();
        let lease_id = client.lease_grant(ELECTION_LEASE_TTL, None).await?.id();

        // 重新竞选时旧租约作废，撤销后旧的领导权键随之删除
        let previous = self.inner.lock_leases().insert(key.clone(), lease_id);
        if let Some(old_lease) = previous.filter(|old| *old != lease_id) {
            if let Err(e) = self.inner.revoke(old_lease).await {
                debug!(lease_id = old_lease, error = %e, "Old election lease already gone");
            }
        }

        let (held_tx, held_rx) = tokio::sync::watch::channel(true);
        let weak = Arc::downgrade(&self.inner);
        let lease_key = key.clone();
        self.inner.heartbeats.spawn(key.clone(), async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(ELECTION_LEASE_TTL as u64 / 2));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                match inner.keepalive_once(lease_id).await {
                    Ok(true) => {}
                    Ok(false) => {
                        error!(lease_id = lease_id, "Election lease lost");
                        let mut leases = inner.lock_leases();
                        if leases.get(&lease_key) == Some(&lease_id) {
                            leases.remove(&lease_key);
                        }
                        break;
                    }
                    Err(e) => warn!(lease_id = lease_id, error = %e, "Election lease keep-alive failed"),
                }
            }
            let _ = held_tx.send(false);
        });

        info!(election = %election, candidate = %candidate, "Campaigning for leadership");
        if let Err(e) = client.campaign(election, candidate, lease_id).await {
            self.inner.heartbeats.cancel(&key);
            self.inner.lock_leases().remove(&key);
            if let Err(revoke_err) = self.inner.revoke(lease_id).await {
                debug!(lease_id = lease_id, error = %revoke_err, "Election lease revoke failed");
            }
            return Err(map_backend_error(
                e,
                ErrorCode::ElectionFailed,
                format!("campaign for {election} failed"),
            ));
        }
        info!(election = %election, candidate = %candidate, "Leadership acquired");
        Ok(Leadership::new(held_rx))
    }

    async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let cancelled = self.inner.heartbeats.cancel_all();
        if let Some(handle) = self.inner.watcher.lock().await.take() {
            handle.abort();
        }
        self.inner.hub.clear();

        let leases: Vec<(String, i64)> = self.inner.lock_leases().drain().collect();
        for (key, lease_id) in &leases {
            if let Err(e) = self.inner.revoke(*lease_id).await {
                warn!(key = %key, lease_id = lease_id, error = %e, "Failed to revoke lease on close");
            }
        }

        info!(
            heartbeats_cancelled = cancelled,
            leases_revoked = leases.len(),
            "etcd discovery provider closed"
        );
        Ok(())
    }
}
