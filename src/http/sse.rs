//! 注册中心变更的 SSE 推送
//!
//! 连接建立时先订阅 watch，再读取快照发送 `init`，之后逐条转发 `put` / `delete`。
//! 后端不推送 TTL 过期事件时（Redis），额外定期比对快照，为消失的实例补发 `delete`。
//! 客户端断开后订阅和比对任务随流一起释放。

use std::collections::{HashMap, HashSet};
use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use chrono::Utc;
use futures_util::stream::{self, Stream, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};

use super::AppState;
use crate::discovery::{
    CallbackResult, DiscoveryService, ServiceInstance, WatchCallback, WatchEvent, WatchEventType,
    WatchId,
};
use crate::error::DiscoveryError;

/// 已推送给客户端的实例
///
/// 每条记录带上最后一次被 watch 事件修改时的序号，delete 留下墓碑（`None`），
/// 比对快照时只处理在快照读取开始前就已确定的记录。
#[derive(Default)]
struct Known {
    seq: u64,
    entries: HashMap<String, (Option<ServiceInstance>, u64)>,
}

type KnownInstances = Arc<Mutex<Known>>;

/// 连接级订阅，drop 时取消 watch 回调和比对任务
struct Subscription {
    discovery: DiscoveryService,
    watch_id: Option<WatchId>,
    resync: Option<JoinHandle<()>>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(id) = self.watch_id.take() {
            self.discovery.unwatch(id);
        }
        if let Some(handle) = self.resync.take() {
            handle.abort();
        }
        debug!("SSE subscription released");
    }
}

/// `GET /api/v1/services/events`
///
/// watch 订阅失败时仍然先发送 `init` 快照，再发送一个 `error` 事件后结束
pub async fn stream_events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (tx, rx) = mpsc::unbounded_channel::<WatchEvent>();
    let known: KnownInstances = Arc::new(Mutex::new(Known::default()));

    let mut subscription = Subscription {
        discovery: state.discovery.clone(),
        watch_id: None,
        resync: None,
    };

    // 先订阅再读快照，快照之后的变更不会丢
    let watched = state
        .discovery
        .watch_services(forwarder(tx.clone(), known.clone()))
        .await;

    let mut first = Vec::with_capacity(2);
    let snapshot_ok = match state.discovery.get_services(None).await {
        Ok(instances) => {
            remember(&known, &instances);
            let labelled = DiscoveryService::annotate_unresponsive(
                instances,
                Utc::now(),
                state.unresponsive_after,
            );
            info!(instances = labelled.len(), "SSE client connected");
            first.push(init_event(&labelled));
            true
        }
        Err(e) => {
            first.push(error_event(&e));
            false
        }
    };

    match watched {
        Ok(id) => {
            subscription.watch_id = Some(id);
            if !state.discovery.emits_expiry_events() {
                subscription.resync = Some(tokio::spawn(resync_loop(
                    state.discovery.clone(),
                    known.clone(),
                    tx.clone(),
                    state.sse_resync_interval,
                )));
            }
        }
        Err(e) if snapshot_ok => first.push(error_event(&e)),
        Err(e) => debug!(error = %e, "SSE watch also failed"),
    }

    // 订阅失败时发送端全部释放，流在 error 事件后结束
    drop(tx);

    let events = UnboundedReceiverStream::new(rx).map(|event| watch_event(&event));
    let stream = stream::iter(first)
        .chain(events)
        .map(move |event| {
            let _held = &subscription;
            Ok(event)
        });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}

/// 把 watch 事件写入连接的发送队列，队列关闭说明客户端已断开
fn forwarder(tx: mpsc::UnboundedSender<WatchEvent>, known: KnownInstances) -> WatchCallback {
    Arc::new(move |event: &WatchEvent| -> CallbackResult {
        track(&known, event);
        tx.send(event.clone())
            .map_err(|_| "SSE client disconnected".into())
    })
}

fn lock(known: &KnownInstances) -> std::sync::MutexGuard<'_, Known> {
    known.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// 记录初始快照，已经由事件写入的记录不覆盖
fn remember(known: &KnownInstances, instances: &[ServiceInstance]) {
    let mut known = lock(known);
    let seq = known.seq;
    for instance in instances {
        known
            .entries
            .entry(instance.registry_key())
            .or_insert_with(|| (Some(instance.clone()), seq));
    }
}

fn track(known: &KnownInstances, event: &WatchEvent) {
    let mut known = lock(known);
    known.seq += 1;
    let seq = known.seq;
    let value = match event.event_type {
        WatchEventType::Put => Some(event.instance.clone()),
        WatchEventType::Delete => None,
    };
    known.entries.insert(event.instance.registry_key(), (value, seq));
}

/// 开始读取快照前的序号
fn mark(known: &KnownInstances) -> u64 {
    lock(known).seq
}

/// 和 `mark` 之后读取的快照比对，返回已消失实例的最后状态
///
/// 序号大于 `mark` 的记录在读取期间被事件改过，本轮跳过
fn reconcile(known: &KnownInstances, mark: u64, current: &[ServiceInstance]) -> Vec<ServiceInstance> {
    let present: HashSet<String> = current.iter().map(ServiceInstance::registry_key).collect();

    let mut known = lock(known);
    let gone: Vec<String> = known
        .entries
        .iter()
        .filter(|(key, (_, seq))| *seq <= mark && !present.contains(*key))
        .map(|(key, _)| key.clone())
        .collect();

    gone.into_iter()
        .filter_map(|key| known.entries.remove(&key).and_then(|(instance, _)| instance))
        .collect()
}

async fn resync_loop(
    discovery: DiscoveryService,
    known: KnownInstances,
    tx: mpsc::UnboundedSender<WatchEvent>,
    period: Duration,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let since = mark(&known);
        let current = match discovery.get_services(None).await {
            Ok(current) => current,
            Err(e) => {
                warn!(error = %e, "SSE resync failed");
                continue;
            }
        };
        for instance in reconcile(&known, since, &current) {
            debug!(
                instance_id = %instance.instance_id,
                service_type = %instance.service_type,
                "Instance expired, emitting delete"
            );
            if tx.send(WatchEvent::delete(instance)).is_err() {
                return;
            }
        }
    }
}

fn init_event(instances: &[ServiceInstance]) -> Event {
    match serde_json::to_string(instances) {
        Ok(data) => Event::default().event("init").data(data),
        Err(e) => error_event(&e.into()),
    }
}

fn watch_event(event: &WatchEvent) -> Event {
    match serde_json::to_string(event) {
        Ok(data) => Event::default().event(event.event_type.as_str()).data(data),
        Err(e) => error_event(&e.into()),
    }
}

fn error_event(error: &DiscoveryError) -> Event {
    warn!(error = %error, "SSE stream error");
    let code = error.code().map(|c| c.as_str()).unwrap_or("INTERNAL_ERROR");
    Event::default()
        .event("error")
        .data(json!({ "code": code, "message": error.reason() }).to_string())
}
