//! etcd 后端集成测试
//!
//! 这些测试需要运行中的 etcd 服务器实例。
//! 默认情况下，测试会被忽略，需要使用 `cargo test --test etcd_provider_test -- --ignored` 运行。
//!
//! 启动 etcd 服务器：
//! ```bash
//! docker run -d --name etcd-test -p 2379:2379 -p 2380:2380 \
//!   quay.io/coreos/etcd:v3.5.9 \
//!   etcd --advertise-client-urls=http://127.0.0.1:2379 \
//!        --listen-client-urls=http://0.0.0.0:2379
//! ```

use std::sync::{Arc, Mutex};

use gameops_discovery::config::EtcdConfig;
use gameops_discovery::discovery::{
    DiscoveryProvider, EtcdProvider, RegistrationSettings, ServiceInstance, ServiceStatus,
    WatchCallback, WatchEvent, WatchEventType,
};
use tokio::time::{Duration, sleep};

/// etcd 服务器地址
/// 可以通过环境变量 ETCD_ENDPOINTS 覆盖，默认为 http://127.0.0.1:2379
fn etcd_endpoints() -> Vec<String> {
    std::env::var("ETCD_ENDPOINTS")
        .map(|s| s.split(',').map(|s| s.trim().to_string()).collect())
        .unwrap_or_else(|_| vec!["http://127.0.0.1:2379".to_string()])
}

async fn provider(auto_heartbeat: bool) -> EtcdProvider {
    let config = EtcdConfig {
        hosts: etcd_endpoints(),
    };
    let settings = RegistrationSettings::default().with_auto_heartbeat(auto_heartbeat);
    EtcdProvider::connect(&config, settings)
        .await
        .expect("etcd must be running for ignored tests")
}

fn test_instance(service_type: &str) -> ServiceInstance {
    ServiceInstance::new(service_type, "etcd-test-host")
        .with_addresses("203.0.113.30", "10.0.0.30")
        .with_http_port(8081)
        .with_meta("metricsPort", 9102)
}

async fn wait_until_gone(provider: &EtcdProvider, instance: &ServiceInstance, within: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        let current = provider
            .get_service(&instance.instance_id, &instance.service_type)
            .await
            .unwrap();
        if current.is_none() {
            return true;
        }
        sleep(Duration::from_millis(250)).await;
    }
    false
}

#[tokio::test]
#[ignore]
async fn register_then_get_round_trips() {
    let provider = provider(true).await;
    let instance = test_instance("et-chat");

    provider.register(instance.clone(), 30).await.unwrap();
    let stored = provider
        .get_service(&instance.instance_id, &instance.service_type)
        .await
        .unwrap()
        .unwrap();

    let mut expected = instance.clone();
    expected.updated_at = stored.updated_at;
    assert_eq!(stored, expected);
    assert!(stored.updated_at >= instance.updated_at);

    provider.unregister(&instance.instance_id, &instance.service_type).await.unwrap();
    provider.close().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn lease_expiry_removes_instance() {
    let provider = provider(false).await;
    let instance = test_instance("et-expiry");

    provider.register(instance.clone(), 1).await.unwrap();
    sleep(Duration::from_secs(3)).await;

    // etcd 按秒回收租约，留出一点余量
    assert!(wait_until_gone(&provider, &instance, Duration::from_secs(3)).await);
    let listed = provider.get_services(Some("et-expiry")).await.unwrap();
    assert!(listed.iter().all(|i| i.instance_id != instance.instance_id));
    provider.close().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn heartbeat_keeps_lease_alive() {
    let provider = provider(false).await;
    let instance = test_instance("et-heartbeat");

    provider.register(instance.clone(), 2).await.unwrap();
    for _ in 0..4 {
        sleep(Duration::from_millis(800)).await;
        provider
            .heartbeat(&instance.instance_id, &instance.service_type)
            .await
            .unwrap();
    }

    assert!(
        provider
            .get_service(&instance.instance_id, &instance.service_type)
            .await
            .unwrap()
            .is_some()
    );
    provider.unregister(&instance.instance_id, &instance.service_type).await.unwrap();
    provider.close().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn unregister_is_idempotent() {
    let provider = provider(true).await;
    let instance = test_instance("et-idem");

    provider.register(instance.clone(), 30).await.unwrap();
    provider.unregister(&instance.instance_id, &instance.service_type).await.unwrap();
    provider.unregister(&instance.instance_id, &instance.service_type).await.unwrap();
    provider.heartbeat(&instance.instance_id, &instance.service_type).await.unwrap();

    assert!(
        provider
            .get_service(&instance.instance_id, &instance.service_type)
            .await
            .unwrap()
            .is_none()
    );
    provider.close().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn same_id_is_isolated_by_type() {
    let provider = provider(true).await;
    let chat = test_instance("et-iso-chat").with_instance_id("shared-id");
    let world = test_instance("et-iso-world").with_instance_id("shared-id");

    provider.register(chat, 30).await.unwrap();
    provider.register(world, 30).await.unwrap();

    let chats = provider.get_services(Some("et-iso-chat")).await.unwrap();
    assert_eq!(chats.len(), 1);
    assert_eq!(chats[0].service_type, "et-iso-chat");

    provider.unregister("shared-id", "et-iso-chat").await.unwrap();
    assert!(provider.get_service("shared-id", "et-iso-world").await.unwrap().is_some());
    provider.unregister("shared-id", "et-iso-world").await.unwrap();
    provider.close().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn watch_reports_put_update_and_expiry() {
    let provider = provider(false).await;
    let seen: Vec<Arc<Mutex<Vec<(WatchEventType, ServiceStatus)>>>> =
        (0..2).map(|_| Arc::new(Mutex::new(Vec::new()))).collect();

    for sink in &seen {
        let sink = sink.clone();
        let cb: WatchCallback = Arc::new(move |event: &WatchEvent| {
            if event.instance.service_type == "et-watch" {
                sink.lock().unwrap().push((event.event_type, event.instance.status));
            }
            Ok(())
        });
        provider.watch(cb).await.unwrap();
    }

    let instance = test_instance("et-watch");
    provider.register(instance.clone(), 1).await.unwrap();
    provider
        .update_status(
            &instance.instance_id,
            &instance.service_type,
            ServiceStatus::Ready,
            None,
            None,
        )
        .await
        .unwrap();
    assert!(wait_until_gone(&provider, &instance, Duration::from_secs(6)).await);
    sleep(Duration::from_millis(300)).await;

    for sink in &seen {
        assert_eq!(
            *sink.lock().unwrap(),
            vec![
                (WatchEventType::Put, ServiceStatus::Initializing),
                (WatchEventType::Put, ServiceStatus::Ready),
                (WatchEventType::Delete, ServiceStatus::Ready),
            ]
        );
    }
    provider.close().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn update_status_on_missing_instance_fails() {
    let provider = provider(true).await;
    let err = provider
        .update_status("missing", "et-status", ServiceStatus::Error, None, None)
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    provider.close().await.unwrap();
}

/// 收集指定类型的事件
async fn record_events(
    provider: &EtcdProvider,
    service_type: &'static str,
) -> Arc<Mutex<Vec<WatchEventType>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let cb: WatchCallback = Arc::new(move |event: &WatchEvent| {
        if event.instance.service_type == service_type {
            sink.lock().unwrap().push(event.event_type);
        }
        Ok(())
    });
    provider.watch(cb).await.unwrap();
    seen
}

#[tokio::test]
#[ignore]
async fn reregister_and_unchanged_status_update_emit_puts() {
    let provider = provider(false).await;
    let seen = record_events(&provider, "et-rereg").await;
    let instance = test_instance("et-rereg");

    provider.register(instance.clone(), 30).await.unwrap();
    provider.register(instance.clone(), 30).await.unwrap();
    provider
        .update_status(
            &instance.instance_id,
            &instance.service_type,
            ServiceStatus::Initializing,
            None,
            None,
        )
        .await
        .unwrap();
    provider.unregister(&instance.instance_id, &instance.service_type).await.unwrap();
    sleep(Duration::from_millis(500)).await;

    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            WatchEventType::Put,
            WatchEventType::Put,
            WatchEventType::Put,
            WatchEventType::Delete,
        ]
    );
    provider.close().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn reregistration_keeps_instance_alive() {
    let provider = provider(true).await;
    let instance = test_instance("et-rereg-alive");

    provider.register(instance.clone(), 2).await.unwrap();
    provider.register(instance.clone(), 2).await.unwrap();

    // 旧租约被撤销，新租约由重新启动的心跳维持
    sleep(Duration::from_secs(5)).await;
    assert!(
        provider
            .get_service(&instance.instance_id, &instance.service_type)
            .await
            .unwrap()
            .is_some()
    );
    provider.unregister(&instance.instance_id, &instance.service_type).await.unwrap();
    provider.close().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn close_revokes_leases() {
    let owner = provider(true).await;
    let observer = provider(false).await;
    let instance = test_instance("et-close");

    owner.register(instance.clone(), 30).await.unwrap();
    assert!(
        observer
            .get_service(&instance.instance_id, &instance.service_type)
            .await
            .unwrap()
            .is_some()
    );

    owner.close().await.unwrap();
    owner.close().await.unwrap();
    assert!(wait_until_gone(&observer, &instance, Duration::from_secs(3)).await);
    observer.close().await.unwrap();
}
