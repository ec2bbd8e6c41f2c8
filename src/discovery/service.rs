//! 服务发现监控门面
//!
//! HTTP 处理器和清理任务共用的访问入口，只委托给当前后端，不保存状态

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use super::instance::{ServiceInstance, ServiceStatus};
use super::provider::DiscoveryProvider;
use super::watch::{WatchCallback, WatchId};
use crate::error::Result;

/// 实例数量统计
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStats {
    pub total: usize,
    pub by_type: BTreeMap<String, usize>,
    pub by_status: BTreeMap<String, usize>,
}

impl ServiceStats {
    /// 按类型和状态分组计数
    pub fn from_instances(instances: &[ServiceInstance]) -> Self {
        let mut stats = ServiceStats {
            total: instances.len(),
            ..Default::default()
        };
        for instance in instances {
            *stats.by_type.entry(instance.service_type.clone()).or_default() += 1;
            *stats
                .by_status
                .entry(instance.status.as_str().to_string())
                .or_default() += 1;
        }
        stats
    }
}

/// 服务发现门面
#[derive(Clone)]
pub struct DiscoveryService {
    provider: Arc<dyn DiscoveryProvider>,
}

impl DiscoveryService {
    pub fn new(provider: Arc<dyn DiscoveryProvider>) -> Self {
        Self { provider }
    }

    pub fn provider(&self) -> &Arc<dyn DiscoveryProvider> {
        &self.provider
    }

    pub async fn get_services(&self, service_type: Option<&str>) -> Result<Vec<ServiceInstance>> {
        self.provider.get_services(service_type).await
    }

    pub async fn get_service(
        &self,
        instance_id: &str,
        service_type: &str,
    ) -> Result<Option<ServiceInstance>> {
        self.provider.get_service(instance_id, service_type).await
    }

    pub async fn watch_services(&self, callback: WatchCallback) -> Result<WatchId> {
        self.provider.watch(callback).await
    }

    pub fn unwatch(&self, id: WatchId) -> bool {
        self.provider.unwatch(id)
    }

    /// 强制注销（管理操作），不管剩余 TTL
    pub async fn unregister(&self, instance_id: &str, service_type: &str) -> Result<()> {
        self.provider.unregister(instance_id, service_type).await?;
        info!(
            instance_id = %instance_id,
            service_type = %service_type,
            "Service forcibly unregistered"
        );
        Ok(())
    }

    /// 当前所有实例的类型（去重、排序）
    pub async fn get_service_types(&self) -> Result<Vec<String>> {
        let types: BTreeSet<String> = self
            .provider
            .get_services(None)
            .await?
            .into_iter()
            .map(|instance| instance.service_type)
            .collect();
        Ok(types.into_iter().collect())
    }

    pub async fn get_service_stats(&self) -> Result<ServiceStats> {
        let instances = self.provider.get_services(None).await?;
        Ok(ServiceStats::from_instances(&instances))
    }

    pub fn emits_expiry_events(&self) -> bool {
        self.provider.emits_expiry_events()
    }

    /// updatedAt 超过阈值的实例标记为 `no-response`（只用于展示，不写回）
    pub fn annotate_unresponsive(
        instances: Vec<ServiceInstance>,
        now: DateTime<Utc>,
        threshold: chrono::Duration,
    ) -> Vec<ServiceInstance> {
        instances
            .into_iter()
            .map(|mut instance| {
                if instance.status != ServiceStatus::Terminated && instance.is_stale(now, threshold) {
                    instance.status = ServiceStatus::NoResponse;
                }
                instance
            })
            .collect()
    }
}
