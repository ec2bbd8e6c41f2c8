//! Prometheus HTTP 服务发现
//!
//! 每个配置了 `meta.metricsPort` 的实例输出一组 `{targets, labels}`，
//! 没有采集端口的实例直接忽略

use std::collections::BTreeMap;

use serde::Serialize;

use crate::discovery::ServiceInstance;

/// HTTP-SD 目标组
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TargetGroup {
    pub targets: Vec<String>,
    pub labels: BTreeMap<String, String>,
}

impl TargetGroup {
    pub fn from_instance(instance: &ServiceInstance) -> Option<Self> {
        let port = instance.metrics_port()?;

        let mut labels = BTreeMap::new();
        labels.insert("service_type".to_string(), instance.service_type.clone());
        labels.insert("instance_id".to_string(), instance.instance_id.clone());
        labels.insert("hostname".to_string(), instance.hostname.clone());
        labels.insert("status".to_string(), instance.status.as_str().to_string());
        if let Some(name) = instance.meta_str("instanceName") {
            labels.insert("instance_name".to_string(), name.to_string());
        }

        Some(Self {
            targets: vec![format!("{}:{}", instance.internal_address, port)],
            labels,
        })
    }
}

/// 实例列表转换为目标组列表
pub fn target_groups(instances: &[ServiceInstance]) -> Vec<TargetGroup> {
    instances.iter().filter_map(TargetGroup::from_instance).collect()
}
