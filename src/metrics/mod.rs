//! 注册中心指标
//!
//! 每次抓取 `/metrics` 时根据当前实例列表刷新数量仪表

use prometheus::{Encoder, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};

use crate::discovery::ServiceInstance;
use crate::error::{DiscoveryError, Result};

/// 实例数量指标
#[derive(Clone)]
pub struct RegistryMetrics {
    registry: Registry,
    instances: IntGaugeVec,
    instances_total: IntGauge,
}

impl RegistryMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let instances = IntGaugeVec::new(
            Opts::new("discovery_instances", "Live service instances by type and status"),
            &["service_type", "status"],
        )
        .map_err(metrics_error)?;
        let instances_total = IntGauge::new("discovery_instances_total", "Live service instances")
            .map_err(metrics_error)?;

        registry.register(Box::new(instances.clone())).map_err(metrics_error)?;
        registry
            .register(Box::new(instances_total.clone()))
            .map_err(metrics_error)?;

        Ok(Self {
            registry,
            instances,
            instances_total,
        })
    }

    /// 用当前实例列表重置仪表
    ///
    /// 已消失的类型/状态组合会被移除，不会停留在旧值
    pub fn observe(&self, instances: &[ServiceInstance]) {
        self.instances.reset();
        for instance in instances {
            self.instances
                .with_label_values(&[instance.service_type.as_str(), instance.status.as_str()])
                .inc();
        }
        self.instances_total.set(instances.len() as i64);
    }

    pub fn total(&self) -> i64 {
        self.instances_total.get()
    }

    /// Prometheus 文本格式输出
    pub fn export(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).map_err(metrics_error)?;
        String::from_utf8(buffer).map_err(|e| DiscoveryError::serialization_error(e.to_string()))
    }
}

fn metrics_error(e: prometheus::Error) -> DiscoveryError {
    DiscoveryError::system(format!("metrics error: {e}"))
}
