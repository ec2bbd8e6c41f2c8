//! 服务实例定义
//!
//! 这里的 JSON 结构就是两种后端实际存储的值，Redis 与 etcd 在数据层面可以互换

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 服务实例
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInstance {
    /// 实例 ID（时间有序，注册时分配，生命周期内不变）
    pub instance_id: String,

    /// 服务类型（如 "chat", "world", "backend"）
    #[serde(rename = "type")]
    pub service_type: String,

    pub hostname: String,

    pub external_address: String,

    pub internal_address: String,

    #[serde(default)]
    pub ports: ServicePorts,

    pub status: ServiceStatus,

    /// 最后一次写入时间（注册、心跳或状态变更）
    pub updated_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_stats: Option<InstanceStats>,

    /// 服务自定义注解（显示名称、在线人数等）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<HashMap<String, serde_json::Value>>,
}

/// 按传输协议分组的端口
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServicePorts {
    #[serde(default)]
    pub tcp: BTreeSet<u16>,
    #[serde(default)]
    pub udp: BTreeSet<u16>,
    #[serde(default)]
    pub http: BTreeSet<u16>,
}

/// 实例运行状态（仅供观察，不作为权威数据）
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InstanceStats {
    /// CPU 使用率（%）
    pub cpu_usage: f64,
    /// 已用内存（字节）
    pub memory_used: u64,
    /// 总内存（字节）
    pub memory_total: u64,
}

/// 实例状态
///
/// 状态转换由实例自己决定，注册中心不校验转换是否合法。
/// `NoResponse` 只由监控层在心跳停止时合成，后端不会写入。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ServiceStatus {
    #[serde(rename = "initializing")]
    Initializing,
    #[serde(rename = "ready")]
    Ready,
    #[serde(rename = "shutting_down")]
    ShuttingDown,
    #[serde(rename = "error")]
    Error,
    #[serde(rename = "terminated")]
    Terminated,
    #[serde(rename = "no-response")]
    NoResponse,
}

impl ServiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStatus::Initializing => "initializing",
            ServiceStatus::Ready => "ready",
            ServiceStatus::ShuttingDown => "shutting_down",
            ServiceStatus::Error => "error",
            ServiceStatus::Terminated => "terminated",
            ServiceStatus::NoResponse => "no-response",
        }
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "initializing" => Ok(ServiceStatus::Initializing),
            "ready" => Ok(ServiceStatus::Ready),
            "shutting_down" => Ok(ServiceStatus::ShuttingDown),
            "error" => Ok(ServiceStatus::Error),
            "terminated" => Ok(ServiceStatus::Terminated),
            "no-response" => Ok(ServiceStatus::NoResponse),
            _ => Err(format!("Unknown service status: {}", s)),
        }
    }
}

impl ServiceInstance {
    /// 创建新的服务实例（状态为 initializing，地址默认取 hostname）
    pub fn new(service_type: impl Into<String>, hostname: impl Into<String>) -> Self {
        let hostname = hostname.into();
        Self {
            instance_id: Self::generate_id(),
            service_type: service_type.into(),
            external_address: hostname.clone(),
            internal_address: hostname.clone(),
            hostname,
            ports: ServicePorts::default(),
            status: ServiceStatus::Initializing,
            updated_at: Utc::now(),
            instance_stats: None,
            meta: None,
        }
    }

    /// 生成时间有序的实例 ID（UUID v7，毫秒时间戳前缀）
    pub fn generate_id() -> String {
        Uuid::now_v7().to_string()
    }

    /// 设置实例 ID
    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = instance_id.into();
        self
    }

    /// 设置内外网地址
    pub fn with_addresses(
        mut self,
        external_address: impl Into<String>,
        internal_address: impl Into<String>,
    ) -> Self {
        self.external_address = external_address.into();
        self.internal_address = internal_address.into();
        self
    }

    pub fn with_tcp_port(mut self, port: u16) -> Self {
        self.ports.tcp.insert(port);
        self
    }

    pub fn with_udp_port(mut self, port: u16) -> Self {
        self.ports.udp.insert(port);
        self
    }

    pub fn with_http_port(mut self, port: u16) -> Self {
        self.ports.http.insert(port);
        self
    }

    pub fn with_status(mut self, status: ServiceStatus) -> Self {
        self.status = status;
        self
    }

    /// 添加自定义注解
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.meta
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value.into());
        self
    }

    /// 刷新 updatedAt
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// 存储键使用的 `type:id` 组合
    pub fn registry_key(&self) -> String {
        registry_key(&self.instance_id, &self.service_type)
    }

    /// 距离最后一次写入是否已经超过 `threshold`
    pub fn is_stale(&self, now: DateTime<Utc>, threshold: chrono::Duration) -> bool {
        now.signed_duration_since(self.updated_at) > threshold
    }

    /// Prometheus 采集端口（meta.metricsPort，数字或数字字符串）
    pub fn metrics_port(&self) -> Option<u16> {
        let value = self.meta.as_ref()?.get("metricsPort")?;
        match value {
            serde_json::Value::Number(n) => n.as_u64().and_then(|p| u16::try_from(p).ok()),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// meta 中的字符串注解
    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.meta.as_ref()?.get(key)?.as_str()
    }
}

/// 进程内使用的 `type:id` 键（心跳任务、租约缓存）
pub fn registry_key(instance_id: &str, service_type: &str) -> String {
    format!("{}:{}", service_type, instance_id)
}

/// 监听事件类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WatchEventType {
    Put,
    Delete,
}

impl WatchEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WatchEventType::Put => "put",
            WatchEventType::Delete => "delete",
        }
    }
}

/// 注册中心变更事件，线上格式为 `{"type": "put"|"delete", "instance": {...}}`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WatchEvent {
    #[serde(rename = "type")]
    pub event_type: WatchEventType,
    pub instance: ServiceInstance,
}

impl WatchEvent {
    pub fn put(instance: ServiceInstance) -> Self {
        Self {
            event_type: WatchEventType::Put,
            instance,
        }
    }

    pub fn delete(instance: ServiceInstance) -> Self {
        Self {
            event_type: WatchEventType::Delete,
            instance,
        }
    }
}
