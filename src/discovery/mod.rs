//! 服务发现模块
//!
//! 游戏服务器通过 `DiscoveryProvider` 注册、心跳、注销；
//! 管理后台通过 `DiscoveryService` 读取、监听和强制清理。
//! 存储后端（Redis 或 etcd）由 `ProviderFactory` 按配置选择。

pub mod cleanup;
pub mod factory;
pub mod instance;
pub mod provider;
pub mod service;
pub mod watch;

pub use cleanup::CleanupJob;
pub use factory::{ProviderFactory, ProviderMode};
pub use instance::{
    InstanceStats, ServiceInstance, ServicePorts, ServiceStatus, WatchEvent, WatchEventType,
};
pub use provider::{
    DiscoveryProvider, EtcdProvider, Leadership, RedisProvider, RegistrationSettings,
    heartbeat_period,
};
pub use service::{DiscoveryService, ServiceStats};
pub use watch::{CallbackResult, WatchCallback, WatchHub, WatchId};
