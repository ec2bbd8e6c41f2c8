//! GameOps Service Discovery
//!
//! Game servers register, heartbeat and expire through a pluggable registry
//! (Redis or etcd). The admin side reads it, watches it over Server-Sent Events
//! and exposes it to Prometheus via HTTP service discovery.

pub mod config;
pub mod discovery;
pub mod error;
pub mod http;
pub mod metrics;
pub mod runtime;
pub mod telemetry;

// Re-exports
pub use config::{Config, DiscoveryConfig, EtcdConfig, LoggingConfig, RedisConfig, ServerConfig};
pub use discovery::{
    CleanupJob, DiscoveryProvider, DiscoveryService, InstanceStats, ProviderFactory, ProviderMode,
    ServiceInstance, ServicePorts, ServiceStats, ServiceStatus, WatchCallback, WatchEvent,
    WatchEventType, WatchId,
};
pub use error::{DiscoveryError, ErrorBuilder, ErrorCategory, ErrorCode, Result};
pub use runtime::{ServiceRuntime, SpawnTask, Task, TaskResult};
