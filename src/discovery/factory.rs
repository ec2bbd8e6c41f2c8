//! 服务发现后端工厂
//!
//! 根据配置选择 Redis 或 etcd 后端，进程内只创建一个实例并缓存。
//! 这是唯一按模式分支的地方，其余代码只看到 `DiscoveryProvider`。

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::DiscoveryConfig;
use crate::discovery::provider::{
    DiscoveryProvider, EtcdProvider, RedisProvider, RegistrationSettings,
};
use crate::error::{DiscoveryError, Result};

/// 存储后端模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderMode {
    Redis,
    Etcd,
}

impl ProviderMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderMode::Redis => "redis",
            ProviderMode::Etcd => "etcd",
        }
    }
}

impl fmt::Display for ProviderMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderMode {
    type Err = DiscoveryError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "redis" => Ok(ProviderMode::Redis),
            "etcd" => Ok(ProviderMode::Etcd),
            _ => Err(DiscoveryError::unknown_mode(s)),
        }
    }
}

/// 后端工厂
///
/// 由组合根持有；`get_instance` 首次调用时连接后端，之后返回同一个实例。
/// `close` 关闭并丢弃缓存的实例，下一次 `get_instance` 会重新连接。
pub struct ProviderFactory {
    mode: ProviderMode,
    config: DiscoveryConfig,
    instance: Mutex<Option<Arc<dyn DiscoveryProvider>>>,
}

impl ProviderFactory {
    /// 校验配置并创建工厂
    ///
    /// 未知模式、etcd 模式下没有配置地址都会立即失败
    pub fn new(config: DiscoveryConfig) -> Result<Self> {
        let mode: ProviderMode = config.mode.parse()?;
        if mode == ProviderMode::Etcd && config.etcd.hosts.iter().all(|h| h.trim().is_empty()) {
            return Err(DiscoveryError::missing_setting("ETCD_HOSTS"));
        }
        Ok(Self {
            mode,
            config,
            instance: Mutex::new(None),
        })
    }

    pub fn mode(&self) -> ProviderMode {
        self.mode
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// 获取（必要时创建）后端实例
    pub async fn get_instance(&self) -> Result<Arc<dyn DiscoveryProvider>> {
        let mut slot = self.instance.lock().await;
        if let Some(provider) = slot.as_ref() {
            return Ok(provider.clone());
        }

        let settings = RegistrationSettings::from_config(&self.config);
        let provider: Arc<dyn DiscoveryProvider> = match self.mode {
            ProviderMode::Redis => Arc::new(RedisProvider::connect(&self.config.redis, settings).await?),
            ProviderMode::Etcd => Arc::new(EtcdProvider::connect(&self.config.etcd, settings).await?),
        };

        info!(mode = %self.mode, "Discovery provider created");
        *slot = Some(provider.clone());
        Ok(provider)
    }

    /// 关闭缓存的后端实例
    pub async fn close(&self) -> Result<()> {
        let provider = self.instance.lock().await.take();
        match provider {
            Some(provider) => {
                provider.close().await?;
                info!(mode = %self.mode, "Discovery provider closed");
            }
            None => warn!(mode = %self.mode, "Discovery provider close requested but none created"),
        }
        Ok(())
    }
}
