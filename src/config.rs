//! 配置模块
//!
//! 启动时从 TOML 文件读取，再用环境变量覆盖；运行期间不热更新

use serde::{Deserialize, Serialize};

use crate::error::{DiscoveryError, Result};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_address")]
    pub address: String,
    #[serde(default = "default_server_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: default_server_address(),
            port: default_server_port(),
        }
    }
}

/// 服务发现配置
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DiscoveryConfig {
    /// 存储后端：redis（默认）或 etcd。保留原始字符串，由工厂解析
    #[serde(default = "default_mode")]
    pub mode: String,

    /// 默认 TTL（秒），register 传入 0 时使用
    #[serde(default = "default_ttl")]
    pub default_ttl: u64,

    /// 自动心跳的最长间隔（秒），同时不超过 unresponsive_after 的一半
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: u64,

    /// register 时是否启动内部自动心跳
    #[serde(default = "default_true")]
    pub auto_heartbeat: bool,

    /// updatedAt 超过该秒数视为无响应
    #[serde(default = "default_unresponsive_after")]
    pub unresponsive_after: u64,

    /// 清理任务执行间隔（秒）
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval: u64,

    /// SSE 在后端不推送过期事件时的重新同步间隔（秒）
    #[serde(default = "default_sse_resync_interval")]
    pub sse_resync_interval: u64,

    /// 清理任务选主名称（仅 etcd 模式）
    #[serde(default = "default_election_name")]
    pub election_name: String,

    #[serde(default)]
    pub redis: RedisConfig,

    #[serde(default)]
    pub etcd: EtcdConfig,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            default_ttl: default_ttl(),
            heartbeat_interval: default_heartbeat_interval(),
            auto_heartbeat: true,
            unresponsive_after: default_unresponsive_after(),
            cleanup_interval: default_cleanup_interval(),
            sse_resync_interval: default_sse_resync_interval(),
            election_name: default_election_name(),
            redis: RedisConfig::default(),
            etcd: EtcdConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_host")]
    pub host: String,
    #[serde(default = "default_redis_port")]
    pub port: u16,
    pub password: Option<String>,
    #[serde(default)]
    pub db: i64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: default_redis_host(),
            port: default_redis_port(),
            password: None,
            db: 0,
        }
    }
}

impl RedisConfig {
    /// 组装 redis 连接 URL
    pub fn url(&self) -> String {
        match self.password.as_deref().filter(|p| !p.is_empty()) {
            Some(password) => format!("redis://:{}@{}:{}/{}", password, self.host, self.port, self.db),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EtcdConfig {
    #[serde(default = "default_etcd_hosts")]
    pub hosts: Vec<String>,
}

impl Default for EtcdConfig {
    fn default() -> Self {
        Self {
            hosts: default_etcd_hosts(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// pretty 或 json
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_server_address() -> String {
    "0.0.0.0".to_string()
}

fn default_server_port() -> u16 {
    8080
}

fn default_mode() -> String {
    "redis".to_string()
}

fn default_ttl() -> u64 {
    30
}

fn default_heartbeat_interval() -> u64 {
    15
}

fn default_true() -> bool {
    true
}

fn default_unresponsive_after() -> u64 {
    60
}

fn default_cleanup_interval() -> u64 {
    30
}

fn default_sse_resync_interval() -> u64 {
    10
}

fn default_election_name() -> String {
    "discovery-cleanup".to_string()
}

fn default_redis_host() -> String {
    "127.0.0.1".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

fn default_etcd_hosts() -> Vec<String> {
    vec!["http://127.0.0.1:2379".to_string()]
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Config {
    pub fn load_from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| DiscoveryError::configuration(format!("invalid config: {e}")))
    }

    /// 用进程环境变量覆盖配置
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// 用给定的查找函数覆盖配置（便于测试）
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(mode) = lookup("DISCOVERY_MODE") {
            self.discovery.mode = mode;
        }
        if let Some(ttl) = lookup("DISCOVERY_TTL_SECONDS") {
            self.discovery.default_ttl = parse_env("DISCOVERY_TTL_SECONDS", &ttl)?;
        }
        if let Some(interval) = lookup("DISCOVERY_HEARTBEAT_INTERVAL") {
            self.discovery.heartbeat_interval = parse_env("DISCOVERY_HEARTBEAT_INTERVAL", &interval)?;
        }
        if let Some(host) = lookup("REDIS_HOST") {
            self.discovery.redis.host = host;
        }
        if let Some(port) = lookup("REDIS_PORT") {
            self.discovery.redis.port = parse_env("REDIS_PORT", &port)?;
        }
        if let Some(password) = lookup("REDIS_PASSWORD") {
            self.discovery.redis.password = Some(password);
        }
        if let Some(db) = lookup("REDIS_DB") {
            self.discovery.redis.db = parse_env("REDIS_DB", &db)?;
        }
        if let Some(hosts) = lookup("ETCD_HOSTS") {
            self.discovery.etcd.hosts = hosts
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(address) = lookup("SERVER_ADDRESS") {
            self.server.address = address;
        }
        if let Some(port) = lookup("SERVER_PORT") {
            self.server.port = parse_env("SERVER_PORT", &port)?;
        }
        if let Some(level) = lookup("LOG_LEVEL") {
            self.logging.level = level;
        }
        Ok(())
    }

    /// 监听地址
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.address, self.server.port)
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| DiscoveryError::configuration(format!("{key} has invalid value '{value}'")))
}
