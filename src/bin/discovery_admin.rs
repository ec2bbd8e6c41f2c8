//! 服务发现管理后台
//!
//! 用法：`discovery-admin [config.toml]`，未指定时读取 `DISCOVERY_CONFIG`，
//! 都没有则使用默认配置；环境变量最后覆盖

use std::path::Path;

use anyhow::{Context, Result};
use gameops_discovery::config::Config;
use gameops_discovery::discovery::{CleanupJob, DiscoveryService, ProviderFactory};
use gameops_discovery::http::{self, AppState};
use gameops_discovery::runtime::{RuntimeConfig, ServiceRuntime, TaskResult};
use gameops_discovery::telemetry;
use tokio::net::TcpListener;
use tracing::{info, warn};

fn load_config() -> Result<Config> {
    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("DISCOVERY_CONFIG").ok());

    let mut config = match path {
        Some(path) if Path::new(&path).exists() => Config::load_from_file(&path)
            .with_context(|| format!("failed to load config from {path}"))?,
        Some(path) => anyhow::bail!("config file {path} does not exist"),
        None => Config::default(),
    };
    config
        .apply_env_overrides()
        .context("invalid environment override")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = load_config()?;
    telemetry::init_tracing(&config.logging);

    let factory = ProviderFactory::new(config.discovery.clone())?;
    let provider = factory.get_instance().await?;
    let discovery = DiscoveryService::new(provider);

    info!(
        mode = %factory.mode(),
        default_ttl = config.discovery.default_ttl,
        heartbeat_interval = config.discovery.heartbeat_interval,
        "Service discovery ready"
    );

    let listen_addr = config.listen_addr();
    let listener = TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("failed to bind {listen_addr}"))?;
    let router = http::create_router(AppState::new(discovery.clone(), &config.discovery)?);

    let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "discovery-admin".to_string());
    let candidate = format!("{}-{}", hostname, uuid::Uuid::new_v4());
    let cleanup = CleanupJob::new(discovery, &config.discovery, candidate);

    ServiceRuntime::new("discovery-admin")
        .with_config(RuntimeConfig::new())
        .add_spawn_with_shutdown("http", move |shutdown_rx| async move {
            http::serve(listener, router, shutdown_rx).await?;
            TaskResult::Ok(())
        })
        .add_spawn_with_shutdown("cleanup", move |shutdown_rx| cleanup.run(shutdown_rx))
        .run()
        .await?;

    if let Err(e) = factory.close().await {
        warn!(error = %e, "Failed to close discovery provider");
    }
    Ok(())
}
