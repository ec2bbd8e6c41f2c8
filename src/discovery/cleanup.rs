//! 无响应实例清理任务
//!
//! 只在领导者进程上运行：先通过 `DiscoveryProvider::campaign` 竞选，
//! 之后按固定间隔删除长时间未更新或已经 terminated 的实例。

use std::time::Duration;

use chrono::Utc;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use super::instance::{ServiceInstance, ServiceStatus};
use super::service::DiscoveryService;
use crate::config::DiscoveryConfig;
use crate::error::Result;
use crate::runtime::TaskResult;

/// 清理任务
pub struct CleanupJob {
    service: DiscoveryService,
    interval: Duration,
    unresponsive_after: chrono::Duration,
    election: String,
    candidate: String,
}

impl CleanupJob {
    pub fn new(service: DiscoveryService, config: &DiscoveryConfig, candidate: impl Into<String>) -> Self {
        Self {
            service,
            interval: Duration::from_secs(config.cleanup_interval.max(1)),
            unresponsive_after: chrono::Duration::seconds(config.unresponsive_after as i64),
            election: config.election_name.clone(),
            candidate: candidate.into(),
        }
    }

    /// 实例是否应被清理
    pub fn should_remove(&self, instance: &ServiceInstance, now: chrono::DateTime<Utc>) -> bool {
        instance.status == ServiceStatus::Terminated || instance.is_stale(now, self.unresponsive_after)
    }

    /// 执行一轮清理，返回删除的实例数
    ///
    /// 单个实例删除失败只记录日志，继续处理其他实例
    pub async fn sweep(&self) -> Result<usize> {
        let now = Utc::now();
        let instances = self.service.get_services(None).await?;

        let mut removed = 0;
        for instance in instances.iter().filter(|i| self.should_remove(i, now)) {
            match self
                .service
                .unregister(&instance.instance_id, &instance.service_type)
                .await
            {
                Ok(()) => {
                    removed += 1;
                    info!(
                        instance_id = %instance.instance_id,
                        service_type = %instance.service_type,
                        status = %instance.status,
                        updated_at = %instance.updated_at,
                        "Removed unresponsive instance"
                    );
                }
                Err(e) => {
                    warn!(
                        instance_id = %instance.instance_id,
                        service_type = %instance.service_type,
                        error = %e,
                        "Failed to remove unresponsive instance"
                    );
                }
            }
        }

        debug!(scanned = instances.len(), removed = removed, "Cleanup sweep finished");
        Ok(removed)
    }

    /// 竞选领导者后循环清理，直到收到关闭信号
    ///
    /// 领导权丢失时停止清理并重新竞选
    pub async fn run(self, mut shutdown_rx: oneshot::Receiver<()>) -> TaskResult {
        loop {
            info!(election = %self.election, candidate = %self.candidate, "Cleanup job waiting for leadership");

            let mut leadership = tokio::select! {
                result = self.service.provider().campaign(&self.election, &self.candidate) => result?,
                _ = &mut shutdown_rx => {
                    info!("Cleanup job stopped before acquiring leadership");
                    return Ok(());
                }
            };

            info!(interval_secs = self.interval.as_secs(), "Cleanup job started");
            let mut ticker = tokio::time::interval(self.interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.sweep().await {
                            error!(error = %e, "Cleanup sweep failed");
                        }
                    }
                    _ = leadership.lost() => {
                        warn!(election = %self.election, "Leadership lost, cleanup paused");
                        break;
                    }
                    _ = &mut shutdown_rx => {
                        info!("Cleanup job stopped");
                        return Ok(());
                    }
                }
            }
        }
    }
}
