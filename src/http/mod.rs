//! 管理后台 HTTP 接口
//!
//! REST 查询和强制注销、SSE 变更推送、Prometheus HTTP-SD、健康检查与指标

pub mod error;
pub mod handlers;
pub mod prometheus;
pub mod sse;

use std::time::Duration;

use axum::Router;
use axum::routing::get;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::DiscoveryConfig;
use crate::discovery::DiscoveryService;
use crate::error::Result;
use crate::metrics::RegistryMetrics;

/// 处理器共享状态
#[derive(Clone)]
pub struct AppState {
    pub discovery: DiscoveryService,
    pub metrics: RegistryMetrics,
    /// updatedAt 超过该时长的实例显示为 no-response
    pub unresponsive_after: chrono::Duration,
    /// SSE 快照比对间隔（后端不推送过期事件时）
    pub sse_resync_interval: Duration,
}

impl AppState {
    pub fn new(discovery: DiscoveryService, config: &DiscoveryConfig) -> Result<Self> {
        Ok(Self {
            discovery,
            metrics: RegistryMetrics::new()?,
            unresponsive_after: chrono::Duration::seconds(config.unresponsive_after as i64),
            sse_resync_interval: Duration::from_secs(config.sse_resync_interval.max(1)),
        })
    }
}

/// 创建路由
pub fn create_router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/services", get(handlers::list_services))
        .route("/services/types", get(handlers::list_service_types))
        .route("/services/stats", get(handlers::service_stats))
        .route("/services/events", get(sse::stream_events))
        .route(
            "/services/{type}/{id}",
            get(handlers::get_service).delete(handlers::delete_service),
        )
        .route("/prometheus/targets", get(handlers::prometheus_targets));

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics))
        .nest("/api/v1", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// 在 `listener` 上提供服务，直到收到关闭信号
pub async fn serve(
    listener: TcpListener,
    router: Router,
    shutdown_rx: oneshot::Receiver<()>,
) -> std::io::Result<()> {
    let local_addr = listener.local_addr()?;
    info!(address = %local_addr, "HTTP server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.await;
            info!("HTTP server shutting down");
        })
        .await
}
