//! 管理后台 REST 处理器

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};

use super::AppState;
use super::prometheus::{TargetGroup, target_groups};
use crate::discovery::{DiscoveryService, ServiceInstance, ServiceStats};
use crate::error::{DiscoveryError, Result};

/// `?type=` 过滤参数
#[derive(Debug, Default, Deserialize)]
pub struct TypeQuery {
    #[serde(rename = "type")]
    pub service_type: Option<String>,
}

impl TypeQuery {
    fn filter(&self) -> Option<&str> {
        self.service_type.as_deref().filter(|t| !t.is_empty())
    }
}

/// 健康检查
pub async fn health_check() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// 列出实例
pub async fn list_services(
    State(state): State<AppState>,
    Query(query): Query<TypeQuery>,
) -> Result<Json<Vec<ServiceInstance>>> {
    let instances = state.discovery.get_services(query.filter()).await?;
    Ok(Json(DiscoveryService::annotate_unresponsive(
        instances,
        Utc::now(),
        state.unresponsive_after,
    )))
}

pub async fn list_service_types(State(state): State<AppState>) -> Result<Json<Vec<String>>> {
    Ok(Json(state.discovery.get_service_types().await?))
}

pub async fn service_stats(State(state): State<AppState>) -> Result<Json<ServiceStats>> {
    Ok(Json(state.discovery.get_service_stats().await?))
}

/// 查询单个实例
pub async fn get_service(
    State(state): State<AppState>,
    Path((service_type, instance_id)): Path<(String, String)>,
) -> Result<Json<ServiceInstance>> {
    let instance = state
        .discovery
        .get_service(&instance_id, &service_type)
        .await?
        .ok_or_else(|| DiscoveryError::not_found(&instance_id, &service_type))?;

    let mut labelled =
        DiscoveryService::annotate_unresponsive(vec![instance], Utc::now(), state.unresponsive_after);
    labelled
        .pop()
        .map(Json)
        .ok_or_else(|| DiscoveryError::not_found(instance_id, service_type))
}

/// 强制注销
pub async fn delete_service(
    State(state): State<AppState>,
    Path((service_type, instance_id)): Path<(String, String)>,
) -> Result<StatusCode> {
    state.discovery.unregister(&instance_id, &service_type).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Prometheus HTTP-SD 目标
pub async fn prometheus_targets(
    State(state): State<AppState>,
    Query(query): Query<TypeQuery>,
) -> Result<Json<Vec<TargetGroup>>> {
    let instances = state.discovery.get_services(query.filter()).await?;
    Ok(Json(target_groups(&instances)))
}

/// Prometheus 指标
pub async fn metrics(State(state): State<AppState>) -> Result<Response> {
    let instances = state.discovery.get_services(None).await?;
    state.metrics.observe(&instances);
    let body = state.metrics.export()?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
        .into_response())
}
