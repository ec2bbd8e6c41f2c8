//! 错误到 HTTP 响应的映射

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tracing::error;

use crate::error::{DiscoveryError, ErrorCategory, ErrorCode};

/// 错误响应体
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

/// 错误码对应的 HTTP 状态
pub fn status_for(error: &DiscoveryError) -> StatusCode {
    match error.code() {
        Some(ErrorCode::InstanceNotFound) => StatusCode::NOT_FOUND,
        Some(ErrorCode::InvalidParameter) => StatusCode::BAD_REQUEST,
        Some(code) if code.category() == ErrorCategory::Connection => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for DiscoveryError {
    fn into_response(self) -> Response {
        let status = status_for(&self);
        if status.is_server_error() {
            error!(error = %self, status = status.as_u16(), "Request failed");
        }

        let code = self
            .code()
            .map(|c| c.as_str())
            .unwrap_or(ErrorCode::InternalError.as_str());
        let body = ErrorBody {
            code: code.to_string(),
            message: self.reason().to_string(),
        };
        (status, Json(body)).into_response()
    }
}
