//! 服务发现统一错误类型

use super::code::ErrorCode;
use std::collections::HashMap;
use thiserror::Error;

/// 服务发现统一错误类型
#[derive(Error, Debug, Clone)]
pub enum DiscoveryError {
    /// 带错误代码的错误（可以暴露给管理后台）
    #[error("错误 [{code}] {reason}", code = .code.as_str())]
    Coded {
        code: ErrorCode,
        reason: String,
        details: Option<String>,
        params: Option<HashMap<String, String>>,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// 系统错误（内部错误，不暴露细节）
    #[error("系统错误: {0}")]
    System(String),

    /// IO 错误
    #[error("IO 错误: {0}")]
    Io(String),
}

impl DiscoveryError {
    /// 创建带错误代码的错误
    pub fn coded(code: ErrorCode, reason: impl Into<String>) -> Self {
        DiscoveryError::Coded {
            code,
            reason: reason.into(),
            details: None,
            params: None,
            timestamp: chrono::Utc::now(),
        }
    }

    /// 创建系统错误
    pub fn system(msg: impl Into<String>) -> Self {
        DiscoveryError::System(msg.into())
    }

    /// 创建 IO 错误
    pub fn io(msg: impl Into<String>) -> Self {
        DiscoveryError::Io(msg.into())
    }

    /// 后端（Redis / etcd）暂时不可用
    pub fn backend_unavailable(reason: impl Into<String>) -> Self {
        Self::coded(ErrorCode::BackendUnavailable, reason)
    }

    /// 实例不存在
    pub fn not_found(instance_id: impl Into<String>, service_type: impl Into<String>) -> Self {
        let instance_id = instance_id.into();
        let service_type = service_type.into();
        let mut params = HashMap::new();
        params.insert("instance_id".to_string(), instance_id.clone());
        params.insert("service_type".to_string(), service_type.clone());
        DiscoveryError::Coded {
            code: ErrorCode::InstanceNotFound,
            reason: format!("service instance {service_type}/{instance_id} not found"),
            details: None,
            params: Some(params),
            timestamp: chrono::Utc::now(),
        }
    }

    /// 配置错误
    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::coded(ErrorCode::ConfigurationError, reason)
    }

    /// 未知的服务发现模式
    pub fn unknown_mode(mode: impl Into<String>) -> Self {
        let mode = mode.into();
        Self::coded(
            ErrorCode::UnknownDiscoveryMode,
            format!("unknown discovery mode '{mode}', expected 'redis' or 'etcd'"),
        )
    }

    /// 缺少必需的连接配置
    pub fn missing_setting(setting: impl Into<String>) -> Self {
        Self::coded(
            ErrorCode::MissingConnectionSetting,
            format!("missing required connection setting: {}", setting.into()),
        )
    }

    /// 序列化错误
    pub fn serialization_error(reason: impl Into<String>) -> Self {
        Self::coded(ErrorCode::SerializationError, reason)
    }

    /// 反序列化错误
    pub fn deserialization_error(reason: impl Into<String>) -> Self {
        Self::coded(ErrorCode::DeserializationError, reason)
    }

    /// 参数错误
    pub fn invalid_parameter(reason: impl Into<String>) -> Self {
        Self::coded(ErrorCode::InvalidParameter, reason)
    }

    /// 获取错误代码
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            DiscoveryError::Coded { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// 获取错误原因
    pub fn reason(&self) -> &str {
        match self {
            DiscoveryError::Coded { reason, .. } => reason,
            DiscoveryError::System(msg) => msg,
            DiscoveryError::Io(msg) => msg,
        }
    }

    /// 是否为"实例不存在"
    pub fn is_not_found(&self) -> bool {
        self.code() == Some(ErrorCode::InstanceNotFound)
    }

    /// 判断是否为可重试的错误
    pub fn is_retryable(&self) -> bool {
        self.code().map(|code| code.is_retryable()).unwrap_or(false)
    }
}

/// 结果类型别名
pub type Result<T> = std::result::Result<T, DiscoveryError>;
