//! 错误代码和错误类别定义

use serde::{Deserialize, Serialize};
use std::fmt;

/// 错误代码枚举
///
/// 错误代码按类别分组，每个类别占用1000个代码范围：
/// - 1000-1999: 后端连接相关错误
/// - 2000-2999: 注册中心相关错误
/// - 3000-3999: 配置相关错误
/// - 4000-4999: 序列化相关错误
/// - 9000-9999: 通用错误
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u32)]
pub enum ErrorCode {
    // ============================================================
    // 后端连接相关错误 (1000-1999)
    // ============================================================
    ConnectionFailed = 1000,
    ConnectionTimeout = 1001,
    ConnectionClosed = 1002,
    BackendUnavailable = 1003,

    // ============================================================
    // 注册中心相关错误 (2000-2999)
    // ============================================================
    InstanceNotFound = 2000,
    LeaseNotFound = 2001,
    WatchFailed = 2002,
    ElectionFailed = 2003,

    // ============================================================
    // 配置相关错误 (3000-3999)
    // ============================================================
    ConfigurationError = 3000,
    UnknownDiscoveryMode = 3001,
    MissingConnectionSetting = 3002,

    // ============================================================
    // 序列化相关错误 (4000-4999)
    // ============================================================
    SerializationError = 4000,
    DeserializationError = 4001,

    // ============================================================
    // 通用错误 (9000-9999)
    // ============================================================
    InternalError = 9000,
    InvalidParameter = 9001,
    OperationFailed = 9002,
    UnknownError = 9999,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl ErrorCode {
    /// 获取错误代码的数字值
    #[inline]
    pub fn as_u32(&self) -> u32 {
        *self as u32
    }

    /// 获取错误代码的英文标识符
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ErrorCode::ConnectionTimeout => "CONNECTION_TIMEOUT",
            ErrorCode::ConnectionClosed => "CONNECTION_CLOSED",
            ErrorCode::BackendUnavailable => "BACKEND_UNAVAILABLE",
            ErrorCode::InstanceNotFound => "INSTANCE_NOT_FOUND",
            ErrorCode::LeaseNotFound => "LEASE_NOT_FOUND",
            ErrorCode::WatchFailed => "WATCH_FAILED",
            ErrorCode::ElectionFailed => "ELECTION_FAILED",
            ErrorCode::ConfigurationError => "CONFIGURATION_ERROR",
            ErrorCode::UnknownDiscoveryMode => "UNKNOWN_DISCOVERY_MODE",
            ErrorCode::MissingConnectionSetting => "MISSING_CONNECTION_SETTING",
            ErrorCode::SerializationError => "SERIALIZATION_ERROR",
            ErrorCode::DeserializationError => "DESERIALIZATION_ERROR",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::InvalidParameter => "INVALID_PARAMETER",
            ErrorCode::OperationFailed => "OPERATION_FAILED",
            ErrorCode::UnknownError => "UNKNOWN_ERROR",
        }
    }

    /// 获取错误代码的类别
    pub fn category(&self) -> ErrorCategory {
        match self.as_u32() {
            1000..=1999 => ErrorCategory::Connection,
            2000..=2999 => ErrorCategory::Registry,
            3000..=3999 => ErrorCategory::Configuration,
            4000..=4999 => ErrorCategory::Serialization,
            _ => ErrorCategory::General,
        }
    }

    /// 判断是否为可重试的错误（后端暂时不可用）
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::ConnectionFailed
                | ErrorCode::ConnectionTimeout
                | ErrorCode::ConnectionClosed
                | ErrorCode::BackendUnavailable
        )
    }
}

/// 错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    Connection,
    Registry,
    Configuration,
    Serialization,
    General,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Connection => write!(f, "CONNECTION"),
            ErrorCategory::Registry => write!(f, "REGISTRY"),
            ErrorCategory::Configuration => write!(f, "CONFIGURATION"),
            ErrorCategory::Serialization => write!(f, "SERIALIZATION"),
            ErrorCategory::General => write!(f, "GENERAL"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories_follow_code_ranges() {
        assert_eq!(ErrorCode::BackendUnavailable.category(), ErrorCategory::Connection);
        assert_eq!(ErrorCode::InstanceNotFound.category(), ErrorCategory::Registry);
        assert_eq!(ErrorCode::UnknownDiscoveryMode.category(), ErrorCategory::Configuration);
        assert_eq!(ErrorCode::DeserializationError.category(), ErrorCategory::Serialization);
        assert_eq!(ErrorCode::UnknownError.category(), ErrorCategory::General);
    }

    #[test]
    fn only_connection_errors_are_retryable() {
        assert!(ErrorCode::ConnectionTimeout.is_retryable());
        assert!(!ErrorCode::InstanceNotFound.is_retryable());
        assert!(!ErrorCode::ConfigurationError.is_retryable());
    }
}
