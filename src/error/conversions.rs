//! 错误类型转换实现
//!
//! 后端客户端错误统一映射为 `DiscoveryError`

use super::{DiscoveryError, ErrorBuilder, ErrorCode};
use std::io;

impl From<io::Error> for DiscoveryError {
    fn from(err: io::Error) -> Self {
        DiscoveryError::io(err.to_string())
    }
}

impl From<serde_json::Error> for DiscoveryError {
    fn from(err: serde_json::Error) -> Self {
        let code = if err.is_data() || err.is_syntax() || err.is_eof() {
            ErrorCode::DeserializationError
        } else {
            ErrorCode::SerializationError
        };
        ErrorBuilder::new(code, "JSON 编解码错误")
            .details(err.to_string())
            .build()
    }
}

impl From<redis::RedisError> for DiscoveryError {
    fn from(err: redis::RedisError) -> Self {
        let code = if err.is_timeout() {
            ErrorCode::ConnectionTimeout
        } else if err.is_connection_dropped() || err.is_connection_refusal() || err.is_io_error() {
            ErrorCode::ConnectionFailed
        } else {
            ErrorCode::BackendUnavailable
        };
        ErrorBuilder::new(code, "redis operation failed")
            .details(err.to_string())
            .param("backend", "redis")
            .build()
    }
}

impl From<etcd_client::Error> for DiscoveryError {
    fn from(err: etcd_client::Error) -> Self {
        let code = match &err {
            etcd_client::Error::InvalidArgs(_) => ErrorCode::InvalidParameter,
            etcd_client::Error::LeaseKeepAliveError(_) => ErrorCode::LeaseNotFound,
            etcd_client::Error::WatchError(_) => ErrorCode::WatchFailed,
            _ => ErrorCode::BackendUnavailable,
        };
        ErrorBuilder::new(code, "etcd operation failed")
            .details(err.to_string())
            .param("backend", "etcd")
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_syntax_errors_map_to_deserialization() {
        let err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: DiscoveryError = err.into();
        assert_eq!(err.code(), Some(ErrorCode::DeserializationError));
    }

    #[test]
    fn io_errors_keep_message() {
        let err: DiscoveryError = io::Error::new(io::ErrorKind::Other, "disk gone").into();
        assert!(err.reason().contains("disk gone"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn redis_io_errors_are_retryable() {
        let err: DiscoveryError =
            redis::RedisError::from(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"))
                .into();
        assert!(err.is_retryable());
    }
}
