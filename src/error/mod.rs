//! 服务发现错误处理模块
//!
//! 提供统一的错误代码分类和后端错误转换

pub mod builder;
pub mod code;
pub mod conversions;
pub mod discovery_error;

pub use builder::ErrorBuilder;
pub use code::{ErrorCategory, ErrorCode};
pub use discovery_error::{DiscoveryError, Result};

/// 将任意可显示的错误转换为 `DiscoveryError`
pub fn map_backend_error<E, S>(error: E, code: ErrorCode, message: S) -> DiscoveryError
where
    E: std::fmt::Display,
    S: Into<String>,
{
    ErrorBuilder::new(code, message.into())
        .details(error.to_string())
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_carries_key_params() {
        let err = DiscoveryError::not_found("01J0", "chat");
        assert!(err.is_not_found());
        match err {
            DiscoveryError::Coded { params, .. } => {
                let params = params.unwrap();
                assert_eq!(params["instance_id"], "01J0");
                assert_eq!(params["service_type"], "chat");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn map_backend_error_keeps_details() {
        let err = map_backend_error("socket closed", ErrorCode::ConnectionClosed, "lost redis");
        assert_eq!(err.code(), Some(ErrorCode::ConnectionClosed));
        assert_eq!(err.reason(), "lost redis");
    }
}
