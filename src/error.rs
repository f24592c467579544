use thiserror::Error;

use crate::domain::message::ServerFrame;

/// 统一的枢纽错误类型 / Unified hub error type
#[derive(Error, Debug)]
pub enum HubError {
    #[error("认证失败 / authentication failed: {message}")]
    Auth { message: String },

    #[error("验证错误 / validation failed: {field}: {message}")]
    Validation { field: String, message: String },

    #[error("请求过于频繁 / rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("房间不存在 / room not found: {room_id}")]
    RoomNotFound { room_id: String },

    #[error("房间已满 / room is full: {room_id}")]
    RoomFull { room_id: String },

    #[error("权限错误 / permission denied: {message}")]
    PermissionDenied { message: String },

    #[error("房间名称重复 / duplicate room name: {name}")]
    DuplicateName { name: String },

    #[error("房间参数无效 / invalid room spec: {message}")]
    InvalidSpec { message: String },

    #[error("连接数已达上限 / connection capacity exceeded ({limit})")]
    CapacityExceeded { limit: usize },

    #[error("存储不可用 / store unavailable: {store}: {message}")]
    StoreUnavailable { store: String, message: String },

    #[error("集群广播不可用 / fan-out unavailable: {message}")]
    FanOutUnavailable { message: String },

    #[error("投递失败 / delivery failed: {message}")]
    DeliveryFailed { message: String },

    #[error("内部错误 / internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl HubError {
    pub fn auth<T: Into<String>>(message: T) -> Self {
        Self::Auth { message: message.into() }
    }

    pub fn validation<T: Into<String>, U: Into<String>>(field: T, message: U) -> Self {
        Self::Validation { field: field.into(), message: message.into() }
    }

    pub fn room_not_found<T: Into<String>>(room_id: T) -> Self {
        Self::RoomNotFound { room_id: room_id.into() }
    }

    pub fn permission<T: Into<String>>(message: T) -> Self {
        Self::PermissionDenied { message: message.into() }
    }

    pub fn invalid_spec<T: Into<String>>(message: T) -> Self {
        Self::InvalidSpec { message: message.into() }
    }

    pub fn store_unavailable<T: Into<String>, U: Into<String>>(store: T, message: U) -> Self {
        Self::StoreUnavailable { store: store.into(), message: message.into() }
    }

    pub fn fan_out<T: Into<String>>(message: T) -> Self {
        Self::FanOutUnavailable { message: message.into() }
    }

    /// 获取错误代码 / Numeric error code
    pub fn error_code(&self) -> i32 {
        match self {
            HubError::Auth { .. } => 1002,
            HubError::PermissionDenied { .. } => 1003,
            HubError::Validation { .. } => 1004,
            HubError::RateLimited { .. } => 1005,
            HubError::RoomNotFound { .. } => 1009,
            HubError::RoomFull { .. } => 1010,
            HubError::DuplicateName { .. } => 1011,
            HubError::InvalidSpec { .. } => 1012,
            HubError::CapacityExceeded { .. } => 1013,
            HubError::StoreUnavailable { .. } => 1006,
            HubError::FanOutUnavailable { .. } => 1007,
            HubError::DeliveryFailed { .. } => 1008,
            HubError::Internal(_) => 1000,
        }
    }

    /// 线上协议中的错误类型 / Error type string used on the wire
    pub fn kind(&self) -> &'static str {
        match self {
            HubError::Auth { .. } => "auth_error",
            HubError::Validation { .. } => "validation_error",
            HubError::RateLimited { .. } => "rate_limited",
            HubError::RoomNotFound { .. } => "room_not_found",
            HubError::RoomFull { .. } => "room_full",
            HubError::PermissionDenied { .. } => "permission_denied",
            HubError::DuplicateName { .. } => "duplicate_name",
            HubError::InvalidSpec { .. } => "invalid_spec",
            HubError::CapacityExceeded { .. } => "capacity_exceeded",
            HubError::StoreUnavailable { .. } => "store_unavailable",
            HubError::FanOutUnavailable { .. } => "fan_out_unavailable",
            HubError::DeliveryFailed { .. } => "delivery_failed",
            HubError::Internal(_) => "internal_error",
        }
    }

    /// 存储类错误可重试 / Store outages are the only retryable errors
    pub fn is_retryable(&self) -> bool {
        matches!(self, HubError::StoreUnavailable { .. })
    }

    /// 转为发给客户端的错误帧 / Convert into the error frame sent to the client
    pub fn to_frame(&self) -> ServerFrame {
        let retry_after_ms = match self {
            HubError::RateLimited { retry_after_ms } => Some(*retry_after_ms),
            _ => None,
        };
        match self {
            HubError::Internal(_) => tracing::error!("Internal error: {}", self),
            HubError::StoreUnavailable { .. }
            | HubError::FanOutUnavailable { .. }
            | HubError::DeliveryFailed { .. } => tracing::warn!("Degraded operation: {}", self),
            _ => tracing::debug!("Client error: {}", self),
        }
        ServerFrame::Error {
            error_type: self.kind().to_string(),
            message: self.to_string(),
            retry_after_ms,
        }
    }
}

/// 枢纽结果类型 / Hub result type
pub type HubResult<T> = Result<T, HubError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limited_frame_carries_retry_after() {
        let frame = HubError::RateLimited { retry_after_ms: 250 }.to_frame();
        match frame {
            ServerFrame::Error { error_type, retry_after_ms, .. } => {
                assert_eq!(error_type, "rate_limited");
                assert_eq!(retry_after_ms, Some(250));
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn only_store_errors_are_retryable() {
        assert!(HubError::store_unavailable("rooms", "down").is_retryable());
        assert!(!HubError::fan_out("down").is_retryable());
        assert!(!HubError::auth("bad").is_retryable());
    }
}
