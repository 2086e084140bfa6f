//! 服务层错误类型

use std::time::Duration;

use meca_driver::DriverError;
use meca_tools::ConfigError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::OperationState;

/// 服务层错误
#[derive(Error, Debug)]
pub enum ClientError {
    /// 机械臂已被其他持有者锁定
    #[error("Robot {robot_id} is locked by {holder} ({remaining:?} remaining)")]
    LockHeld {
        robot_id: String,
        holder: String,
        remaining: Duration,
    },

    /// 租约已过期（需要重新获取）
    #[error("Lease of {holder} on robot {robot_id} has expired")]
    LeaseExpired { robot_id: String, holder: String },

    /// 调用方不是当前租约持有者
    #[error("{holder} does not hold the lease on robot {robot_id}")]
    NotLeaseHolder { robot_id: String, holder: String },

    /// 熔断器断开
    #[error("Circuit {name} is open (retry in {retry_in:?})")]
    CircuitOpen { name: String, retry_in: Duration },

    /// 硬件拒绝激活/回零，或尚未确认激活
    #[error("Activation failed on robot {robot_id}: {reason}")]
    Activation {
        robot_id: String,
        code: Option<u16>,
        reason: String,
    },

    /// 控制器报告的运行错误
    #[error("Hardware error during {command}: [{code}] {message}")]
    Hardware {
        command: String,
        code: u16,
        message: String,
    },

    /// 命令执行中连接断开，结果未知
    #[error("Connection lost during {command}: {reason} (outcome unknown)")]
    ConnectionLost { command: String, reason: String },

    /// 急停状态（必须显式解除）
    #[error("Robot {0} is emergency stopped")]
    EmergencyStopped(String),

    /// 状态比较交换失败
    #[error("Robot {robot_id} cannot go from {actual:?} to {target:?}")]
    InvalidTransition {
        robot_id: String,
        actual: Option<OperationState>,
        target: OperationState,
    },

    #[error("Robot {0} is not connected")]
    NotConnected(String),

    #[error("Unknown robot: {0}")]
    UnknownRobot(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// 其余驱动层错误（传输、协议、超时）
    #[error(transparent)]
    Driver(DriverError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl From<DriverError> for ClientError {
    fn from(err: DriverError) -> Self {
        match err {
            DriverError::Rejected {
                command,
                code,
                message,
            } => ClientError::Hardware {
                command,
                code,
                message,
            },
            DriverError::ConnectionLost { command, reason } => {
                ClientError::ConnectionLost { command, reason }
            },
            DriverError::InvalidInput(message) => ClientError::InvalidInput(message),
            other => ClientError::Driver(other),
        }
    }
}

impl ClientError {
    /// 瞬时错误（可以稍后重试）
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::LockHeld { .. } | ClientError::CircuitOpen { .. } => true,
            ClientError::Driver(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// 与连接相关的失败（计入熔断器）
    pub fn is_connection_failure(&self) -> bool {
        match self {
            ClientError::ConnectionLost { .. } => true,
            ClientError::Driver(e) => e.is_connection_failure(),
            _ => false,
        }
    }

    /// 物理结果未知（调用方必须先查询状态）
    pub fn outcome_unknown(&self) -> bool {
        match self {
            ClientError::ConnectionLost { .. } => true,
            ClientError::Driver(e) => e.outcome_unknown() || matches!(e, DriverError::Transport(_)),
            _ => false,
        }
    }

    /// 调用前置条件不满足（未触碰硬件）
    pub fn is_guard_rejection(&self) -> bool {
        matches!(
            self,
            ClientError::LockHeld { .. }
                | ClientError::LeaseExpired { .. }
                | ClientError::NotLeaseHolder { .. }
                | ClientError::CircuitOpen { .. }
                | ClientError::EmergencyStopped(_)
                | ClientError::InvalidTransition { .. }
                | ClientError::NotConnected(_)
                | ClientError::UnknownRobot(_)
                | ClientError::InvalidInput(_)
        )
    }

    /// 控制器错误码
    pub fn controller_code(&self) -> Option<u16> {
        match self {
            ClientError::Hardware { code, .. } => Some(*code),
            ClientError::Activation { code, .. } => *code,
            ClientError::Driver(e) => e.controller_code(),
            _ => None,
        }
    }

    /// 稳定的错误类别名（供外层 API 使用）
    pub fn kind(&self) -> &'static str {
        match self {
            ClientError::LockHeld { .. } => "lock_held",
            ClientError::LeaseExpired { .. } => "lease_expired",
            ClientError::NotLeaseHolder { .. } => "permission_denied",
            ClientError::CircuitOpen { .. } => "circuit_open",
            ClientError::Activation { .. } => "activation_error",
            ClientError::Hardware { .. } => "hardware_error",
            ClientError::ConnectionLost { .. } => "connection_lost",
            ClientError::EmergencyStopped(_) => "emergency_stopped",
            ClientError::InvalidTransition { .. } => "invalid_state",
            ClientError::NotConnected(_) => "not_connected",
            ClientError::UnknownRobot(_) => "unknown_robot",
            ClientError::InvalidInput(_) => "invalid_input",
            ClientError::Driver(DriverError::Protocol(_)) => "protocol_error",
            ClientError::Driver(DriverError::Timeout { .. }) => "timeout",
            ClientError::Driver(_) => "transport_error",
            ClientError::Config(_) => "config_error",
        }
    }
}

/// 外层 API 的错误描述
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct ApiError {
    pub kind: String,
    pub message: String,
}

impl ApiError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl From<&ClientError> for ApiError {
    fn from(err: &ClientError) -> Self {
        ApiError::new(err.kind(), err.to_string())
    }
}

impl From<ClientError> for ApiError {
    fn from(err: ClientError) -> Self {
        ApiError::from(&err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meca_protocol::codes;

    #[test]
    fn test_rejection_becomes_hardware_error() {
        let err: ClientError = DriverError::Rejected {
            command: "MovePose".to_string(),
            code: codes::MOTION_FAILED,
            message: "Motion failed.".to_string(),
        }
        .into();

        assert!(matches!(err, ClientError::Hardware { code: 1016, .. }));
        assert_eq!(err.controller_code(), Some(1016));
        assert_eq!(err.kind(), "hardware_error");
        assert!(!err.is_connection_failure());
        assert!(!err.outcome_unknown());
        assert_eq!(err.to_string(), "Hardware error during MovePose: [1016] Motion failed.");
    }

    #[test]
    fn test_connection_lost_is_ambiguous() {
        let err: ClientError = DriverError::ConnectionLost {
            command: "MovePose".to_string(),
            reason: "reset by peer".to_string(),
        }
        .into();

        assert!(err.is_connection_failure());
        assert!(err.outcome_unknown());
        assert_eq!(err.kind(), "connection_lost");
    }

    #[test]
    fn test_timeout_classification() {
        let err: ClientError = DriverError::Timeout {
            command: "GetStatusRobot".to_string(),
            timeout: Duration::from_secs(1),
        }
        .into();

        assert!(err.is_retryable());
        assert!(err.is_connection_failure());
        assert!(err.outcome_unknown());
        assert_eq!(err.kind(), "timeout");
    }

    #[test]
    fn test_guard_rejections() {
        let err = ClientError::NotLeaseHolder {
            robot_id: "meca".to_string(),
            holder: "clientB".to_string(),
        };
        assert!(err.is_guard_rejection());
        assert_eq!(err.kind(), "permission_denied");

        let err = ClientError::CircuitOpen {
            name: "meca/command".to_string(),
            retry_in: Duration::from_secs(5),
        };
        assert!(err.is_guard_rejection());
        assert!(err.is_retryable());
    }

    #[test]
    fn test_api_error_from_client_error() {
        let err = ClientError::EmergencyStopped("meca".to_string());
        let api = ApiError::from(&err);
        assert_eq!(api.kind, "emergency_stopped");
        assert_eq!(api.message, "Robot meca is emergency stopped");
    }
}
