//! 驱动层错误类型定义

use std::time::Duration;

use meca_protocol::ProtocolError;
use meca_transport::TransportError;
use thiserror::Error;

/// 驱动层错误类型
#[derive(Error, Debug)]
pub enum DriverError {
    /// 传输层错误（建连/读写）
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// 协议解析错误（畸形帧/意外应答码）
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// 命令执行中连接断开，命令是否已执行未知
    ///
    /// 调用方必须先查询状态，不能盲目重发运动命令。
    #[error("Connection lost during {command}: {reason} (outcome unknown)")]
    ConnectionLost { command: String, reason: String },

    /// 控制端口已被其他客户端占用（`[3001]`）
    #[error("Controller refused connection: {0}")]
    ConnectionRefused(String),

    /// 控制器以错误码拒绝命令（1xxx）
    #[error("{command} rejected by controller: [{code}] {message}")]
    Rejected {
        command: String,
        code: u16,
        message: String,
    },

    /// 连接仍然有效但应答超时
    #[error("{command} timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    /// 检查点被丢弃（运动队列被清空）
    #[error("Checkpoint {0} discarded (motion queue cleared)")]
    CheckpointDiscarded(u32),

    /// 控制连接未建立
    #[error("Not connected")]
    NotConnected,

    /// 无效输入（参数越界等）
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// 后台线程启动失败
    #[error("IO thread error: {0}")]
    IoThread(String),
}

impl DriverError {
    pub(crate) fn rejected(command: &str, code: u16, message: &str) -> Self {
        DriverError::Rejected {
            command: command.to_string(),
            code,
            message: message.to_string(),
        }
    }

    pub(crate) fn connection_lost(command: &str, reason: impl ToString) -> Self {
        DriverError::ConnectionLost {
            command: command.to_string(),
            reason: reason.to_string(),
        }
    }

    /// 瞬时错误：连接仍在，可以安全重试（仅限只读查询）
    pub fn is_retryable(&self) -> bool {
        match self {
            DriverError::Timeout { .. } => true,
            DriverError::Transport(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// 与连接相关的失败（计入熔断器）
    pub fn is_connection_failure(&self) -> bool {
        match self {
            DriverError::Transport(_)
            | DriverError::ConnectionLost { .. }
            | DriverError::ConnectionRefused(_)
            | DriverError::Timeout { .. }
            | DriverError::NotConnected => true,
            _ => false,
        }
    }

    /// 物理结果未知（需要先查询状态再决定）
    pub fn outcome_unknown(&self) -> bool {
        matches!(
            self,
            DriverError::ConnectionLost { .. }
                | DriverError::Protocol(_)
                | DriverError::Timeout { .. }
        )
    }

    /// 控制器错误码（仅 `Rejected`）
    pub fn controller_code(&self) -> Option<u16> {
        match self {
            DriverError::Rejected { code, .. } => Some(*code),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meca_protocol::codes;

    #[test]
    fn test_driver_error_display() {
        let err = DriverError::rejected("ActivateRobot", codes::ACTIVATION_FAILED, "Activation failed.");
        assert_eq!(
            err.to_string(),
            "ActivateRobot rejected by controller: [1013] Activation failed."
        );
        assert_eq!(err.controller_code(), Some(1013));

        let err = DriverError::connection_lost("MovePose", "Connection closed by peer");
        assert_eq!(
            err.to_string(),
            "Connection lost during MovePose: Connection closed by peer (outcome unknown)"
        );

        let err = DriverError::Timeout {
            command: "GetStatusRobot".to_string(),
            timeout: Duration::from_millis(500),
        };
        assert_eq!(err.to_string(), "GetStatusRobot timed out after 500ms");

        assert_eq!(DriverError::NotConnected.to_string(), "Not connected");
    }

    #[test]
    fn test_classification() {
        let lost = DriverError::connection_lost("Home", "reset");
        assert!(lost.is_connection_failure());
        assert!(lost.outcome_unknown());
        assert!(!lost.is_retryable());

        let rejected = DriverError::rejected("Home", codes::NOT_ACTIVATED, "Motors not activated.");
        assert!(!rejected.is_connection_failure());
        assert!(!rejected.outcome_unknown());

        let timeout = DriverError::Timeout {
            command: "GetPose".to_string(),
            timeout: Duration::from_secs(1),
        };
        assert!(timeout.is_retryable());
        assert!(timeout.is_connection_failure());

        let malformed: DriverError = ProtocolError::MalformedFrame("[20".to_string()).into();
        assert!(malformed.outcome_unknown());
        assert!(!malformed.is_connection_failure());
    }

    #[test]
    fn test_from_transport_error() {
        let err: DriverError = TransportError::Closed.into();
        match err {
            DriverError::Transport(TransportError::Closed) => {},
            other => panic!("Expected Transport(Closed), got {other:?}"),
        }
    }
}
