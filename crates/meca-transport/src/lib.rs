//! # Meca Transport
//!
//! 绑定网卡的 TCP 传输层
//!
//! 机械臂通常位于隔离子网，主机上可能同时存在多块网卡。若由系统路由表决定出口，
//! 流量可能从错误的网卡发出。本 crate 在 `connect` 前把本地端点固定到指定网卡或 IP。
//!
//! ## 模块
//!
//! - `bind`: 绑定目标（网卡名 / IP）及其解析
//! - `tcp`: [`BoundTransport`] 实现
//! - `retry`: 有界指数退避重试策略
//! - `stats`: 连接统计

use std::io;
use std::time::Duration;

use thiserror::Error;

pub mod bind;
pub mod retry;
pub mod stats;
pub mod tcp;

pub use bind::BindTarget;
pub use retry::RetryPolicy;
pub use stats::TransportStats;
pub use tcp::{BoundTransport, TransportConfig};

/// 传输层错误
#[derive(Error, Debug)]
pub enum TransportError {
    /// 主机名解析失败
    #[error("Failed to resolve {host}: {reason}")]
    Resolve { host: String, reason: String },

    /// 网卡不存在或没有 IPv4 地址
    #[error("Interface {name} unusable: {reason}")]
    Interface { name: String, reason: String },

    /// 本地端点绑定失败
    #[error("Failed to bind local endpoint {target}: {source}")]
    Bind {
        target: String,
        #[source]
        source: io::Error,
    },

    /// 连接被拒绝/不可达
    #[error("Failed to connect to {addr}: {source}")]
    ConnectFailed {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// 连接超时
    #[error("Connection to {addr} timed out after {timeout:?}")]
    ConnectTimeout { addr: String, timeout: Duration },

    /// 发送失败（socket 级错误）
    #[error("Send failed: {0}")]
    Send(#[source] io::Error),

    /// 接收失败（socket 级错误）
    #[error("Receive failed: {0}")]
    Receive(#[source] io::Error),

    /// 读写超时（连接仍然有效）
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// 对端关闭连接
    #[error("Connection closed by peer")]
    Closed,

    /// 未连接或已关闭
    #[error("Transport not connected")]
    NotConnected,

    /// socket 选项设置失败
    #[error("Socket option {option} failed: {source}")]
    SocketOption {
        option: &'static str,
        #[source]
        source: io::Error,
    },
}

impl TransportError {
    /// 建立连接阶段的失败（解析/绑定/连接/超时）
    pub fn is_connect_error(&self) -> bool {
        matches!(
            self,
            TransportError::Resolve { .. }
                | TransportError::Interface { .. }
                | TransportError::Bind { .. }
                | TransportError::ConnectFailed { .. }
                | TransportError::ConnectTimeout { .. }
        )
    }

    /// 连接已失效，必须关闭后重连
    pub fn is_socket_failure(&self) -> bool {
        matches!(
            self,
            TransportError::Send(_)
                | TransportError::Receive(_)
                | TransportError::Closed
                | TransportError::NotConnected
        )
    }

    /// 可以重试的瞬时错误（读写超时、连接被拒/超时）
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::Timeout(_)
                | TransportError::ConnectFailed { .. }
                | TransportError::ConnectTimeout { .. }
        )
    }
}

/// 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Faulted,
}

/// 字节流传输抽象
///
/// 上层帧读取器只依赖此 trait，便于在测试中替换实现。
pub trait Transport: Send {
    /// 发送全部字节
    fn send(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// 接收（带超时）
    ///
    /// 返回读取的字节数；超时返回 `TransportError::Timeout`，对端关闭返回 `Closed`。
    fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError>;

    /// 关闭连接（幂等）
    fn close(&mut self);

    fn is_connected(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let timeout = TransportError::Timeout(Duration::from_millis(100));
        assert!(timeout.is_retryable());
        assert!(!timeout.is_socket_failure());
        assert!(!timeout.is_connect_error());

        let closed = TransportError::Closed;
        assert!(closed.is_socket_failure());
        assert!(!closed.is_retryable());

        let refused = TransportError::ConnectFailed {
            addr: "192.168.0.100:10000".to_string(),
            source: io::Error::from(io::ErrorKind::ConnectionRefused),
        };
        assert!(refused.is_connect_error());
        assert!(refused.is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = TransportError::ConnectTimeout {
            addr: "10.0.0.5:10000".to_string(),
            timeout: Duration::from_secs(10),
        };
        assert_eq!(
            err.to_string(),
            "Connection to 10.0.0.5:10000 timed out after 10s"
        );

        let err = TransportError::Interface {
            name: "eth9".to_string(),
            reason: "not found".to_string(),
        };
        assert_eq!(err.to_string(), "Interface eth9 unusable: not found");
    }
}
