//! # Meca Protocol
//!
//! Mecademic 机械臂原生 ASCII 协议定义（无硬件依赖）
//!
//! ## 模块
//!
//! - `codec`: NUL 结尾帧的切分与封装
//! - `command`: 命令构建（`Name(arg,...)`）与解析
//! - `response`: 应答帧 `[code][message]` 解析与应答码常量
//! - `monitor`: 监控端口推送的遥测帧解析
//! - `types`: 位姿、关节角、状态位等值类型
//!
//! ## 连接
//!
//! 机械臂暴露两个 TCP 端口：
//!
//! ```text
//! 控制端口 (10000)  命令 ──►  ◄── 应答（严格一问一答）
//! 监控端口 (10001)            ◄── 周期推送 [2026]/[2027]/[2007]
//! ```

pub mod codec;
pub mod command;
pub mod monitor;
pub mod response;
pub mod types;

// 重新导出常用类型
pub use codec::{FRAME_TERMINATOR, FrameDecoder, MAX_FRAME_LEN, encode_frame};
pub use command::{Command, CommandKind};
pub use monitor::MonitorMessage;
pub use response::{Response, codes};
pub use types::{JointSet, Pose, StatusFlags};

use thiserror::Error;

/// 协议解析错误类型
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("Malformed frame: {0:?}")]
    MalformedFrame(String),

    #[error("Frame is not ASCII: {hex}")]
    NonAscii { hex: String },

    #[error("Frame too long: {len} bytes without terminator (max {max})")]
    FrameTooLong { len: usize, max: usize },

    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Invalid argument count for {command}: expected {expected}, got {actual}")]
    InvalidArity {
        command: String,
        expected: usize,
        actual: usize,
    },

    #[error("Invalid number {value:?} in {context}")]
    InvalidNumber { context: String, value: String },

    #[error("Invalid value for field {field}: {value}")]
    InvalidValue { field: String, value: String },

    #[error("Unexpected response code {code}, expected one of {expected:?}")]
    UnexpectedCode { code: u16, expected: Vec<u16> },
}

impl ProtocolError {
    pub(crate) fn invalid_value(field: &str, value: impl ToString) -> Self {
        ProtocolError::InvalidValue {
            field: field.to_string(),
            value: value.to_string(),
        }
    }
}

/// 解析逗号分隔的数值列表（用于命令参数与应答数据）
pub(crate) fn parse_numbers(
    context: &str,
    text: &str,
) -> Result<smallvec::SmallVec<[f64; 8]>, ProtocolError> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(smallvec::SmallVec::new());
    }

    text.split(',')
        .map(|part| {
            let part = part.trim();
            part.parse::<f64>().map_err(|_| ProtocolError::InvalidNumber {
                context: context.to_string(),
                value: part.to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_numbers() {
        let values = parse_numbers("test", "1, 2.5,-3").unwrap();
        assert_eq!(values.as_slice(), &[1.0, 2.5, -3.0]);
    }

    #[test]
    fn test_parse_numbers_empty() {
        assert!(parse_numbers("test", "  ").unwrap().is_empty());
    }

    #[test]
    fn test_parse_numbers_invalid() {
        let err = parse_numbers("MovePose", "1,abc").unwrap_err();
        assert_eq!(
            err,
            ProtocolError::InvalidNumber {
                context: "MovePose".to_string(),
                value: "abc".to_string(),
            }
        );
    }

    #[test]
    fn test_protocol_error_display() {
        let err = ProtocolError::FrameTooLong { len: 2048, max: 1024 };
        assert_eq!(
            err.to_string(),
            "Frame too long: 2048 bytes without terminator (max 1024)"
        );

        let err = ProtocolError::InvalidArity {
            command: "MovePose".to_string(),
            expected: 6,
            actual: 3,
        };
        assert!(err.to_string().contains("expected 6, got 3"));
    }
}
