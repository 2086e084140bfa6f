//! 应答帧 `[code][message]`
//!
//! - 1000–1999：错误
//! - 2000–2999：命令应答
//! - 3000–3999：状态通知（可能不请自来）

use smallvec::SmallVec;

use crate::{ProtocolError, parse_numbers};

/// 应答码常量
pub mod codes {
    // 错误
    pub const INVALID_COMMAND: u16 = 1000;
    pub const NOT_ACTIVATED: u16 = 1005;
    pub const NOT_HOMED: u16 = 1006;
    pub const ROBOT_IN_ERROR: u16 = 1011;
    pub const ACTIVATION_FAILED: u16 = 1013;
    pub const HOMING_FAILED: u16 = 1014;
    pub const MOTION_FAILED: u16 = 1016;

    // 命令应答
    pub const MOTORS_ACTIVATED: u16 = 2000;
    pub const HOMING_DONE: u16 = 2002;
    pub const HOMING_ALREADY_DONE: u16 = 2003;
    pub const MOTORS_DEACTIVATED: u16 = 2004;
    pub const ERROR_RESET: u16 = 2005;
    pub const NO_ERROR_TO_RESET: u16 = 2006;
    pub const STATUS_ROBOT: u16 = 2007;
    pub const JOINTS: u16 = 2026;
    pub const POSE: u16 = 2027;
    pub const MOTION_PAUSED: u16 = 2042;
    pub const MOTION_RESUMED: u16 = 2043;
    pub const MOTION_CLEARED: u16 = 2044;
    pub const RECOVERY_MODE_ON: u16 = 2049;
    pub const RECOVERY_MODE_OFF: u16 = 2050;

    // 通知
    pub const CONNECTED: u16 = 3000;
    pub const ALREADY_CONNECTED: u16 = 3001;
    pub const END_OF_MOVEMENT: u16 = 3004;
    pub const CHECKPOINT_REACHED: u16 = 3030;
    pub const CHECKPOINT_DISCARDED: u16 = 3031;
}

/// 控制器应答
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Response {
    pub code: u16,
    pub message: String,
}

impl Response {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// 解析 `[code][message]`（容忍首尾空白与 NUL）
    pub fn parse(frame: &str) -> Result<Self, ProtocolError> {
        let text = frame.trim_matches(|c: char| c.is_whitespace() || c == '\0');
        let malformed = || ProtocolError::MalformedFrame(text.to_string());

        let rest = text.strip_prefix('[').ok_or_else(malformed)?;
        let (code, rest) = rest.split_once(']').ok_or_else(malformed)?;
        let code = code.trim().parse::<u16>().map_err(|_| malformed())?;
        if !(1000..4000).contains(&code) {
            return Err(malformed());
        }

        let message = rest
            .strip_prefix('[')
            .and_then(|m| m.strip_suffix(']'))
            .ok_or_else(malformed)?;

        Ok(Self::new(code, message))
    }

    /// 编码为线格式文本（不含 NUL 结尾）
    pub fn encode(&self) -> String {
        format!("[{}][{}]", self.code, self.message)
    }

    pub fn is_error(&self) -> bool {
        (1000..2000).contains(&self.code)
    }

    pub fn is_notification(&self) -> bool {
        (3000..4000).contains(&self.code)
    }

    /// 按数值列表解析消息体（如 `[2027][x,y,z,a,b,g]`）
    pub fn values(&self) -> Result<SmallVec<[f64; 8]>, ProtocolError> {
        parse_numbers(&format!("[{}]", self.code), &self.message)
    }

    /// 检查点编号（`[3030][n]` / `[3031][n]`）
    pub fn checkpoint_id(&self) -> Option<u32> {
        if self.code == codes::CHECKPOINT_REACHED || self.code == codes::CHECKPOINT_DISCARDED {
            self.message.trim().parse().ok()
        } else {
            None
        }
    }

    /// 校验应答码属于期望集合
    pub fn expect(self, expected: &[u16]) -> Result<Self, ProtocolError> {
        if expected.contains(&self.code) {
            Ok(self)
        } else {
            Err(ProtocolError::UnexpectedCode {
                code: self.code,
                expected: expected.to_vec(),
            })
        }
    }
}
