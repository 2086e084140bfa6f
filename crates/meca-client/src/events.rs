//! 广播消息
//!
//! 状态流上只有三种消息，序列化为带 `type` 标签的 JSON：
//!
//! ```json
//! {"type":"status_update","robot_id":"meca","state":"idle",...}
//! {"type":"command_response","robot_id":"meca","command":"move_pose","success":true,...}
//! {"type":"operation_update","robot_id":"meca","operation":"pickup","phase":"item_completed",...}
//! ```
//!
//! 外部输入经 [`BroadcastMessage::from_json`] 解析并校验后才会进入系统。

use std::time::{SystemTime, UNIX_EPOCH};

use meca_driver::RobotStatus;
use serde::{Deserialize, Serialize};

use crate::{ApiError, ClientError, OperationState};

/// 当前 UNIX 时间（毫秒）
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// 单台机械臂的状态快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub robot_id: String,
    pub state: OperationState,
    pub connected: bool,
    pub activated: bool,
    pub homed: bool,
    pub error: bool,
    pub paused: bool,
    /// 遥测在静默阈值内
    pub monitor_healthy: bool,
    /// 当前租约持有者
    pub lease_holder: Option<String>,
    /// x, y, z (mm), rx, ry, rz (度)
    pub pose: [f64; 6],
    /// 关节角（度）
    pub joints: [f64; 6],
    pub timestamp_ms: u64,
}

impl StatusSnapshot {
    pub fn from_status(
        robot_id: &str,
        state: OperationState,
        status: &RobotStatus,
        connected: bool,
        monitor_healthy: bool,
        lease_holder: Option<String>,
    ) -> Self {
        Self {
            robot_id: robot_id.to_string(),
            state,
            connected,
            activated: status.flags.activated,
            homed: status.flags.homed,
            error: status.flags.error,
            paused: status.flags.paused,
            monitor_healthy,
            lease_holder,
            pose: status.pose.to_array(),
            joints: status.joints.0,
            timestamp_ms: if status.has_telemetry() {
                status.timestamp_ms
            } else {
                unix_millis()
            },
        }
    }
}

/// 一次服务调用的结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub robot_id: String,
    pub command: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
    pub timestamp_ms: u64,
}

impl CommandResponse {
    pub fn new<T>(robot_id: &str, command: &str, result: &Result<T, ClientError>) -> Self {
        Self {
            robot_id: robot_id.to_string(),
            command: command.to_string(),
            success: result.is_ok(),
            error: result.as_ref().err().map(ApiError::from),
            timestamp_ms: unix_millis(),
        }
    }
}

/// 长时间操作（序列）的进度
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationUpdate {
    pub robot_id: String,
    /// 操作名（如 `pickup`、`drop`）
    pub operation: String,
    /// 阶段（如 `item_started`、`paused`、`batch_completed`）
    pub phase: String,
    /// 当前物品（从 1 开始）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item: Option<u32>,
    /// 已完成比例 0.0–1.0
    pub progress: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub timestamp_ms: u64,
}

/// 广播消息（封闭集合）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BroadcastMessage {
    StatusUpdate(StatusSnapshot),
    CommandResponse(CommandResponse),
    OperationUpdate(OperationUpdate),
}

impl BroadcastMessage {
    pub fn robot_id(&self) -> &str {
        match self {
            BroadcastMessage::StatusUpdate(s) => &s.robot_id,
            BroadcastMessage::CommandResponse(r) => &r.robot_id,
            BroadcastMessage::OperationUpdate(o) => &o.robot_id,
        }
    }

    /// 消息类型标签
    pub fn kind(&self) -> &'static str {
        match self {
            BroadcastMessage::StatusUpdate(_) => "status_update",
            BroadcastMessage::CommandResponse(_) => "command_response",
            BroadcastMessage::OperationUpdate(_) => "operation_update",
        }
    }

    /// 边界校验
    pub fn validate(&self) -> Result<(), ClientError> {
        let invalid = |reason: &str| ClientError::InvalidInput(format!("{}: {}", self.kind(), reason));

        if self.robot_id().trim().is_empty() {
            return Err(invalid("robot_id must not be empty"));
        }
        match self {
            BroadcastMessage::StatusUpdate(s) => {
                if s.pose.iter().chain(s.joints.iter()).any(|v| !v.is_finite()) {
                    return Err(invalid("pose and joints must be finite"));
                }
            },
            BroadcastMessage::CommandResponse(r) => {
                if r.command.trim().is_empty() {
                    return Err(invalid("command must not be empty"));
                }
                if r.success == r.error.is_some() {
                    return Err(invalid("error must be present exactly when success is false"));
                }
            },
            BroadcastMessage::OperationUpdate(o) => {
                if o.operation.trim().is_empty() || o.phase.trim().is_empty() {
                    return Err(invalid("operation and phase must not be empty"));
                }
                if !(0.0..=1.0).contains(&o.progress) {
                    return Err(invalid("progress must be within 0.0..=1.0"));
                }
                if o.item == Some(0) {
                    return Err(invalid("item numbers start at 1"));
                }
            },
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String, ClientError> {
        serde_json::to_string(self).map_err(|e| ClientError::InvalidInput(e.to_string()))
    }

    /// 解析并校验
    pub fn from_json(text: &str) -> Result<Self, ClientError> {
        let message: BroadcastMessage =
            serde_json::from_str(text).map_err(|e| ClientError::InvalidInput(e.to_string()))?;
        message.validate()?;
        Ok(message)
    }
}
