//! 序列层错误类型

use meca_client::ClientError;
use meca_tools::ConfigError;
use thiserror::Error;

use crate::SequencePhase;

/// 序列引擎错误
#[derive(Error, Debug)]
pub enum SequenceError {
    /// 批次参数不合法（数量为 0、超出托盘容量等）
    #[error("Invalid batch: {0}")]
    InvalidBatch(String),

    #[error("Item index {index} outside tray capacity {capacity}")]
    ItemOutOfRange { index: usize, capacity: usize },

    /// 当前阶段不允许该操作
    #[error("Cannot {action} while sequence is {actual:?}")]
    InvalidPhase {
        action: &'static str,
        actual: SequencePhase,
    },

    /// 恢复点的物理条件不满足（例如释放前机械臂已离开目标位姿）
    #[error("Unsafe to resume at step {step}: {reason}")]
    UnsafeResume { step: String, reason: String },

    /// 存储中还有未完成的批次，需要先恢复或放弃
    #[error("Sequence {sequence_id} on robot {robot_id} is unfinished, resume or abandon it first")]
    PendingCheckpoint {
        robot_id: String,
        sequence_id: String,
    },

    /// 机械臂处于急停，必须先由操作员解除
    #[error("Robot {0} is emergency stopped, clear it before resuming")]
    EmergencyStopped(String),

    #[error("Checkpoint I/O failed: {0}")]
    CheckpointIo(#[from] std::io::Error),

    #[error("Checkpoint format error: {0}")]
    CheckpointFormat(#[from] serde_json::Error),

    /// 存储中的检查点与本引擎不匹配
    #[error("Checkpoint mismatch: {0}")]
    CheckpointMismatch(String),

    #[error("Failed to start sequence worker: {0}")]
    Spawn(std::io::Error),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl SequenceError {
    /// 稳定的错误类别（供外层 API 使用）
    pub fn kind(&self) -> &'static str {
        match self {
            SequenceError::InvalidBatch(_) | SequenceError::ItemOutOfRange { .. } => "invalid_input",
            SequenceError::InvalidPhase { .. } | SequenceError::PendingCheckpoint { .. } => {
                "invalid_phase"
            },
            SequenceError::UnsafeResume { .. } => "unsafe_resume",
            SequenceError::EmergencyStopped(_) => "emergency_stopped",
            SequenceError::CheckpointIo(_)
            | SequenceError::CheckpointFormat(_)
            | SequenceError::CheckpointMismatch(_) => "checkpoint_error",
            SequenceError::Spawn(_) => "internal_error",
            SequenceError::Client(e) => e.kind(),
            SequenceError::Config(_) => "config_error",
        }
    }
}
