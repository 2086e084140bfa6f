//! Prelude - 常用类型的便捷导入
//!
//! ```rust
//! use meca_sdk::prelude::*;
//! ```

// API 入口（推荐使用）
pub use crate::api::{ApiResult, LeaseInfo, RobotApi, SequenceStatus};

// 服务层
pub use meca_client::{
    BroadcastMessage, Lease, OperationState, OperationUpdate, RobotRegistry, RobotService,
    StatusBroadcaster, StatusSnapshot, Subscription,
};

// 序列层
pub use meca_control::{
    BatchResult, BatchStatus, CheckpointStore, JsonFileCheckpointStore, MemoryCheckpointStore,
    SequenceEngine, SequenceKind, SequencePhase,
};

// 协议类型与配置
pub use meca_protocol::{Command, JointSet, Pose};
pub use meca_tools::{RobotConfig, SystemConfig};

// 错误类型
pub use meca_client::{ApiError, ClientError};
pub use meca_control::SequenceError;
pub use meca_tools::ConfigError;
