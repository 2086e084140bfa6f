//! 序列层
//!
//! 在 [`meca_client::RobotService`] 之上运行可恢复的批量取片 / 放片序列：
//! - 位置计算（[`PositionCalculator`]）：托盘行、铺片机工位与各段偏移
//! - 步骤表（[`Recipe`]）：每一步带恢复策略，决定中断后如何继续
//! - 检查点（[`CheckpointStore`]）：只在物理完成确认后推进
//! - 引擎（[`SequenceEngine`]）：独立线程执行，暂停 / 急停 / 失败后按检查点恢复
//! - 审计（[`AuditSink`]）：逐片记录开始、完成、失败与批次结局
//!
//! # 示例
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use meca_client::RobotService;
//! use meca_control::{EngineParts, MemoryCheckpointStore, SequenceEngine, SequenceKind};
//!
//! # fn run(service: Arc<RobotService>) -> Result<(), Box<dyn std::error::Error>> {
//! let lease = service.acquire_lease("operator", None)?;
//! let engine = SequenceEngine::new(
//!     service,
//!     lease,
//!     EngineParts::new(Arc::new(MemoryCheckpointStore::new())),
//! )?;
//!
//! engine.start_sequence(SequenceKind::Pickup, 0, 5)?;
//! if let Some(result) = engine.wait_for_result(Duration::from_secs(600)) {
//!     println!("failed items: {:?}", result.failed_items);
//! }
//! # Ok(())
//! # }
//! ```

pub mod audit;
pub mod checkpoint;
pub mod engine;
mod error;
pub mod positions;
pub mod recipe;
pub mod robot;

pub use audit::{AUDIT_TARGET, AuditEvent, AuditRecord, AuditSink, ChannelAuditSink, TracingAuditSink};
pub use checkpoint::{
    CheckpointStore, JsonFileCheckpointStore, MemoryCheckpointStore, SequenceCheckpoint,
};
pub use engine::{
    BatchResult, BatchStatus, EngineParts, EngineSettings, SequenceEngine, SequencePhase,
};
pub use error::SequenceError;
pub use positions::{DropPositions, PickupPositions, PositionCalculator};
pub use recipe::{Recipe, ResumePolicy, SequenceKind, Step};
pub use robot::SequenceRobot;
