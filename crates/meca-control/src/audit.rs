//! 审计事件
//!
//! 引擎只定义事件形状，存储交给外部协作者。默认的 [`TracingAuditSink`]
//! 把事件序列化为 JSON，输出到 `meca::audit` 日志目标。

use crossbeam_channel::{Receiver, Sender, unbounded};
use meca_client::events::unix_millis;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::SequenceKind;

/// 日志目标
pub const AUDIT_TARGET: &str = "meca::audit";

/// 审计记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditRecord {
    ItemStarted {
        item: usize,
    },
    ItemCompleted {
        item: usize,
    },
    ItemFailed {
        item: usize,
        step: String,
        error: String,
        /// 失败后的恢复动作是否成功
        recovered: bool,
    },
    SequencePaused {
        item: Option<usize>,
        step: Option<String>,
        reason: String,
    },
    SequenceResumed {
        item: Option<usize>,
        step: Option<String>,
        /// 恢复运动前重新下发的关节速度
        speed: f64,
    },
    BatchCompleted {
        start: usize,
        count: usize,
        status: String,
        completed: Vec<usize>,
        failed: Vec<usize>,
    },
}

impl AuditRecord {
    pub fn name(&self) -> &'static str {
        match self {
            AuditRecord::ItemStarted { .. } => "item_started",
            AuditRecord::ItemCompleted { .. } => "item_completed",
            AuditRecord::ItemFailed { .. } => "item_failed",
            AuditRecord::SequencePaused { .. } => "sequence_paused",
            AuditRecord::SequenceResumed { .. } => "sequence_resumed",
            AuditRecord::BatchCompleted { .. } => "batch_completed",
        }
    }
}

/// 审计事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub sequence_id: String,
    pub robot_id: String,
    pub kind: SequenceKind,
    pub timestamp_ms: u64,
    #[serde(flatten)]
    pub record: AuditRecord,
}

impl AuditEvent {
    pub fn new(sequence_id: &str, robot_id: &str, kind: SequenceKind, record: AuditRecord) -> Self {
        Self {
            sequence_id: sequence_id.to_string(),
            robot_id: robot_id.to_string(),
            kind,
            timestamp_ms: unix_millis(),
            record,
        }
    }
}

/// 审计事件接收方
pub trait AuditSink: Send + Sync {
    fn record(&self, event: &AuditEvent);
}

/// 输出到 tracing（`meca::audit` 目标，JSON 正文）
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: &AuditEvent) {
        match serde_json::to_string(event) {
            Ok(json) => info!(
                target: AUDIT_TARGET,
                sequence_id = %event.sequence_id,
                robot_id = %event.robot_id,
                event = event.record.name(),
                "{json}"
            ),
            Err(e) => warn!(target: AUDIT_TARGET, "Failed to serialize audit event: {}", e),
        }
    }
}

/// 转发到通道（持久化线程或测试读取）
#[derive(Debug, Clone)]
pub struct ChannelAuditSink {
    sender: Sender<AuditEvent>,
}

impl ChannelAuditSink {
    pub fn new() -> (Self, Receiver<AuditEvent>) {
        let (sender, receiver) = unbounded();
        (Self { sender }, receiver)
    }
}

impl AuditSink for ChannelAuditSink {
    fn record(&self, event: &AuditEvent) {
        // 接收方已退出时丢弃
        let _ = self.sender.send(event.clone());
    }
}
