//! 序列引擎
//!
//! 在独立线程中逐片执行批次，调用方通过 [`SequenceEngine`] 的方法控制：
//!
//! ```text
//! Idle ──start──► Running ──► Completed
//!                  │  ▲
//!           pause/ │  │ resume
//!           急停   ▼  │
//!                 Paused ──abandon──► Abandoned
//!
//! Running ──恢复动作失败──► Failed ──resume（重试当前片）──► Running
//!                                  └─abandon──► Abandoned
//! ```
//!
//! 单片失败不会终止批次：失败的片记入 `failed_items`，执行恢复动作
//! （复位错误、恢复速度、恢复运动、回安全点、张开夹爪）后继续下一片。
//! 批次结束后由调用方选择只重试失败的片，或跳到下一批。
//!
//! 恢复运动之前总是先重新下发中断前的关节速度，避免停留在恢复时的低速。

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use meca_client::events::unix_millis;
use meca_client::{
    BroadcastMessage, ClientError, EventPublisher, Lease, OperationState, OperationUpdate,
};
use meca_protocol::Command;
use meca_tools::{MovementParams, PositionsConfig, RobotConfig, SequenceOffsets};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::{
    AuditEvent, AuditRecord, AuditSink, CheckpointStore, PositionCalculator, Recipe, ResumePolicy,
    SequenceCheckpoint, SequenceError, SequenceKind, SequenceRobot, Step, TracingAuditSink,
};

/// 序列阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SequencePhase {
    Idle,
    Running,
    Paused,
    Failed,
    Completed,
    Abandoned,
}

impl SequencePhase {
    pub fn as_str(self) -> &'static str {
        match self {
            SequencePhase::Idle => "idle",
            SequencePhase::Running => "running",
            SequencePhase::Paused => "paused",
            SequencePhase::Failed => "failed",
            SequencePhase::Completed => "completed",
            SequencePhase::Abandoned => "abandoned",
        }
    }

    /// 可以开始新批次
    fn accepts_start(self) -> bool {
        matches!(
            self,
            SequencePhase::Idle | SequencePhase::Completed | SequencePhase::Abandoned
        )
    }
}

/// 批次结局
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Completed,
    PartialSuccess,
    Abandoned,
}

impl BatchStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BatchStatus::Completed => "completed",
            BatchStatus::PartialSuccess => "partial_success",
            BatchStatus::Abandoned => "abandoned",
        }
    }
}

/// 批次结果（片号从 1 开始）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    pub sequence_id: String,
    pub robot_id: String,
    pub kind: SequenceKind,
    pub start: usize,
    pub count: usize,
    pub status: BatchStatus,
    pub completed_items: Vec<usize>,
    pub failed_items: Vec<usize>,
    pub retry: bool,
}

impl BatchResult {
    /// 本次运行的成功率（0.0–1.0）
    pub fn success_rate(&self) -> f64 {
        let attempted = self.completed_items.len() + self.failed_items.len();
        if attempted == 0 {
            0.0
        } else {
            self.completed_items.len() as f64 / attempted as f64
        }
    }
}

/// 引擎设置
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// 单步物理完成确认超时（暂停期间不计）
    pub step_timeout: Duration,
    /// 租约心跳间隔
    pub heartbeat_interval: Duration,
    /// 恢复释放步骤前允许的位姿偏差（mm）
    pub pose_tolerance_mm: f64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            step_timeout: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(10),
            pose_tolerance_mm: 0.5,
        }
    }
}

impl EngineSettings {
    pub fn from_config(robot: &RobotConfig, movement: &MovementParams) -> Self {
        Self {
            step_timeout: Duration::from_millis(movement.step_timeout_ms),
            heartbeat_interval: robot.heartbeat_interval(),
            ..Default::default()
        }
    }
}

/// 引擎构建参数
pub struct EngineParts {
    pub positions: PositionsConfig,
    pub offsets: SequenceOffsets,
    pub movement: MovementParams,
    pub settings: EngineSettings,
    pub store: Arc<dyn CheckpointStore>,
    pub audit: Arc<dyn AuditSink>,
    pub events: Option<EventPublisher>,
}

impl EngineParts {
    pub fn new(store: Arc<dyn CheckpointStore>) -> Self {
        Self {
            positions: PositionsConfig::default(),
            offsets: SequenceOffsets::default(),
            movement: MovementParams::default(),
            settings: EngineSettings::default(),
            store,
            audit: Arc::new(TracingAuditSink),
            events: None,
        }
    }
}

#[derive(Debug)]
struct Control {
    phase: SequencePhase,
    pause_requested: bool,
    retry_requested: bool,
    abandon_requested: bool,
    checkpoint: Option<SequenceCheckpoint>,
    result: Option<BatchResult>,
    last_batch: Option<(SequenceKind, usize, usize)>,
    /// 在夹持中被放弃的序列 ID（存储不可用时的兜底）
    held_wafer: Option<String>,
}

struct Shared {
    robot: Arc<dyn SequenceRobot>,
    lease: Mutex<Lease>,
    calculator: PositionCalculator,
    movement: MovementParams,
    settings: EngineSettings,
    store: Arc<dyn CheckpointStore>,
    audit: Arc<dyn AuditSink>,
    events: Option<EventPublisher>,
    control: Mutex<Control>,
    changed: Condvar,
}

/// 一段步骤的执行结果
enum Segment {
    Done,
    Abandon,
    Failed { step: &'static str, error: String },
}

/// 步骤之间的检查结果
enum Gate {
    Continue,
    Abandon,
}

enum Interruption {
    Paused(String),
    Abandon,
}

/// 序列引擎
pub struct SequenceEngine {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SequenceEngine {
    pub fn new(
        robot: Arc<dyn SequenceRobot>,
        lease: Lease,
        parts: EngineParts,
    ) -> Result<Self, SequenceError> {
        if lease.robot_id != robot.robot_id() {
            return Err(SequenceError::InvalidBatch(format!(
                "lease is for robot {}, engine drives {}",
                lease.robot_id,
                robot.robot_id()
            )));
        }
        let calculator = PositionCalculator::new(parts.positions, parts.offsets, &parts.movement)?;

        Ok(Self {
            shared: Arc::new(Shared {
                robot,
                lease: Mutex::new(lease),
                calculator,
                movement: parts.movement,
                settings: parts.settings,
                store: parts.store,
                audit: parts.audit,
                events: parts.events,
                control: Mutex::new(Control {
                    phase: SequencePhase::Idle,
                    pause_requested: false,
                    retry_requested: false,
                    abandon_requested: false,
                    checkpoint: None,
                    result: None,
                    last_batch: None,
                    held_wafer: None,
                }),
                changed: Condvar::new(),
            }),
            worker: Mutex::new(None),
        })
    }

    pub fn robot_id(&self) -> &str {
        self.shared.robot.robot_id()
    }

    pub fn phase(&self) -> SequencePhase {
        self.shared.control.lock().phase
    }

    /// 当前租约（心跳后更新）
    pub fn lease(&self) -> Lease {
        self.shared.lease.lock().clone()
    }

    /// 当前进度
    pub fn checkpoint(&self) -> Option<SequenceCheckpoint> {
        self.shared.control.lock().checkpoint.clone()
    }

    /// 最近一次结束的批次
    pub fn last_result(&self) -> Option<BatchResult> {
        self.shared.control.lock().result.clone()
    }

    pub fn calculator(&self) -> &PositionCalculator {
        &self.shared.calculator
    }

    // ==================== 批次控制 ====================

    /// 开始一个批次（`start` 从 0 开始，不超过托盘容量）
    pub fn start_sequence(
        &self,
        kind: SequenceKind,
        start: usize,
        count: usize,
    ) -> Result<String, SequenceError> {
        let capacity = self.shared.calculator.capacity();
        if count == 0 {
            return Err(SequenceError::InvalidBatch("count must be at least 1".to_string()));
        }
        if start.checked_add(count).is_none_or(|end| end > capacity) {
            return Err(SequenceError::InvalidBatch(format!(
                "items {}..={} exceed tray capacity {capacity}",
                start.saturating_add(1),
                start.saturating_add(count)
            )));
        }

        let items = (start..start + count).collect();
        self.launch(kind, start, count, items, false)
    }

    /// 只重试上一批失败的片
    pub fn retry_failed_items(&self) -> Result<String, SequenceError> {
        let result = {
            let control = self.shared.control.lock();
            if control.phase != SequencePhase::Completed {
                return Err(SequenceError::InvalidPhase {
                    action: "retry failed items",
                    actual: control.phase,
                });
            }
            control.result.clone()
        };
        let Some(result) = result.filter(|r| !r.failed_items.is_empty()) else {
            return Err(SequenceError::InvalidBatch("no failed items to retry".to_string()));
        };

        let items = result.failed_items.iter().map(|n| n - 1).collect();
        info!(
            robot_id = %self.robot_id(),
            failed = ?result.failed_items,
            "Retrying failed items of {}",
            result.sequence_id
        );
        self.launch(result.kind, result.start, result.count, items, true)
    }

    /// 跳到下一批（起点前移 `count`，末批按剩余容量截断）
    pub fn skip_to_next_batch(&self) -> Result<String, SequenceError> {
        let (kind, start, count) = {
            let control = self.shared.control.lock();
            if !matches!(
                control.phase,
                SequencePhase::Completed | SequencePhase::Abandoned
            ) {
                return Err(SequenceError::InvalidPhase {
                    action: "skip to next batch",
                    actual: control.phase,
                });
            }
            control
                .last_batch
                .ok_or_else(|| SequenceError::InvalidBatch("no previous batch".to_string()))?
        };

        let capacity = self.shared.calculator.capacity();
        let next = start + count;
        if next >= capacity {
            return Err(SequenceError::InvalidBatch(format!(
                "tray exhausted after item {next}"
            )));
        }
        self.start_sequence(kind, next, count.min(capacity - next))
    }

    /// 暂停（在途步骤立即停下，恢复后继续完成）
    pub fn pause_sequence(&self) -> Result<(), SequenceError> {
        {
            let mut control = self.shared.control.lock();
            if control.phase != SequencePhase::Running {
                return Err(SequenceError::InvalidPhase {
                    action: "pause",
                    actual: control.phase,
                });
            }
            control.pause_requested = true;
            control.phase = SequencePhase::Paused;
        }
        self.shared.record_paused("operator");

        let lease = self.lease();
        if let Err(e) = self.shared.robot.pause_motion(&lease) {
            // 引擎已经停在步骤之间，控制器未暂停只影响在途步骤
            warn!(robot_id = %self.robot_id(), "Pause did not reach controller: {}", e);
            return Err(e.into());
        }
        Ok(())
    }

    /// 恢复
    ///
    /// - `Paused`：重新下发中断前的速度，恢复运动，从检查点继续
    /// - `Failed`：复位错误，恢复速度与运动，重试当前片（夹着片子时从失败的那一步继续）
    /// - `Idle` 且存储中有检查点：进程重启后的恢复
    pub fn resume_sequence(&self) -> Result<(), SequenceError> {
        let phase = self.phase();
        match phase {
            SequencePhase::Paused => self.resume_paused(),
            SequencePhase::Failed => self.resume_failed(),
            SequencePhase::Idle | SequencePhase::Completed | SequencePhase::Abandoned => {
                self.resume_stored()
            },
            SequencePhase::Running => Ok(()),
        }
    }

    /// 放弃（只在暂停或失败时允许；存储中残留的检查点也可以放弃）
    ///
    /// 夹着片子时放弃会留下标记，之后的开始与恢复都被拒绝，直到
    /// [`confirm_gripper_empty`](Self::confirm_gripper_empty)。
    pub fn abandon_sequence(&self) -> Result<(), SequenceError> {
        let phase = self.phase();
        match phase {
            SequencePhase::Paused | SequencePhase::Failed => {
                self.shared.request_abandon();
                Ok(())
            },
            SequencePhase::Running => Err(SequenceError::InvalidPhase {
                action: "abandon",
                actual: phase,
            }),
            _ => {
                let robot_id = self.robot_id().to_string();
                if let Some(checkpoint) = self.shared.store.load(&robot_id)? {
                    if checkpoint.abandoned {
                        return Err(held_wafer(&checkpoint.sequence_id));
                    }
                    warn!(robot_id = %robot_id, "Abandoning stored sequence {}", checkpoint.sequence_id);
                    self.shared.store.clear(&robot_id)?;
                    let mut control = self.shared.control.lock();
                    control.checkpoint = None;
                    control.phase = SequencePhase::Abandoned;
                }
                Ok(())
            },
        }
    }

    /// 操作员确认夹爪已空，解除夹持中放弃留下的锁定
    pub fn confirm_gripper_empty(&self) -> Result<(), SequenceError> {
        let robot_id = self.robot_id().to_string();
        {
            let mut control = self.shared.control.lock();
            if !control.phase.accepts_start() {
                return Err(SequenceError::InvalidPhase {
                    action: "confirm gripper empty",
                    actual: control.phase,
                });
            }
            control.held_wafer = None;
        }
        if let Some(checkpoint) = self.shared.store.load(&robot_id)?
            && checkpoint.abandoned
        {
            self.shared.store.clear(&robot_id)?;
            info!(robot_id = %robot_id, "Gripper confirmed empty after {}", checkpoint.sequence_id);
        }
        Ok(())
    }

    /// 等待批次结束（完成或放弃）
    pub fn wait_for_result(&self, timeout: Duration) -> Option<BatchResult> {
        let deadline = Instant::now() + timeout;
        let mut control = self.shared.control.lock();
        while control.result.is_none() || control.phase == SequencePhase::Running {
            if self.shared.changed.wait_until(&mut control, deadline).timed_out() {
                break;
            }
        }
        control.result.clone()
    }

    /// 等待进入指定阶段
    pub fn wait_for_phase(&self, phase: SequencePhase, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut control = self.shared.control.lock();
        while control.phase != phase {
            if self.shared.changed.wait_until(&mut control, deadline).timed_out() {
                return control.phase == phase;
            }
        }
        true
    }

    fn launch(
        &self,
        kind: SequenceKind,
        start: usize,
        count: usize,
        items: Vec<usize>,
        retry: bool,
    ) -> Result<String, SequenceError> {
        let phase = self.phase();
        if !phase.accepts_start() {
            return Err(SequenceError::InvalidPhase {
                action: "start",
                actual: phase,
            });
        }
        let robot_id = self.robot_id().to_string();
        if let Some(sequence_id) = self.shared.control.lock().held_wafer.clone() {
            return Err(held_wafer(&sequence_id));
        }
        if let Some(pending) = self.shared.store.load(&robot_id)? {
            if pending.abandoned {
                return Err(held_wafer(&pending.sequence_id));
            }
            return Err(SequenceError::PendingCheckpoint {
                robot_id,
                sequence_id: pending.sequence_id,
            });
        }

        let sequence_id = format!("{robot_id}-{kind}-{}-{}", start + 1, unix_millis());
        let mut checkpoint = SequenceCheckpoint {
            sequence_id: sequence_id.clone(),
            robot_id,
            kind,
            start,
            count,
            items,
            position: 0,
            next_step: 0,
            setup_done: false,
            holding: false,
            completed: Vec::new(),
            failed: Vec::new(),
            retry,
            abandoned: false,
            updated_ms: 0,
        };
        checkpoint.touch();
        self.spawn_worker(checkpoint)?;
        Ok(sequence_id)
    }

    fn spawn_worker(&self, checkpoint: SequenceCheckpoint) -> Result<(), SequenceError> {
        let mut worker = self.worker.lock();
        {
            let mut control = self.shared.control.lock();
            if !control.phase.accepts_start() {
                return Err(SequenceError::InvalidPhase {
                    action: "start",
                    actual: control.phase,
                });
            }
            control.phase = SequencePhase::Running;
            control.pause_requested = false;
            control.retry_requested = false;
            control.abandon_requested = false;
            control.result = None;
            control.checkpoint = Some(checkpoint.clone());
            if !checkpoint.retry {
                control.last_batch = Some((checkpoint.kind, checkpoint.start, checkpoint.count));
            }
        }
        self.shared.save(&checkpoint);

        if let Some(previous) = worker.take() {
            let _ = previous.join();
        }

        let shared = self.shared.clone();
        let name = format!("meca-seq-{}", self.robot_id());
        let spawned = thread::Builder::new()
            .name(name)
            .spawn(move || shared.run(checkpoint));
        match spawned {
            Ok(handle) => {
                *worker = Some(handle);
                Ok(())
            },
            Err(e) => {
                let mut control = self.shared.control.lock();
                control.phase = SequencePhase::Idle;
                control.checkpoint = None;
                drop(control);
                let _ = self.shared.store.clear(self.robot_id());
                Err(SequenceError::Spawn(e))
            },
        }
    }

    // ==================== 恢复 ====================

    fn resume_paused(&self) -> Result<(), SequenceError> {
        self.check_not_stopped()?;
        let checkpoint = self
            .checkpoint()
            .ok_or_else(|| SequenceError::InvalidBatch("no progress to resume".to_string()))?;
        self.check_release_position(&checkpoint)?;
        let speed = self.shared.resume_speed(&checkpoint)?;

        let lease = self.lease();
        self.shared.robot.apply_speed(&lease, speed)?;
        self.shared.robot.resume_motion(&lease)?;

        {
            let mut control = self.shared.control.lock();
            if control.phase != SequencePhase::Paused {
                return Ok(());
            }
            control.pause_requested = false;
            control.phase = SequencePhase::Running;
        }
        self.shared.changed.notify_all();
        self.shared.record_resumed(&checkpoint, speed);
        Ok(())
    }

    fn resume_failed(&self) -> Result<(), SequenceError> {
        self.check_not_stopped()?;
        let checkpoint = self
            .checkpoint()
            .ok_or_else(|| SequenceError::InvalidBatch("no progress to resume".to_string()))?;
        // 夹着片子时从失败的那一步继续，否则从头重做当前片
        let speed = if checkpoint.holding {
            self.check_release_position(&checkpoint)?;
            self.shared.resume_speed(&checkpoint)?
        } else {
            self.shared.movement.speed
        };
        let lease = self.lease();
        let robot = &self.shared.robot;

        robot.execute_step(&lease, Command::ResetError, self.shared.settings.step_timeout)?;
        robot.apply_speed(&lease, speed)?;
        robot.resume_motion(&lease)?;

        {
            let mut control = self.shared.control.lock();
            if control.phase != SequencePhase::Failed {
                return Ok(());
            }
            control.retry_requested = true;
            control.phase = SequencePhase::Running;
        }
        self.shared.changed.notify_all();
        self.shared.record_resumed(&checkpoint, speed);
        Ok(())
    }

    fn resume_stored(&self) -> Result<(), SequenceError> {
        let robot_id = self.robot_id().to_string();
        let Some(checkpoint) = self.shared.store.load(&robot_id)? else {
            return Err(SequenceError::InvalidPhase {
                action: "resume",
                actual: self.phase(),
            });
        };
        if checkpoint.abandoned {
            return Err(held_wafer(&checkpoint.sequence_id));
        }
        self.check_not_stopped()?;
        if checkpoint.is_finished() {
            self.shared.store.clear(&robot_id)?;
            return Err(SequenceError::InvalidBatch(format!(
                "stored sequence {} already finished",
                checkpoint.sequence_id
            )));
        }
        self.check_release_position(&checkpoint)?;
        let speed = self.shared.resume_speed(&checkpoint)?;

        info!(
            robot_id = %robot_id,
            item = ?checkpoint.current_item().map(|i| i + 1),
            step = checkpoint.next_step,
            "Resuming stored sequence {}",
            checkpoint.sequence_id
        );
        let lease = self.lease();
        self.shared.robot.apply_speed(&lease, speed)?;
        self.shared.robot.resume_motion(&lease)?;

        self.spawn_worker(checkpoint.clone())?;
        self.shared.record_resumed(&checkpoint, speed);
        Ok(())
    }

    fn check_not_stopped(&self) -> Result<(), SequenceError> {
        if self.shared.robot.operation_state() == OperationState::EmergencyStopped {
            return Err(SequenceError::EmergencyStopped(self.robot_id().to_string()));
        }
        Ok(())
    }

    /// 下一步是放片时，机械臂必须仍在放片位姿
    fn check_release_position(&self, checkpoint: &SequenceCheckpoint) -> Result<(), SequenceError> {
        let (Some(index), true) = (checkpoint.current_item(), checkpoint.setup_done) else {
            return Ok(());
        };
        let recipe = Recipe::new(checkpoint.kind, &self.shared.calculator, &self.shared.movement);
        let steps = recipe.item_steps(index)?;
        let Some(step) = steps.get(checkpoint.next_step) else {
            return Ok(());
        };
        if step.policy != ResumePolicy::ReleaseAtTarget {
            return Ok(());
        }

        let unsafe_resume = |reason: String| SequenceError::UnsafeResume {
            step: step.name.to_string(),
            reason,
        };
        let target = recipe
            .release_target(index, checkpoint.next_step)?
            .ok_or_else(|| unsafe_resume("no approach move before release".to_string()))?;
        let pose = self
            .shared
            .robot
            .current_pose()
            .ok_or_else(|| unsafe_resume("current pose is unknown".to_string()))?;

        let distance =
            ((pose.x - target.x).powi(2) + (pose.y - target.y).powi(2) + (pose.z - target.z).powi(2)).sqrt();
        if distance > self.shared.settings.pose_tolerance_mm {
            return Err(unsafe_resume(format!(
                "arm is {distance:.2} mm away from the release pose"
            )));
        }
        Ok(())
    }
}

fn held_wafer(sequence_id: &str) -> SequenceError {
    SequenceError::UnsafeResume {
        step: "open_gripper".to_string(),
        reason: format!(
            "sequence {sequence_id} was abandoned with a wafer in the gripper, confirm the gripper is empty first"
        ),
    }
}

impl Drop for SequenceEngine {
    fn drop(&mut self) {
        let running = self.worker.get_mut().take();
        if let Some(handle) = running {
            if !handle.is_finished() {
                self.shared.request_abandon();
            }
            let _ = handle.join();
        }
    }
}

impl Shared {
    fn robot_id(&self) -> &str {
        self.robot.robot_id()
    }

    // ==================== 工作线程 ====================

    fn run(self: Arc<Self>, mut checkpoint: SequenceCheckpoint) {
        let fresh = !checkpoint.has_progress();
        info!(
            robot_id = %self.robot_id(),
            sequence_id = %checkpoint.sequence_id,
            kind = %checkpoint.kind,
            items = checkpoint.items.len(),
            fresh,
            "Sequence started"
        );
        self.publish(&checkpoint, "started", None, None);

        let recipe = Recipe::new(checkpoint.kind, &self.calculator, &self.movement);
        let mut last_heartbeat = Instant::now();
        let abandoned = !self.drive(&recipe, &mut checkpoint, &mut last_heartbeat);
        self.finish(checkpoint, abandoned);
    }

    /// 返回 `false` 表示被放弃
    fn drive(
        &self,
        recipe: &Recipe<'_>,
        checkpoint: &mut SequenceCheckpoint,
        last_heartbeat: &mut Instant,
    ) -> bool {
        loop {
            if !checkpoint.setup_done {
                let steps = recipe.setup();
                match self.run_segment(&steps, checkpoint, last_heartbeat) {
                    Segment::Done => {
                        checkpoint.setup_done = true;
                        checkpoint.next_step = 0;
                        self.commit(checkpoint);
                    },
                    Segment::Abandon => return false,
                    Segment::Failed { step, error } => {
                        error!(robot_id = %self.robot_id(), step, "Setup failed: {}", error);
                        self.publish(checkpoint, "failed", None, Some(error));
                        if !self.wait_for_retry(last_heartbeat) {
                            return false;
                        }
                    },
                }
                continue;
            }

            let Some(index) = checkpoint.current_item() else {
                return true;
            };
            let item = index + 1;
            let steps = match recipe.item_steps(index) {
                Ok(steps) => steps,
                Err(e) => {
                    self.record_failure(checkpoint, item, "plan", &e.to_string(), false);
                    checkpoint.position += 1;
                    checkpoint.next_step = 0;
                    self.commit(checkpoint);
                    continue;
                },
            };

            if checkpoint.next_step == 0 {
                self.audit(checkpoint, AuditRecord::ItemStarted { item });
                self.publish(checkpoint, "item_started", Some(item), None);
            }

            match self.run_segment(&steps, checkpoint, last_heartbeat) {
                Segment::Done => {
                    checkpoint.completed.push(item);
                    checkpoint.position += 1;
                    checkpoint.next_step = 0;
                    self.commit(checkpoint);
                    info!(robot_id = %self.robot_id(), item, "Item completed");
                    self.audit(checkpoint, AuditRecord::ItemCompleted { item });
                    self.publish(checkpoint, "item_completed", Some(item), None);
                },
                Segment::Abandon => return false,
                Segment::Failed { step, error } => {
                    warn!(robot_id = %self.robot_id(), item, step, "Item failed: {}", error);
                    let recovered = match self.recover() {
                        Ok(()) => true,
                        Err(e) => {
                            error!(robot_id = %self.robot_id(), item, "Recovery failed: {}", e);
                            false
                        },
                    };
                    self.record_failure(checkpoint, item, step, &error, recovered);

                    if recovered {
                        checkpoint.holding = false;
                        checkpoint.position += 1;
                        checkpoint.next_step = 0;
                        self.commit(checkpoint);
                        continue;
                    }

                    self.publish(checkpoint, "failed", Some(item), Some(error));
                    if !self.wait_for_retry(last_heartbeat) {
                        return false;
                    }
                    // 夹着片子时重发失败的那一步，否则从第一步重做
                    checkpoint.failed.retain(|n| *n != item);
                    if !checkpoint.holding {
                        checkpoint.next_step = 0;
                    }
                    self.commit(checkpoint);
                },
            }
        }
    }

    /// 从 `checkpoint.next_step` 开始执行一段步骤
    fn run_segment(
        &self,
        steps: &[Step],
        checkpoint: &mut SequenceCheckpoint,
        last_heartbeat: &mut Instant,
    ) -> Segment {
        while let Some(step) = steps.get(checkpoint.next_step).copied() {
            match self.gate(checkpoint, last_heartbeat) {
                Ok(Gate::Continue) => {},
                Ok(Gate::Abandon) => return Segment::Abandon,
                Err(e) => {
                    return Segment::Failed {
                        step: step.name,
                        error: e.to_string(),
                    };
                },
            }

            debug!(
                robot_id = %self.robot_id(),
                item = ?checkpoint.current_item().map(|i| i + 1),
                step = checkpoint.next_step,
                "{}",
                step.name
            );
            let lease = self.lease.lock().clone();
            match self
                .robot
                .execute_step(&lease, step.command, self.settings.step_timeout)
            {
                Ok(()) => {
                    checkpoint.next_step += 1;
                    match step.policy {
                        ResumePolicy::Grip => checkpoint.holding = true,
                        ResumePolicy::ReleaseAtTarget => checkpoint.holding = false,
                        ResumePolicy::SetupOnly | ResumePolicy::Reissue => {},
                    }
                    self.commit(checkpoint);
                },
                Err(e) => match self.classify(&e) {
                    Some(Interruption::Abandon) => return Segment::Abandon,
                    Some(Interruption::Paused(reason)) => {
                        warn!(
                            robot_id = %self.robot_id(),
                            step = step.name,
                            "Sequence interrupted ({}): {}",
                            reason,
                            e
                        );
                        self.enter_paused(&reason);
                    },
                    None => {
                        return Segment::Failed {
                            step: step.name,
                            error: e.to_string(),
                        };
                    },
                },
            }
        }
        Segment::Done
    }

    /// 失败是中断（急停、外部暂停、放弃）还是本片的失败
    fn classify(&self, err: &ClientError) -> Option<Interruption> {
        if self.control.lock().abandon_requested {
            return Some(Interruption::Abandon);
        }
        if matches!(err, ClientError::EmergencyStopped(_))
            || self.robot.operation_state() == OperationState::EmergencyStopped
        {
            return Some(Interruption::Paused("emergency_stop".to_string()));
        }
        if let ClientError::InvalidTransition {
            actual: Some(OperationState::Paused),
            ..
        } = err
        {
            return Some(Interruption::Paused("robot_paused".to_string()));
        }
        None
    }

    fn enter_paused(&self, reason: &str) {
        let newly_paused = {
            let mut control = self.control.lock();
            if control.phase == SequencePhase::Running {
                control.phase = SequencePhase::Paused;
            }
            let newly = !control.pause_requested;
            control.pause_requested = true;
            newly
        };
        self.changed.notify_all();
        if newly_paused {
            self.record_paused(reason);
        }
    }

    /// 步骤之间：处理放弃、暂停与租约心跳
    fn gate(
        &self,
        checkpoint: &SequenceCheckpoint,
        last_heartbeat: &mut Instant,
    ) -> Result<Gate, ClientError> {
        let mut control = self.control.lock();
        loop {
            if control.abandon_requested {
                return Ok(Gate::Abandon);
            }
            if !control.pause_requested {
                break;
            }
            let interval = self.settings.heartbeat_interval;
            self.changed.wait_for(&mut control, interval / 2);
            if last_heartbeat.elapsed() >= interval {
                drop(control);
                self.heartbeat(last_heartbeat)?;
                control = self.control.lock();
            }
        }
        control.checkpoint = Some(checkpoint.clone());
        drop(control);

        if last_heartbeat.elapsed() >= self.settings.heartbeat_interval {
            self.heartbeat(last_heartbeat)?;
        }
        Ok(Gate::Continue)
    }

    /// 失败状态下等待重试或放弃；返回 `false` 表示放弃
    fn wait_for_retry(&self, last_heartbeat: &mut Instant) -> bool {
        {
            let mut control = self.control.lock();
            control.phase = SequencePhase::Failed;
            control.retry_requested = false;
        }
        self.changed.notify_all();

        let interval = self.settings.heartbeat_interval;
        let mut control = self.control.lock();
        loop {
            if control.abandon_requested {
                return false;
            }
            if control.retry_requested {
                control.retry_requested = false;
                return true;
            }
            self.changed.wait_for(&mut control, interval / 2);
            if last_heartbeat.elapsed() >= interval {
                drop(control);
                if let Err(e) = self.heartbeat(last_heartbeat) {
                    warn!(robot_id = %self.robot_id(), "Heartbeat while failed: {}", e);
                }
                control = self.control.lock();
            }
        }
    }

    fn heartbeat(&self, last_heartbeat: &mut Instant) -> Result<(), ClientError> {
        let current = self.lease.lock().clone();
        let renewed = self.robot.renew_lease(&current)?;
        *self.lease.lock() = renewed;
        *last_heartbeat = Instant::now();
        debug!(robot_id = %self.robot_id(), "Lease renewed");
        Ok(())
    }

    /// 单片失败后的恢复动作
    ///
    /// 复位错误后控制器处于暂停，速度要直接下发（不等检查点），恢复运动后
    /// 才能等待回安全点和张开夹爪的确认。
    fn recover(&self) -> Result<(), ClientError> {
        let lease = self.lease.lock().clone();
        let timeout = self.settings.step_timeout;
        self.robot.execute_step(&lease, Command::ResetError, timeout)?;
        self.robot.apply_speed(&lease, self.movement.speed)?;
        self.robot.resume_motion(&lease)?;
        for command in [Command::MovePose(self.calculator.safe_point()), Command::GripperOpen] {
            self.robot.execute_step(&lease, command, timeout)?;
        }
        info!(robot_id = %self.robot_id(), "Recovered to safe point");
        Ok(())
    }

    fn request_abandon(&self) {
        let phase = {
            let mut control = self.control.lock();
            control.abandon_requested = true;
            control.phase
        };
        self.changed.notify_all();

        // 暂停中的在途步骤要靠清空队列才能返回
        if phase == SequencePhase::Paused {
            let lease = self.lease.lock().clone();
            if let Err(e) = self.robot.clear_motion(&lease) {
                debug!(robot_id = %self.robot_id(), "Clear motion on abandon: {}", e);
            }
            if let Err(e) = self.robot.resume_motion(&lease) {
                debug!(robot_id = %self.robot_id(), "Resume on abandon: {}", e);
            }
        }
    }

    fn finish(&self, checkpoint: SequenceCheckpoint, abandoned: bool) {
        let status = if abandoned {
            BatchStatus::Abandoned
        } else if checkpoint.failed.is_empty() {
            BatchStatus::Completed
        } else {
            BatchStatus::PartialSuccess
        };
        let result = BatchResult {
            sequence_id: checkpoint.sequence_id.clone(),
            robot_id: checkpoint.robot_id.clone(),
            kind: checkpoint.kind,
            start: checkpoint.start,
            count: checkpoint.count,
            status,
            completed_items: checkpoint.completed.clone(),
            failed_items: checkpoint.failed.clone(),
            retry: checkpoint.retry,
        };

        let held = abandoned && checkpoint.holding;
        if held {
            // 夹爪中可能有片：保留标记，直到操作员确认
            warn!(
                robot_id = %self.robot_id(),
                sequence_id = %checkpoint.sequence_id,
                "Sequence abandoned with a wafer in the gripper"
            );
            let mut marker = checkpoint.clone();
            marker.abandoned = true;
            marker.touch();
            self.save(&marker);
        } else if let Err(e) = self.store.clear(self.robot_id()) {
            warn!(robot_id = %self.robot_id(), "Failed to clear checkpoint: {}", e);
        }
        self.audit(
            &checkpoint,
            AuditRecord::BatchCompleted {
                start: checkpoint.start + 1,
                count: checkpoint.count,
                status: status.as_str().to_string(),
                completed: result.completed_items.clone(),
                failed: result.failed_items.clone(),
            },
        );
        info!(
            robot_id = %self.robot_id(),
            sequence_id = %result.sequence_id,
            status = status.as_str(),
            completed = result.completed_items.len(),
            failed = ?result.failed_items,
            "Sequence finished"
        );

        {
            let mut control = self.control.lock();
            control.phase = if abandoned {
                SequencePhase::Abandoned
            } else {
                SequencePhase::Completed
            };
            control.pause_requested = false;
            control.retry_requested = false;
            control.abandon_requested = false;
            control.checkpoint = None;
            control.result = Some(result);
            if held {
                control.held_wafer = Some(checkpoint.sequence_id.clone());
            }
        }
        self.changed.notify_all();
        self.publish(&checkpoint, status.as_str(), None, None);
    }

    // ==================== 检查点与记录 ====================

    /// 记录已确认的进度
    fn commit(&self, checkpoint: &mut SequenceCheckpoint) {
        checkpoint.touch();
        self.control.lock().checkpoint = Some(checkpoint.clone());
        self.save(checkpoint);
    }

    fn save(&self, checkpoint: &SequenceCheckpoint) {
        // 存储失败不影响本进程内的恢复，只影响重启后的恢复
        if let Err(e) = self.store.save(checkpoint) {
            error!(robot_id = %self.robot_id(), "Failed to persist checkpoint: {}", e);
        }
    }

    /// 恢复运动前应处于的关节速度
    fn resume_speed(&self, checkpoint: &SequenceCheckpoint) -> Result<f64, SequenceError> {
        let recipe = Recipe::new(checkpoint.kind, &self.calculator, &self.movement);
        if !checkpoint.setup_done {
            let setup = recipe.setup();
            let applied = &setup[..checkpoint.next_step.min(setup.len())];
            return Ok(applied
                .iter()
                .rev()
                .find_map(|s| match s.command {
                    Command::SetJointVel(v) => Some(v),
                    _ => None,
                })
                .unwrap_or(self.movement.speed));
        }
        match checkpoint.current_item() {
            Some(index) => recipe.speed_before(index, checkpoint.next_step, checkpoint.position > 0),
            None => Ok(self.movement.speed),
        }
    }

    fn record_failure(
        &self,
        checkpoint: &mut SequenceCheckpoint,
        item: usize,
        step: &str,
        error: &str,
        recovered: bool,
    ) {
        if !checkpoint.failed.contains(&item) {
            checkpoint.failed.push(item);
        }
        self.audit(
            checkpoint,
            AuditRecord::ItemFailed {
                item,
                step: step.to_string(),
                error: error.to_string(),
                recovered,
            },
        );
        self.publish(checkpoint, "item_failed", Some(item), Some(error.to_string()));
    }

    fn record_paused(&self, reason: &str) {
        let Some(checkpoint) = self.control.lock().checkpoint.clone() else {
            return;
        };
        let item = checkpoint.current_item().map(|i| i + 1);
        self.audit(
            &checkpoint,
            AuditRecord::SequencePaused {
                item,
                step: self.step_name(&checkpoint),
                reason: reason.to_string(),
            },
        );
        self.publish(&checkpoint, "paused", item, Some(reason.to_string()));
    }

    fn record_resumed(&self, checkpoint: &SequenceCheckpoint, speed: f64) {
        let item = checkpoint.current_item().map(|i| i + 1);
        info!(robot_id = %self.robot_id(), ?item, speed, "Sequence resumed");
        self.audit(
            checkpoint,
            AuditRecord::SequenceResumed {
                item,
                step: self.step_name(checkpoint),
                speed,
            },
        );
        self.publish(checkpoint, "resumed", item, None);
    }

    fn step_name(&self, checkpoint: &SequenceCheckpoint) -> Option<String> {
        let recipe = Recipe::new(checkpoint.kind, &self.calculator, &self.movement);
        let steps = if checkpoint.setup_done {
            recipe.item_steps(checkpoint.current_item()?).ok()?
        } else {
            recipe.setup()
        };
        steps
            .get(checkpoint.next_step)
            .map(|step| step.name.to_string())
    }

    fn audit(&self, checkpoint: &SequenceCheckpoint, record: AuditRecord) {
        self.audit.record(&AuditEvent::new(
            &checkpoint.sequence_id,
            &checkpoint.robot_id,
            checkpoint.kind,
            record,
        ));
    }

    fn publish(
        &self,
        checkpoint: &SequenceCheckpoint,
        phase: &str,
        item: Option<usize>,
        detail: Option<String>,
    ) {
        let Some(events) = &self.events else {
            return;
        };
        let total = checkpoint.items.len().max(1);
        let progress = (checkpoint.position.min(total) as f64 / total as f64).clamp(0.0, 1.0);
        let _ = events.send(BroadcastMessage::OperationUpdate(OperationUpdate {
            robot_id: checkpoint.robot_id.clone(),
            operation: checkpoint.kind.as_str().to_string(),
            phase: phase.to_string(),
            item: item.map(|n| n as u32),
            progress,
            detail,
            timestamp_ms: unix_millis(),
        }));
    }
}
