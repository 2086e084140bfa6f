//! 序列步骤表
//!
//! 每种序列由一段准备步骤（只在全新开始时执行）和逐片的步骤表组成。
//! 每一步带有恢复策略，决定中断后能否原样重发：
//!
//! | 策略 | 步骤 | 恢复时 |
//! |------|------|--------|
//! | `SetupOnly` | 准备段全部步骤（含 `GripperOpen`） | 跳过；手里可能夹着片子，张开会掉片 |
//! | `Reissue` | 绝对位姿移动、延时、速度/过渡设置 | 重发，结果与执行一次相同 |
//! | `Grip` | `GripperClose` | 重发；已夹住时再夹一次无副作用 |
//! | `ReleaseAtTarget` | 放片位置的 `GripperOpen` | 只有机械臂仍在释放位姿时才重发 |
//!
//! 检查点只记录已确认完成的步骤，恢复时从未确认的那一步开始，之前的步骤绝不重发。

use meca_protocol::{Command, Pose};
use meca_tools::MovementParams;
use serde::{Deserialize, Serialize};

use crate::{PositionCalculator, SequenceError};

const TORQUE_LIMIT: f64 = 40.0;

/// 序列类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SequenceKind {
    /// 惰性托盘 → 铺片机
    Pickup,
    /// 铺片机 → 烘烤托盘
    Drop,
}

impl SequenceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SequenceKind::Pickup => "pickup",
            SequenceKind::Drop => "drop",
        }
    }
}

impl std::fmt::Display for SequenceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SequenceKind {
    type Err = SequenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pickup" => Ok(SequenceKind::Pickup),
            "drop" => Ok(SequenceKind::Drop),
            other => Err(SequenceError::InvalidBatch(format!(
                "unknown sequence kind {other:?}"
            ))),
        }
    }
}

/// 中断后的恢复策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumePolicy {
    SetupOnly,
    Reissue,
    Grip,
    ReleaseAtTarget,
}

/// 单个步骤
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Step {
    pub name: &'static str,
    pub command: Command,
    pub policy: ResumePolicy,
}

impl Step {
    const fn new(name: &'static str, command: Command, policy: ResumePolicy) -> Self {
        Self {
            name,
            command,
            policy,
        }
    }

    const fn reissue(name: &'static str, command: Command) -> Self {
        Self::new(name, command, ResumePolicy::Reissue)
    }

    const fn setup(name: &'static str, command: Command) -> Self {
        Self::new(name, command, ResumePolicy::SetupOnly)
    }
}

/// 某种序列在给定参数下的步骤表
#[derive(Debug, Clone, Copy)]
pub struct Recipe<'a> {
    kind: SequenceKind,
    calculator: &'a PositionCalculator,
    movement: &'a MovementParams,
}

impl<'a> Recipe<'a> {
    pub fn new(
        kind: SequenceKind,
        calculator: &'a PositionCalculator,
        movement: &'a MovementParams,
    ) -> Self {
        Self {
            kind,
            calculator,
            movement,
        }
    }

    pub fn kind(&self) -> SequenceKind {
        self.kind
    }

    /// 准备段（只在全新开始时执行）
    pub fn setup(&self) -> Vec<Step> {
        match self.kind {
            SequenceKind::Pickup => vec![
                Step::setup("set_gripper_force", Command::SetGripperForce(self.movement.force)),
                Step::setup("set_joint_acc", Command::SetJointAcc(self.movement.acc)),
                Step::setup("set_torque_limits", Command::SetTorqueLimits([TORQUE_LIMIT; 6])),
                Step::setup("set_torque_limits_cfg", Command::SetTorqueLimitsCfg(2, 1)),
                Step::setup("disable_blending", Command::SetBlending(0.0)),
                Step::setup("set_align_speed", Command::SetJointVel(self.movement.align_speed)),
                Step::setup("set_conf", Command::SetConf(1, 1, 1)),
                Step::setup("open_gripper", Command::GripperOpen),
                Step::setup("settle", Command::Delay(1.0)),
            ],
            SequenceKind::Drop => Vec::new(),
        }
    }

    /// 第 `index` 片（从 0 开始）的步骤表
    pub fn item_steps(&self, index: usize) -> Result<Vec<Step>, SequenceError> {
        match self.kind {
            SequenceKind::Pickup => self.pickup_steps(index),
            SequenceKind::Drop => self.drop_steps(index),
        }
    }

    fn pickup_steps(&self, index: usize) -> Result<Vec<Step>, SequenceError> {
        let p = self.calculator.pickup_positions(index)?;
        let safe = self.calculator.safe_point();
        let m = self.movement;

        let mut steps = vec![
            Step::reissue("move_to_pickup_high", Command::MovePose(p.pickup_high)),
            Step::reissue("move_to_pickup", Command::MovePose(p.pickup)),
            Step::reissue("delay_before_grip", Command::Delay(1.0)),
            Step::new("grip_wafer", Command::GripperClose, ResumePolicy::Grip),
            Step::reissue("delay_after_grip", Command::Delay(1.0)),
            Step::reissue("set_wafer_speed", Command::SetJointVel(m.wafer_speed)),
            Step::reissue("move_intermediate_1", Command::MovePose(p.intermediate[0])),
            Step::reissue("enable_blending", Command::SetBlending(100.0)),
            Step::reissue("move_intermediate_2", Command::MovePose(p.intermediate[1])),
            Step::reissue("move_intermediate_3", Command::MoveLin(p.intermediate[2])),
            Step::reissue("disable_blending", Command::SetBlending(0.0)),
            Step::reissue("move_to_safe", Command::MovePose(safe)),
            Step::reissue("set_align_speed", Command::SetJointVel(m.align_speed)),
            Step::reissue("move_above_spreader", Command::MovePose(p.above_spreader)),
            Step::reissue("move_to_spreader", Command::MovePose(p.spreader)),
            Step::reissue("delay_before_release", Command::Delay(1.0)),
            Step::new("release_wafer", Command::GripperOpen, ResumePolicy::ReleaseAtTarget),
            Step::reissue("delay_after_release", Command::Delay(1.0)),
            Step::reissue("exit_spreader", Command::MovePose(p.above_spreader_exit)),
            Step::reissue("set_empty_speed", Command::SetJointVel(m.empty_speed)),
            Step::reissue("return_to_safe", Command::MovePose(safe)),
        ];
        // 每填满一轮铺片机工位等待铺片
        if PositionCalculator::spreader_slot(index) == 0 {
            steps.push(Step::reissue("spread_wait", Command::Delay(m.spread_wait_s)));
        }
        Ok(steps)
    }

    fn drop_steps(&self, index: usize) -> Result<Vec<Step>, SequenceError> {
        let d = self.calculator.drop_positions(index)?;
        let safe = self.calculator.safe_point();
        let m = self.movement;

        Ok(vec![
            Step::reissue("set_align_speed", Command::SetJointVel(m.align_speed)),
            Step::reissue("move_above_spreader", Command::MovePose(d.above_spreader)),
            Step::reissue("delay_above_spreader", Command::Delay(1.0)),
            Step::reissue("move_to_spreader", Command::MovePose(d.spreader)),
            Step::reissue("delay_at_spreader", Command::Delay(1.0)),
            Step::new("grip_wafer", Command::GripperClose, ResumePolicy::Grip),
            Step::reissue("delay_after_grip", Command::Delay(1.0)),
            Step::reissue("move_up_from_spreader", Command::MovePose(d.above_spreader_pickup)),
            Step::reissue("set_travel_speed", Command::SetJointVel(m.speed)),
            Step::reissue("move_to_safe", Command::MovePose(safe)),
            Step::reissue("move_baking_align_1", Command::MovePose(d.baking_align[0])),
            Step::reissue("set_align_speed_baking", Command::SetJointVel(m.align_speed)),
            Step::reissue("enable_blending", Command::SetBlending(100.0)),
            Step::reissue("move_baking_align_2", Command::MovePose(d.baking_align[1])),
            Step::reissue("move_baking_align_3", Command::MovePose(d.baking_align[2])),
            Step::reissue("move_baking_align_4", Command::MovePose(d.baking_align[3])),
            Step::reissue("delay_before_release", Command::Delay(1.0)),
            Step::new("release_wafer", Command::GripperOpen, ResumePolicy::ReleaseAtTarget),
            Step::reissue("delay_after_release", Command::Delay(0.5)),
            Step::reissue("move_up_from_baking", Command::MovePose(d.baking_up)),
            Step::reissue("set_return_speed", Command::SetJointVel(m.speed)),
            Step::reissue("disable_blending", Command::SetBlending(0.0)),
            Step::reissue("return_to_safe", Command::MovePose(safe)),
        ])
    }

    /// 恢复到第 `index` 片第 `step` 步之前应处于的关节速度
    ///
    /// 依次查找本片已完成步骤、上一片（所有片的收尾速度相同）、准备段中最后一次
    /// `SetJointVel`；都没有时取常规速度。
    pub fn speed_before(
        &self,
        index: usize,
        step: usize,
        after_previous_item: bool,
    ) -> Result<f64, SequenceError> {
        let steps = self.item_steps(index)?;
        let last_speed = |steps: &[Step]| {
            steps.iter().rev().find_map(|s| match s.command {
                Command::SetJointVel(v) => Some(v),
                _ => None,
            })
        };

        let within_item = last_speed(&steps[..step.min(steps.len())]);
        let before_item = if after_previous_item {
            last_speed(&steps)
        } else {
            last_speed(&self.setup())
        };
        Ok(within_item
            .or(before_item)
            .unwrap_or(self.movement.speed))
    }

    /// 恢复在 `step` 之前最近一次移动的目标位姿（`ReleaseAtTarget` 的核对基准）
    pub fn release_target(&self, index: usize, step: usize) -> Result<Option<Pose>, SequenceError> {
        let steps = self.item_steps(index)?;
        Ok(steps[..step.min(steps.len())]
            .iter()
            .rev()
            .find_map(|s| match s.command {
                Command::MovePose(pose) | Command::MoveLin(pose) => Some(pose),
                _ => None,
            }))
    }
}
