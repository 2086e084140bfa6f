//! 命令构建与解析
//!
//! 线格式为 `Name(arg1,arg2,...)` 或无参数的 `Name`，发送时追加一个 NUL 结尾。
//! 浮点参数使用 Rust 最短往返表示，保证 `decode(encode(cmd)) == cmd`。
//!
//! # 命令分类
//!
//! - **Immediate**：控制器立即应答，应答码集合由 [`Command::expected_replies`] 给出
//! - **Queued**：进入运动队列，成功时无应答；物理完成通过 `SetCheckpoint(n)` 确认

use std::fmt;
use std::str::FromStr;

use smallvec::SmallVec;

use crate::response::codes;
use crate::types::{JointSet, Pose};
use crate::{ProtocolError, parse_numbers};

/// 关节速度/加速度等百分比参数的下限
pub const MIN_PERCENT: f64 = 0.1;
/// 检查点编号范围（控制器限制）
pub const CHECKPOINT_RANGE: std::ops::RangeInclusive<u32> = 1..=8000;

/// 命令执行方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// 立即执行并应答
    Immediate,
    /// 进入运动队列（成功无应答）
    Queued,
}

/// 控制端口命令
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    ActivateRobot,
    DeactivateRobot,
    Home,
    ResetError,
    ClearMotion,
    PauseMotion,
    ResumeMotion,
    GetStatusRobot,
    GetJoints,
    GetPose,
    /// 恢复模式：放宽关节限位，速度上限 20%
    SetRecoveryMode(bool),
    MovePose(Pose),
    MoveLin(Pose),
    MoveJoints(JointSet),
    /// 关节速度（%）
    SetJointVel(f64),
    /// 关节加速度（%）
    SetJointAcc(f64),
    /// 轨迹融合（%）
    SetBlending(f64),
    /// 姿态配置（肩/肘/腕，取 ±1）
    SetConf(i8, i8, i8),
    /// 夹爪力（%）
    SetGripperForce(f64),
    /// 六轴力矩限制（%）
    SetTorqueLimits([f64; 6]),
    /// 力矩超限处理策略（severity, skip_acceleration）
    SetTorqueLimitsCfg(u8, u8),
    GripperOpen,
    GripperClose,
    /// 夹爪开口（mm）
    MoveGripper(f64),
    /// 队列内延时（秒）
    Delay(f64),
    SetCheckpoint(u32),
}

impl Command {
    /// 命令名（线格式中的函数名）
    pub fn name(&self) -> &'static str {
        match self {
            Command::ActivateRobot => "ActivateRobot",
            Command::DeactivateRobot => "DeactivateRobot",
            Command::Home => "Home",
            Command::ResetError => "ResetError",
            Command::ClearMotion => "ClearMotion",
            Command::PauseMotion => "PauseMotion",
            Command::ResumeMotion => "ResumeMotion",
            Command::GetStatusRobot => "GetStatusRobot",
            Command::GetJoints => "GetJoints",
            Command::GetPose => "GetPose",
            Command::SetRecoveryMode(_) => "SetRecoveryMode",
            Command::MovePose(_) => "MovePose",
            Command::MoveLin(_) => "MoveLin",
            Command::MoveJoints(_) => "MoveJoints",
            Command::SetJointVel(_) => "SetJointVel",
            Command::SetJointAcc(_) => "SetJointAcc",
            Command::SetBlending(_) => "SetBlending",
            Command::SetConf(..) => "SetConf",
            Command::SetGripperForce(_) => "SetGripperForce",
            Command::SetTorqueLimits(_) => "SetTorqueLimits",
            Command::SetTorqueLimitsCfg(..) => "SetTorqueLimitsCfg",
            Command::GripperOpen => "GripperOpen",
            Command::GripperClose => "GripperClose",
            Command::MoveGripper(_) => "MoveGripper",
            Command::Delay(_) => "Delay",
            Command::SetCheckpoint(_) => "SetCheckpoint",
        }
    }

    pub fn kind(&self) -> CommandKind {
        if self.expected_replies().is_empty() {
            CommandKind::Queued
        } else {
            CommandKind::Immediate
        }
    }

    /// 是否产生物理运动（这类命令失败后不可自动重试）
    pub fn is_motion(&self) -> bool {
        matches!(
            self,
            Command::MovePose(_)
                | Command::MoveLin(_)
                | Command::MoveJoints(_)
                | Command::GripperOpen
                | Command::GripperClose
                | Command::MoveGripper(_)
                | Command::Home
        )
    }

    /// 只读查询（可安全重试）
    pub fn is_query(&self) -> bool {
        matches!(
            self,
            Command::GetStatusRobot | Command::GetJoints | Command::GetPose
        )
    }

    /// Immediate 命令的成功应答码；Queued 命令返回空切片
    pub fn expected_replies(&self) -> &'static [u16] {
        match self {
            Command::ActivateRobot => &[codes::MOTORS_ACTIVATED],
            Command::DeactivateRobot => &[codes::MOTORS_DEACTIVATED],
            Command::Home => &[codes::HOMING_DONE, codes::HOMING_ALREADY_DONE],
            Command::ResetError => &[codes::ERROR_RESET, codes::NO_ERROR_TO_RESET],
            Command::ClearMotion => &[codes::MOTION_CLEARED],
            Command::PauseMotion => &[codes::MOTION_PAUSED],
            Command::ResumeMotion => &[codes::MOTION_RESUMED],
            Command::GetStatusRobot => &[codes::STATUS_ROBOT],
            Command::GetJoints => &[codes::JOINTS],
            Command::GetPose => &[codes::POSE],
            Command::SetRecoveryMode(true) => &[codes::RECOVERY_MODE_ON],
            Command::SetRecoveryMode(false) => &[codes::RECOVERY_MODE_OFF],
            _ => &[],
        }
    }

    /// 参数范围检查
    pub fn validate(&self) -> Result<(), ProtocolError> {
        fn percent(field: &str, value: f64, min: f64, max: f64) -> Result<(), ProtocolError> {
            if value.is_finite() && (min..=max).contains(&value) {
                Ok(())
            } else {
                Err(ProtocolError::invalid_value(field, value))
            }
        }

        match *self {
            Command::MovePose(pose) | Command::MoveLin(pose) => {
                if pose.is_finite() {
                    Ok(())
                } else {
                    Err(ProtocolError::invalid_value("pose", format!("{pose:?}")))
                }
            },
            Command::MoveJoints(joints) => {
                if joints.0.iter().all(|v| v.is_finite()) {
                    Ok(())
                } else {
                    Err(ProtocolError::invalid_value("joints", format!("{joints:?}")))
                }
            },
            Command::SetJointVel(v) => percent("joint_vel", v, MIN_PERCENT, 100.0),
            Command::SetJointAcc(v) => percent("joint_acc", v, MIN_PERCENT, 600.0),
            Command::SetBlending(v) => percent("blending", v, 0.0, 100.0),
            Command::SetGripperForce(v) => percent("gripper_force", v, 5.0, 100.0),
            Command::SetTorqueLimits(limits) => limits
                .iter()
                .try_for_each(|v| percent("torque_limit", *v, MIN_PERCENT, 100.0)),
            Command::SetConf(a, b, c) => {
                if [a, b, c].iter().all(|v| *v == 1 || *v == -1) {
                    Ok(())
                } else {
                    Err(ProtocolError::invalid_value("conf", format!("{a},{b},{c}")))
                }
            },
            Command::SetTorqueLimitsCfg(severity, skip) => {
                if severity <= 4 && skip <= 1 {
                    Ok(())
                } else {
                    Err(ProtocolError::invalid_value(
                        "torque_limits_cfg",
                        format!("{severity},{skip}"),
                    ))
                }
            },
            Command::MoveGripper(v) => percent("gripper_opening", v, 0.0, 100.0),
            Command::Delay(v) => {
                if v.is_finite() && v >= 0.0 {
                    Ok(())
                } else {
                    Err(ProtocolError::invalid_value("delay", v))
                }
            },
            Command::SetCheckpoint(n) => {
                if CHECKPOINT_RANGE.contains(&n) {
                    Ok(())
                } else {
                    Err(ProtocolError::invalid_value("checkpoint", n))
                }
            },
            _ => Ok(()),
        }
    }

    /// 编码为线格式文本（不含 NUL 结尾）
    pub fn encode(&self) -> String {
        let args: SmallVec<[String; 6]> = match *self {
            Command::MovePose(pose) | Command::MoveLin(pose) => {
                pose.to_array().iter().map(f64::to_string).collect()
            },
            Command::MoveJoints(joints) => joints.0.iter().map(f64::to_string).collect(),
            Command::SetTorqueLimits(limits) => limits.iter().map(f64::to_string).collect(),
            Command::SetJointVel(v)
            | Command::SetJointAcc(v)
            | Command::SetBlending(v)
            | Command::SetGripperForce(v)
            | Command::MoveGripper(v)
            | Command::Delay(v) => smallvec::smallvec![v.to_string()],
            Command::SetConf(a, b, c) => {
                smallvec::smallvec![a.to_string(), b.to_string(), c.to_string()]
            },
            Command::SetTorqueLimitsCfg(a, b) => smallvec::smallvec![a.to_string(), b.to_string()],
            Command::SetCheckpoint(n) => smallvec::smallvec![n.to_string()],
            Command::SetRecoveryMode(enabled) => smallvec::smallvec![u8::from(enabled).to_string()],
            _ => SmallVec::new(),
        };

        if args.is_empty() {
            self.name().to_string()
        } else {
            format!("{}({})", self.name(), args.join(","))
        }
    }

    /// 从线格式文本解析（容忍首尾空白与 NUL）
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let text = text.trim_matches(|c: char| c.is_whitespace() || c == '\0');
        if text.is_empty() {
            return Err(ProtocolError::MalformedFrame(text.to_string()));
        }

        let (name, args) = match text.find('(') {
            Some(open) => {
                let close = text
                    .rfind(')')
                    .filter(|close| *close == text.len() - 1 && *close > open)
                    .ok_or_else(|| ProtocolError::MalformedFrame(text.to_string()))?;
                (text[..open].trim(), &text[open + 1..close])
            },
            None => (text, ""),
        };

        let values = parse_numbers(name, args)?;
        let arity = |expected: usize| -> Result<(), ProtocolError> {
            if values.len() == expected {
                Ok(())
            } else {
                Err(ProtocolError::InvalidArity {
                    command: name.to_string(),
                    expected,
                    actual: values.len(),
                })
            }
        };
        let integer = |value: f64, field: &str| -> Result<i64, ProtocolError> {
            if value.fract() == 0.0 && value.is_finite() {
                Ok(value as i64)
            } else {
                Err(ProtocolError::invalid_value(field, value))
            }
        };

        let command = match name {
            "ActivateRobot" => arity(0).map(|_| Command::ActivateRobot)?,
            "DeactivateRobot" => arity(0).map(|_| Command::DeactivateRobot)?,
            "Home" => arity(0).map(|_| Command::Home)?,
            "ResetError" => arity(0).map(|_| Command::ResetError)?,
            "ClearMotion" => arity(0).map(|_| Command::ClearMotion)?,
            "PauseMotion" => arity(0).map(|_| Command::PauseMotion)?,
            "ResumeMotion" => arity(0).map(|_| Command::ResumeMotion)?,
            "GetStatusRobot" => arity(0).map(|_| Command::GetStatusRobot)?,
            "GetJoints" => arity(0).map(|_| Command::GetJoints)?,
            "GetPose" => arity(0).map(|_| Command::GetPose)?,
            "GripperOpen" => arity(0).map(|_| Command::GripperOpen)?,
            "GripperClose" => arity(0).map(|_| Command::GripperClose)?,
            "MovePose" => Command::MovePose(Pose::from_slice(name, &values)?),
            "MoveLin" => Command::MoveLin(Pose::from_slice(name, &values)?),
            "MoveJoints" => Command::MoveJoints(JointSet::from_slice(name, &values)?),
            "SetTorqueLimits" => {
                Command::SetTorqueLimits(JointSet::from_slice(name, &values)?.0)
            },
            "SetJointVel" => arity(1).map(|_| Command::SetJointVel(values[0]))?,
            "SetJointAcc" => arity(1).map(|_| Command::SetJointAcc(values[0]))?,
            "SetBlending" => arity(1).map(|_| Command::SetBlending(values[0]))?,
            "SetGripperForce" => arity(1).map(|_| Command::SetGripperForce(values[0]))?,
            "MoveGripper" => arity(1).map(|_| Command::MoveGripper(values[0]))?,
            "Delay" => arity(1).map(|_| Command::Delay(values[0]))?,
            "SetConf" => {
                arity(3)?;
                let conf = |v: f64| -> Result<i8, ProtocolError> {
                    i8::try_from(integer(v, "conf")?)
                        .map_err(|_| ProtocolError::invalid_value("conf", v))
                };
                Command::SetConf(conf(values[0])?, conf(values[1])?, conf(values[2])?)
            },
            "SetRecoveryMode" => {
                arity(1)?;
                match integer(values[0], "recovery_mode")? {
                    0 => Command::SetRecoveryMode(false),
                    1 => Command::SetRecoveryMode(true),
                    _ => return Err(ProtocolError::invalid_value("recovery_mode", values[0])),
                }
            },
            "SetTorqueLimitsCfg" => {
                arity(2)?;
                let small = |v: f64| -> Result<u8, ProtocolError> {
                    u8::try_from(integer(v, "torque_limits_cfg")?)
                        .map_err(|_| ProtocolError::invalid_value("torque_limits_cfg", v))
                };
                Command::SetTorqueLimitsCfg(small(values[0])?, small(values[1])?)
            },
            "SetCheckpoint" => {
                arity(1)?;
                let n = u32::try_from(integer(values[0], "checkpoint")?)
                    .map_err(|_| ProtocolError::invalid_value("checkpoint", values[0]))?;
                Command::SetCheckpoint(n)
            },
            other => return Err(ProtocolError::UnknownCommand(other.to_string())),
        };

        command.validate()?;
        Ok(command)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl FromStr for Command {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Command::decode(s)
    }
}
