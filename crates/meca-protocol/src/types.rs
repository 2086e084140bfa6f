//! 协议值类型
//!
//! 位姿单位：位置 mm，姿态 °（欧拉角 α/β/γ）。关节角单位：°。

use crate::ProtocolError;

/// 笛卡尔位姿 `[x, y, z, α, β, γ]`
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Pose {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub rx: f64,
    pub ry: f64,
    pub rz: f64,
}

impl Pose {
    pub const fn new(x: f64, y: f64, z: f64, rx: f64, ry: f64, rz: f64) -> Self {
        Self {
            x,
            y,
            z,
            rx,
            ry,
            rz,
        }
    }

    pub const fn from_array(values: [f64; 6]) -> Self {
        Self::new(
            values[0], values[1], values[2], values[3], values[4], values[5],
        )
    }

    pub const fn to_array(&self) -> [f64; 6] {
        [self.x, self.y, self.z, self.rx, self.ry, self.rz]
    }

    /// 平移（姿态不变）
    pub fn translated(&self, dx: f64, dy: f64, dz: f64) -> Self {
        Self {
            x: self.x + dx,
            y: self.y + dy,
            z: self.z + dz,
            ..*self
        }
    }

    pub(crate) fn from_slice(context: &str, values: &[f64]) -> Result<Self, ProtocolError> {
        let array: [f64; 6] = values.try_into().map_err(|_| ProtocolError::InvalidArity {
            command: context.to_string(),
            expected: 6,
            actual: values.len(),
        })?;
        Ok(Self::from_array(array))
    }

    pub(crate) fn is_finite(&self) -> bool {
        self.to_array().iter().all(|v| v.is_finite())
    }
}

/// 六轴关节角
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct JointSet(pub [f64; 6]);

impl JointSet {
    pub(crate) fn from_slice(context: &str, values: &[f64]) -> Result<Self, ProtocolError> {
        let array: [f64; 6] = values.try_into().map_err(|_| ProtocolError::InvalidArity {
            command: context.to_string(),
            expected: 6,
            actual: values.len(),
        })?;
        Ok(Self(array))
    }
}

/// 机器人状态位（`GetStatusRobot` / 监控端口 `[2007]`）
///
/// 线格式：`[as,hs,sm,es,pm,eob,eom]`，每位取 0/1。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StatusFlags {
    /// 电机已使能
    pub activated: bool,
    /// 已回零
    pub homed: bool,
    /// 仿真模式
    pub simulation: bool,
    /// 处于错误状态
    pub error: bool,
    /// 运动已暂停
    pub paused: bool,
    /// 运动队列为空且已停止（End of Block）
    pub end_of_block: bool,
    /// 当前运动结束（End of Movement）
    pub end_of_movement: bool,
}

impl StatusFlags {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let values = crate::parse_numbers("status", text)?;
        if values.len() != 7 {
            return Err(ProtocolError::InvalidArity {
                command: "status".to_string(),
                expected: 7,
                actual: values.len(),
            });
        }

        let bit = |index: usize| -> Result<bool, ProtocolError> {
            match values[index] {
                v if v == 0.0 => Ok(false),
                v if v == 1.0 => Ok(true),
                v => Err(ProtocolError::invalid_value("status bit", v)),
            }
        };

        Ok(Self {
            activated: bit(0)?,
            homed: bit(1)?,
            simulation: bit(2)?,
            error: bit(3)?,
            paused: bit(4)?,
            end_of_block: bit(5)?,
            end_of_movement: bit(6)?,
        })
    }

    pub fn encode(&self) -> String {
        let b = |v: bool| if v { '1' } else { '0' };
        format!(
            "{},{},{},{},{},{},{}",
            b(self.activated),
            b(self.homed),
            b(self.simulation),
            b(self.error),
            b(self.paused),
            b(self.end_of_block),
            b(self.end_of_movement)
        )
    }

    /// 可以执行运动（使能、回零、无错误）
    pub fn ready_for_motion(&self) -> bool {
        self.activated && self.homed && !self.error
    }
}
