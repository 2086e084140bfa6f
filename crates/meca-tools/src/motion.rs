//! 运动参数、示教位置与序列偏移量
//!
//! 默认值来自现场部署（55 片晶圆，托盘间距 2.7 mm，5 工位铺片机）。

use meca_protocol::Pose;
use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// 速度百分比的合法范围
pub const SPEED_RANGE: std::ops::RangeInclusive<f64> = 0.1..=100.0;

/// 铺片机工位数
pub const SPREADER_SLOTS: usize = 5;

/// 运动参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MovementParams {
    /// 夹爪力（%）
    pub force: f64,
    /// 关节加速度（%）
    pub acc: f64,
    /// 夹持晶圆时的速度（%）
    pub wafer_speed: f64,
    /// 常规移动速度（%）
    pub speed: f64,
    /// 对位速度（%）
    pub align_speed: f64,
    /// 进入狭窄区域的速度（%）
    pub entry_speed: f64,
    /// 空载速度（%）
    pub empty_speed: f64,
    /// 每组 5 片放入铺片机后的等待（秒）
    pub spread_wait_s: f64,
    /// 托盘槽位间距（mm）
    pub gap: f64,
    /// 托盘容量（片）
    pub tray_capacity: usize,
    /// 单步物理完成确认超时
    pub step_timeout_ms: u64,
}

impl Default for MovementParams {
    fn default() -> Self {
        Self {
            force: 100.0,
            acc: 50.0,
            wafer_speed: 35.0,
            speed: 35.0,
            align_speed: 20.0,
            entry_speed: 15.0,
            empty_speed: 50.0,
            spread_wait_s: 25.0,
            gap: 2.7,
            tray_capacity: 55,
            step_timeout_ms: 60_000,
        }
    }
}

impl MovementParams {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("force", self.force),
            ("acc", self.acc),
            ("wafer_speed", self.wafer_speed),
            ("speed", self.speed),
            ("align_speed", self.align_speed),
            ("entry_speed", self.entry_speed),
            ("empty_speed", self.empty_speed),
        ] {
            if !SPEED_RANGE.contains(&value) {
                return Err(ConfigError::invalid(
                    format!("movement.{name}"),
                    format!("{value} outside {}..={}", SPEED_RANGE.start(), SPEED_RANGE.end()),
                ));
            }
        }
        if !(self.spread_wait_s >= 0.0 && self.spread_wait_s.is_finite()) {
            return Err(ConfigError::invalid("movement.spread_wait_s", "must be >= 0"));
        }
        if !(self.gap > 0.0 && self.gap.is_finite()) {
            return Err(ConfigError::invalid("movement.gap", "must be > 0"));
        }
        if self.tray_capacity == 0 {
            return Err(ConfigError::invalid("movement.tray_capacity", "must be non-zero"));
        }
        if self.step_timeout_ms == 0 {
            return Err(ConfigError::invalid("movement.step_timeout_ms", "must be non-zero"));
        }
        Ok(())
    }
}

/// 示教位置（`[x, y, z, rx, ry, rz]`）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PositionsConfig {
    /// 惰性托盘第一片晶圆
    pub first_wafer: [f64; 6],
    /// 铺片机 5 个工位
    pub gen_drop: Vec<[f64; 6]>,
    /// 烘烤托盘第一个槽位
    pub first_baking: [f64; 6],
    /// 安全点
    pub safe_point: [f64; 6],
}

impl Default for PositionsConfig {
    fn default() -> Self {
        Self {
            first_wafer: [173.562, -175.178, 27.9714, 109.5547, 0.2877, -90.059],
            gen_drop: vec![
                [130.2207, 159.230, 123.400, 179.7538, -0.4298, -89.9617],
                [85.5707, 159.4300, 123.400, 179.7538, -0.4298, -89.6617],
                [41.0207, 159.4300, 123.400, 179.7538, -0.4298, -89.6617],
                [-3.5793, 159.3300, 123.400, 179.7538, -0.4298, -89.6617],
                [-47.9793, 159.2300, 123.400, 179.7538, -0.4298, -89.6617],
            ],
            first_baking: [-141.6702, -170.5871, 27.9420, -178.2908, -69.0556, 1.7626],
            safe_point: [135.0, -17.6177, 160.0, 123.2804, 40.9554, -101.3308],
        }
    }
}

impl PositionsConfig {
    pub fn first_wafer(&self) -> Pose {
        Pose::from_array(self.first_wafer)
    }

    pub fn first_baking(&self) -> Pose {
        Pose::from_array(self.first_baking)
    }

    pub fn safe_point(&self) -> Pose {
        Pose::from_array(self.safe_point)
    }

    /// 铺片机工位（`slot` 越界返回 `None`）
    pub fn gen_drop(&self, slot: usize) -> Option<Pose> {
        self.gen_drop.get(slot).copied().map(Pose::from_array)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.gen_drop.len() != SPREADER_SLOTS {
            return Err(ConfigError::invalid(
                "positions.gen_drop",
                format!("expected {SPREADER_SLOTS} positions, got {}", self.gen_drop.len()),
            ));
        }

        let named = [
            ("first_wafer", &self.first_wafer),
            ("first_baking", &self.first_baking),
            ("safe_point", &self.safe_point),
        ];
        for (name, values) in named
            .into_iter()
            .chain(self.gen_drop.iter().map(|p| ("gen_drop", p)))
        {
            if values.iter().any(|v| !v.is_finite()) {
                return Err(ConfigError::invalid(
                    format!("positions.{name}"),
                    format!("non-finite coordinate in {values:?}"),
                ));
            }
        }
        Ok(())
    }
}

/// 三轴偏移（mm）
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AxisOffset {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl AxisOffset {
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// 在 `pose` 上叠加偏移
    pub fn apply(&self, pose: Pose) -> Pose {
        pose.translated(self.x, self.y, self.z)
    }
}

/// 取片（惰性托盘 → 铺片机）的相对偏移
///
/// `intermediate_*` 逐级叠加：`intermediate_2` 相对 `intermediate_1`，依此类推。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PickupOffsets {
    pub pickup_high: AxisOffset,
    pub intermediate_1: AxisOffset,
    pub intermediate_2: AxisOffset,
    pub intermediate_3: AxisOffset,
    pub above_spreader_z: f64,
    pub above_spreader_exit_z: f64,
}

impl Default for PickupOffsets {
    fn default() -> Self {
        Self {
            pickup_high: AxisOffset::new(0.0, 0.2, 11.9286),
            intermediate_1: AxisOffset::new(0.0, -0.2, 2.8),
            intermediate_2: AxisOffset::new(0.0, -0.8, 2.7),
            intermediate_3: AxisOffset::new(0.0, -11.5595, 38.4),
            above_spreader_z: 40.4987,
            above_spreader_exit_z: 56.4987,
        }
    }
}

/// 放片（铺片机 → 烘烤托盘）的相对偏移
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DropOffsets {
    pub above_spreader_z: f64,
    pub above_spreader_pickup_z: f64,
    /// 相对烘烤槽位的 4 个对位点（由高到低）
    pub baking_align: [AxisOffset; 4],
    pub baking_up_z: f64,
}

impl Default for DropOffsets {
    fn default() -> Self {
        Self {
            above_spreader_z: 36.6,
            above_spreader_pickup_z: 25.4987,
            baking_align: [
                AxisOffset::new(-9.7, 0.3, 32.058),
                AxisOffset::new(-7.7, 0.3, 22.0),
                AxisOffset::new(-2.1, 0.3, 6.0),
                AxisOffset::new(-0.7, 0.3, 2.8),
            ],
            baking_up_z: 29.458,
        }
    }
}

/// 各序列的偏移量
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SequenceOffsets {
    pub pickup: PickupOffsets,
    pub drop: DropOffsets,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_movement_is_valid() {
        MovementParams::default().validate().unwrap();
    }

    #[test]
    fn test_speed_out_of_range() {
        let params = MovementParams {
            align_speed: 0.05,
            ..Default::default()
        };
        let err = params.validate().unwrap_err();
        assert!(err.to_string().contains("movement.align_speed"), "{err}");

        let params = MovementParams {
            speed: 120.0,
            ..Default::default()
        };
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_gen_drop_requires_five_positions() {
        let mut positions = PositionsConfig::default();
        positions.validate().unwrap();

        positions.gen_drop.pop();
        let err = positions.validate().unwrap_err();
        assert!(err.to_string().contains("expected 5 positions, got 4"), "{err}");
    }

    #[test]
    fn test_gen_drop_lookup() {
        let positions = PositionsConfig::default();
        assert_eq!(positions.gen_drop(0).unwrap().x, 130.2207);
        assert_eq!(positions.gen_drop(4).unwrap().x, -47.9793);
        assert!(positions.gen_drop(5).is_none());
    }

    #[test]
    fn test_axis_offset_apply() {
        let pose = Pose::new(1.0, 2.0, 3.0, 90.0, 0.0, -90.0);
        let moved = AxisOffset::new(0.5, -1.0, 10.0).apply(pose);
        assert_eq!(moved, Pose::new(1.5, 1.0, 13.0, 90.0, 0.0, -90.0));
    }
}
