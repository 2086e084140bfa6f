//! 位置计算
//!
//! 所有路径点都由示教位置加偏移得到：
//!
//! - 惰性托盘：`first_wafer` 沿 y 方向每片偏移 `gap`
//! - 烘烤托盘：`first_baking` 沿 x 方向每片偏移 `gap`
//! - 铺片机：第 `i` 片放在 `gen_drop[4 - i % 5]`

use meca_protocol::Pose;
use meca_tools::{MovementParams, PositionsConfig, SPREADER_SLOTS, SequenceOffsets};

use crate::SequenceError;

/// 取片路径点
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PickupPositions {
    pub pickup_high: Pose,
    pub pickup: Pose,
    pub intermediate: [Pose; 3],
    pub above_spreader: Pose,
    pub spreader: Pose,
    pub above_spreader_exit: Pose,
}

/// 放片路径点
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DropPositions {
    pub above_spreader: Pose,
    pub spreader: Pose,
    pub above_spreader_pickup: Pose,
    pub baking_align: [Pose; 4],
    pub baking_up: Pose,
}

/// 位置计算器
#[derive(Debug, Clone)]
pub struct PositionCalculator {
    positions: PositionsConfig,
    offsets: SequenceOffsets,
    gap: f64,
    capacity: usize,
}

impl PositionCalculator {
    pub fn new(
        positions: PositionsConfig,
        offsets: SequenceOffsets,
        movement: &MovementParams,
    ) -> Result<Self, SequenceError> {
        positions.validate()?;
        movement.validate()?;
        Ok(Self {
            positions,
            offsets,
            gap: movement.gap,
            capacity: movement.tray_capacity,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn safe_point(&self) -> Pose {
        self.positions.safe_point()
    }

    /// 惰性托盘上第 `index` 片（从 0 开始）
    pub fn wafer_position(&self, index: usize) -> Result<Pose, SequenceError> {
        self.check_index(index)?;
        Ok(self
            .positions
            .first_wafer()
            .translated(0.0, self.gap * index as f64, 0.0))
    }

    /// 烘烤托盘上第 `index` 个槽位
    pub fn baking_position(&self, index: usize) -> Result<Pose, SequenceError> {
        self.check_index(index)?;
        Ok(self
            .positions
            .first_baking()
            .translated(self.gap * index as f64, 0.0, 0.0))
    }

    /// 铺片机工位（倒序轮转）
    pub fn spreader_slot(index: usize) -> usize {
        SPREADER_SLOTS - 1 - (index % SPREADER_SLOTS)
    }

    pub fn pickup_positions(&self, index: usize) -> Result<PickupPositions, SequenceError> {
        let offsets = &self.offsets.pickup;
        let pickup = self.wafer_position(index)?;
        let intermediate_1 = offsets.intermediate_1.apply(pickup);
        let intermediate_2 = offsets.intermediate_2.apply(intermediate_1);
        let intermediate_3 = offsets.intermediate_3.apply(intermediate_2);
        let spreader = self.spreader(index)?;

        Ok(PickupPositions {
            pickup_high: offsets.pickup_high.apply(pickup),
            pickup,
            intermediate: [intermediate_1, intermediate_2, intermediate_3],
            above_spreader: spreader.translated(0.0, 0.0, offsets.above_spreader_z),
            spreader,
            above_spreader_exit: spreader.translated(0.0, 0.0, offsets.above_spreader_exit_z),
        })
    }

    pub fn drop_positions(&self, index: usize) -> Result<DropPositions, SequenceError> {
        let offsets = &self.offsets.drop;
        let spreader = self.spreader(index)?;
        let baking = self.baking_position(index)?;

        Ok(DropPositions {
            above_spreader: spreader.translated(0.0, 0.0, offsets.above_spreader_z),
            spreader,
            above_spreader_pickup: spreader.translated(0.0, 0.0, offsets.above_spreader_pickup_z),
            baking_align: offsets.baking_align.map(|offset| offset.apply(baking)),
            baking_up: baking.translated(0.0, 0.0, offsets.baking_up_z),
        })
    }

    fn spreader(&self, index: usize) -> Result<Pose, SequenceError> {
        let slot = Self::spreader_slot(index);
        self.positions.gen_drop(slot).ok_or_else(|| {
            SequenceError::InvalidBatch(format!("spreader slot {slot} is not configured"))
        })
    }

    fn check_index(&self, index: usize) -> Result<(), SequenceError> {
        if index >= self.capacity {
            return Err(SequenceError::ItemOutOfRange {
                index,
                capacity: self.capacity,
            });
        }
        Ok(())
    }
}
