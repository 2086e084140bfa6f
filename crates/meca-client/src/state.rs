//! 原子状态管理
//!
//! 每台机械臂一个 `AtomicU8` 单元，所有状态变更都是比较交换（CAS），
//! 读取不加锁、不阻塞。单元表本身由 `ArcSwap` 持有，注册新机械臂时整体替换。
//!
//! # 转换规则
//!
//! ```text
//! Idle   ──► Busy | Paused | Error
//! Busy   ──► Idle | Paused | Error
//! Paused ──► Idle | Busy   | Error
//! Error  ──► Idle
//! 任意   ──► EmergencyStopped            （emergency_stop，无条件覆盖）
//! EmergencyStopped ──► Idle              （只能通过 clear_emergency_stop）
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::ClientError;

/// 机械臂操作状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum OperationState {
    Idle = 0,
    Busy = 1,
    Paused = 2,
    Error = 3,
    EmergencyStopped = 4,
}

impl OperationState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => OperationState::Idle,
            1 => OperationState::Busy,
            2 => OperationState::Paused,
            3 => OperationState::Error,
            _ => OperationState::EmergencyStopped,
        }
    }

    /// 普通转换是否合法（不含急停的进入与解除）
    pub fn can_transition_to(self, target: OperationState) -> bool {
        use OperationState::*;
        match (self, target) {
            (EmergencyStopped, _) => false,
            (_, EmergencyStopped) => true,
            (Idle, Busy | Paused | Error) => true,
            (Busy, Idle | Paused | Error) => true,
            (Paused, Idle | Busy | Error) => true,
            (Error, Idle) => true,
            _ => false,
        }
    }
}

type StateCells = HashMap<String, Arc<AtomicU8>>;

/// 原子状态管理器
#[derive(Debug)]
pub struct AtomicStateManager {
    cells: ArcSwap<StateCells>,
    /// 只串行化注册，不影响读取与 CAS
    register_lock: Mutex<()>,
}

impl Default for AtomicStateManager {
    fn default() -> Self {
        Self::new()
    }
}

impl AtomicStateManager {
    pub fn new() -> Self {
        Self {
            cells: ArcSwap::from_pointee(HashMap::new()),
            register_lock: Mutex::new(()),
        }
    }

    /// 注册机械臂（初始 Idle，已注册则保持原状态）
    pub fn register(&self, robot_id: &str) {
        let _guard = self.register_lock.lock();
        if self.cells.load().contains_key(robot_id) {
            return;
        }
        let mut next = StateCells::clone(&self.cells.load());
        next.insert(
            robot_id.to_string(),
            Arc::new(AtomicU8::new(OperationState::Idle as u8)),
        );
        self.cells.store(Arc::new(next));
    }

    fn cell(&self, robot_id: &str) -> Option<Arc<AtomicU8>> {
        self.cells.load().get(robot_id).cloned()
    }

    /// 当前状态（不阻塞）
    pub fn get_state(&self, robot_id: &str) -> Option<OperationState> {
        self.cells
            .load()
            .get(robot_id)
            .map(|cell| OperationState::from_u8(cell.load(Ordering::Acquire)))
    }

    pub fn is_emergency_stopped(&self, robot_id: &str) -> bool {
        self.get_state(robot_id) == Some(OperationState::EmergencyStopped)
    }

    /// 比较交换：当前为 `expected` 时改为 `target`
    pub fn set_state(&self, robot_id: &str, expected: OperationState, target: OperationState) -> bool {
        self.transition(robot_id, expected, target).is_ok()
    }

    /// 同 [`set_state`](Self::set_state)，失败时返回实际状态
    pub fn transition(
        &self,
        robot_id: &str,
        expected: OperationState,
        target: OperationState,
    ) -> Result<(), ClientError> {
        let invalid = |actual| ClientError::InvalidTransition {
            robot_id: robot_id.to_string(),
            actual,
            target,
        };

        let cell = self.cell(robot_id).ok_or_else(|| invalid(None))?;
        if expected != target && !expected.can_transition_to(target) {
            return Err(invalid(Some(expected)));
        }

        cell.compare_exchange(
            expected as u8,
            target as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        )
        .map(|_| ())
        .map_err(|actual| invalid(Some(OperationState::from_u8(actual))))
    }

    /// 进入急停（无条件覆盖任何状态），返回之前的状态
    pub fn emergency_stop(&self, robot_id: &str) -> Option<OperationState> {
        let cell = self.cell(robot_id)?;
        let previous =
            OperationState::from_u8(cell.swap(OperationState::EmergencyStopped as u8, Ordering::AcqRel));
        if previous != OperationState::EmergencyStopped {
            warn!(robot_id, "Operation state {:?} -> EmergencyStopped", previous);
        }
        Some(previous)
    }

    /// 显式解除急停（EmergencyStopped → Idle）
    pub fn clear_emergency_stop(&self, robot_id: &str) -> Result<(), ClientError> {
        let cell = self.cell(robot_id).ok_or_else(|| ClientError::UnknownRobot(robot_id.to_string()))?;
        cell.compare_exchange(
            OperationState::EmergencyStopped as u8,
            OperationState::Idle as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        )
        .map(|_| info!(robot_id, "Emergency stop cleared"))
        .map_err(|actual| ClientError::InvalidTransition {
            robot_id: robot_id.to_string(),
            actual: Some(OperationState::from_u8(actual)),
            target: OperationState::Idle,
        })
    }

    /// 所有机械臂的状态
    pub fn snapshot(&self) -> Vec<(String, OperationState)> {
        let cells = self.cells.load();
        let mut states: Vec<_> = cells
            .iter()
            .map(|(id, cell)| (id.clone(), OperationState::from_u8(cell.load(Ordering::Acquire))))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }
}
