//! 服务层模块
//!
//! 在 [`meca_driver`] 之上叠加独占访问与故障保护：
//! - 租约（[`ResourceLockManager`]，心跳续期，后台清扫过期租约）
//! - 熔断器（[`CircuitBreaker`]，建连与常规命令分别计数）
//! - 原子状态（[`AtomicStateManager`]，急停粘滞）
//! - 单一入口（[`RobotService`]）与显式注册表（[`RobotRegistry`]）
//! - 状态广播（[`StatusBroadcaster`]，每订阅者独立缓冲，满了丢最旧）
//!
//! # 使用场景
//!
//! 序列引擎（`meca-control`）和 API 层只通过 [`RobotService`] 操作机械臂，
//! 从不直接调用驱动。

pub mod broadcaster;
pub mod circuit_breaker;
mod error;
pub mod events;
pub mod lock;
mod registry;
pub mod service;
pub mod state;

pub use broadcaster::{EventPublisher, StatusBroadcaster, StatusSource, Subscription};
pub use circuit_breaker::{BreakerState, CircuitBreaker};
pub use error::{ApiError, ClientError};
pub use events::{BroadcastMessage, CommandResponse, OperationUpdate, StatusSnapshot};
pub use lock::{Lease, LeaseSweeper, ResourceLockManager};
pub use registry::RobotRegistry;
pub use service::{DEFAULT_SPEED, RECOVERY_SPEED_LIMIT, RobotService, driver_config};
pub use state::{AtomicStateManager, OperationState};
