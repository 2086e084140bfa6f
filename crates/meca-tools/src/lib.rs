//! # Meca Tools - 共享配置数据结构
//!
//! **依赖原则**: 只依赖 `meca-protocol`，避免依赖 `meca-client`
//!
//! ## 包含模块
//!
//! - `robot` - 单台机械臂的连接配置
//! - `motion` - 运动参数、示教位置、序列偏移量
//! - `settings` - 熔断器、租约清扫、状态广播设置
//! - `config` - 系统配置（TOML 加载与校验）
//!
//! 核心层只接收解析好的 [`RobotConfig`] 等对象，读取文件由应用层（CLI）负责。

mod config;
mod error;
pub mod motion;
pub mod robot;
pub mod settings;

pub use config::SystemConfig;
pub use error::ConfigError;
pub use motion::{
    AxisOffset, DropOffsets, MovementParams, PickupOffsets, PositionsConfig, SPEED_RANGE,
    SPREADER_SLOTS, SequenceOffsets,
};
pub use robot::RobotConfig;
pub use settings::{BreakerSettings, BreakerThresholds, BroadcasterSettings, LeaseSettings};
