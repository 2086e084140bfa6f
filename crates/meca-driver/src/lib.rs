//! # Meca Driver
//!
//! Mecademic 机械臂驱动层：
//!
//! - 控制连接（一问一答，命令闸门保证同一时刻只有一条命令在途）
//! - 监控连接（独立线程，ArcSwap 无锁状态快照）
//! - 检查点确认（运动队列命令的物理完成）
//! - 急停优先路径（不排在任何命令之后）
//!
//! 大多数用户应该使用 `meca-client` 提供的 `RobotService`，它在此之上叠加了
//! 租约、熔断器与原子状态管理。
//!
//! ## 连接失效的处理
//!
//! | 情况 | 处理 |
//! |------|------|
//! | 控制连接读超时（socket 仍在） | 只读查询重发，不关闭连接 |
//! | 控制连接 socket 失败 | 关闭、按重试策略重连、`session_generation` 加 1，返回 `ConnectionLost` |
//! | 监控连接静默超时 | 只重连监控连接 |

mod checkpoint;
mod config;
mod control;
mod driver;
mod error;
pub mod freshness;
mod monitor;
pub mod state;

#[cfg(feature = "mock")]
pub mod mock;

pub use checkpoint::{CheckpointTicket, CheckpointTracker};
pub use config::{DEFAULT_CONTROL_PORT, DEFAULT_MONITOR_PORT, DriverConfig, ParameterSet};
pub use driver::ProtocolDriver;
pub use error::DriverError;
pub use freshness::TelemetryWatch;
pub use state::{DriverContext, RobotStatus};

#[cfg(feature = "mock")]
pub use mock::{FakeMecaServer, FakeServerConfig};
