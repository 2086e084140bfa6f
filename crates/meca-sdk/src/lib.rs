//! Meca SDK - Mecademic 机械臂 Rust SDK
//!
//! 面向晶圆取放工站的机械臂控制核心，分层如下：
//!
//! - **协议层** (`protocol`): ASCII 帧编解码、命令与响应码
//! - **传输层** (`transport`): 绑定网卡 / 源 IP 的 TCP 连接与重试
//! - **驱动层** (`driver`): 控制与监控两条连接、遥测快照、检查点确认
//! - **服务层** (`client`): 租约、熔断器、原子状态、急停、状态广播
//! - **序列层** (`control`): 可恢复的批量取片 / 放片
//! - **API** ([`RobotApi`]): 统一 `{success, data, error}` 信封
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use meca_sdk::prelude::*;
//!
//! meca_sdk::init_logger();
//! let api = RobotApi::from_config(SystemConfig::load_from_file("meca.toml")?)?;
//! api.acquire_lease("meca", "operator", None).into_result()?;
//! api.connect_safe("meca", "operator").into_result()?;
//! api.confirm_activation("meca", "operator").into_result()?;
//! api.start_sequence("meca", "operator", SequenceKind::Pickup, 0, 5)
//!     .into_result()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod api;
pub mod logging;
pub mod prelude;

pub use meca_client as client;
pub use meca_control as control;
pub use meca_driver as driver;
pub use meca_protocol as protocol;
pub use meca_tools as tools;
pub use meca_transport as transport;

pub use api::{ApiResult, LeaseInfo, RobotApi, SequenceStatus};
pub use logging::init_logger;

// 错误类型
pub use meca_client::{ApiError, ClientError};
pub use meca_control::SequenceError;
pub use meca_driver::DriverError;
pub use meca_protocol::ProtocolError;
pub use meca_tools::ConfigError;
pub use meca_transport::TransportError;
