//! 命令定义和实现

pub mod activate;
pub mod batch;
pub mod config;
pub mod monitor;
pub mod r#move;
pub mod recover;
pub mod speed;
pub mod status;
pub mod stop;

pub use activate::ActivateCommand;
pub use batch::BatchCommand;
pub use config::ConfigCommand;
pub use monitor::MonitorCommand;
pub use r#move::MoveCommand;
pub use recover::RecoverCommand;
pub use speed::SpeedCommand;
pub use status::StatusCommand;
pub use stop::StopCommand;
