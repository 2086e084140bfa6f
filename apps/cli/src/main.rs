//! # Meca CLI
//!
//! Command-line interface for Mecademic robot arm control.
//!
//! 每个命令独立执行（One-shot）：读取配置 → 获取租约 → 连接 → 执行 → 释放。
//!
//! ```bash
//! # 检查配置（默认 ~/.config/meca/config.toml）
//! meca-cli config check
//!
//! # 查询状态
//! meca-cli status
//!
//! # 移动到位姿（x,y,z,rx,ry,rz）
//! meca-cli move --pose 135,-17.6,160,123.3,40.9,-101.3
//!
//! # 批量取片：从第 0 片开始，共 5 片（Ctrl+C 触发急停）
//! meca-cli batch pickup --start 0 --count 5
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod session;
mod validation;

use commands::{
    ActivateCommand, BatchCommand, ConfigCommand, MonitorCommand, MoveCommand, RecoverCommand,
    SpeedCommand, StatusCommand, StopCommand,
};
use session::SessionOptions;

/// Meca CLI - 机械臂命令行工具
#[derive(Parser, Debug)]
#[command(name = "meca-cli")]
#[command(about = "Command-line interface for Mecademic robot arm control", long_about = None)]
#[command(version)]
struct Cli {
    /// 配置文件路径（默认 ~/.config/meca/config.toml）
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// 目标机械臂 ID（默认配置中的第一台）
    #[arg(short, long, global = true)]
    robot: Option<String>,

    /// 租约持有者 ID
    #[arg(long, global = true, default_value = "meca-cli")]
    holder: String,

    /// 跳过确认提示
    #[arg(short, long, global = true)]
    yes: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 配置管理
    #[command(subcommand)]
    Config(ConfigCommand),

    /// 查询机械臂状态
    Status {
        #[command(flatten)]
        args: StatusCommand,
    },

    /// 连接并激活机械臂
    Activate {
        #[command(flatten)]
        args: ActivateCommand,
    },

    /// 移动到目标位姿或关节角
    Move {
        #[command(flatten)]
        args: MoveCommand,
    },

    /// 设置关节速度百分比
    Speed {
        #[command(flatten)]
        args: SpeedCommand,
    },

    /// 恢复模式下安全回零
    Recover {
        #[command(flatten)]
        args: RecoverCommand,
    },

    /// 急停
    Stop {
        #[command(flatten)]
        args: StopCommand,
    },

    /// 监控状态流
    Monitor {
        #[command(flatten)]
        args: MonitorCommand,
    },

    /// 批量取放片
    #[command(subcommand)]
    Batch(BatchCommand),
}

fn main() -> Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("meca_cli=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let options = SessionOptions {
        config: cli.config,
        robot: cli.robot,
        holder: cli.holder,
        assume_yes: cli.yes,
    };

    match cli.command {
        Commands::Config(cmd) => cmd.execute(&options),
        Commands::Status { args } => args.execute(&options),
        Commands::Activate { args } => args.execute(&options),
        Commands::Move { args } => args.execute(&options),
        Commands::Speed { args } => args.execute(&options),
        Commands::Recover { args } => args.execute(&options),
        Commands::Stop { args } => args.execute(&options),
        Commands::Monitor { args } => args.execute(&options),
        Commands::Batch(cmd) => cmd.execute(&options),
    }
}
