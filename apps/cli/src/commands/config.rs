//! 配置管理命令
//!
//! 查看、检查和初始化系统配置文件

use anyhow::{Context, Result};
use clap::Subcommand;
use meca_sdk::tools::SystemConfig;
use std::fs;

use crate::session::SessionOptions;

/// 配置命令
#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// 打印生效的配置（TOML）
    Show,

    /// 检查配置
    Check,

    /// 写入默认配置
    Init {
        /// 覆盖已存在的文件
        #[arg(long)]
        force: bool,
    },
}

impl ConfigCommand {
    pub fn execute(self, options: &SessionOptions) -> Result<()> {
        match self {
            ConfigCommand::Show => Self::show_(options),
            ConfigCommand::Check => Self::check_(options),
            ConfigCommand::Init { force } => Self::init_(options, force),
        }
    }

    fn show_(options: &SessionOptions) -> Result<()> {
        let config = options.load_config()?;
        print!("{}", config.to_toml_string()?);
        Ok(())
    }

    fn check_(options: &SessionOptions) -> Result<()> {
        let path = options.config_path()?;
        let config = options.load_config()?;

        println!("配置文件: {}", path.display());
        println!("机械臂:");
        for robot in &config.robots {
            println!(
                "  {}: {}:{} / {} (绑定: {})",
                robot.robot_id,
                robot.ip,
                robot.control_port,
                robot.monitor_port,
                robot.bind.as_deref().unwrap_or("-")
            );
            println!(
                "    租约 {} ms, 心跳 {} ms",
                robot.lease_duration_ms, robot.heartbeat_interval_ms
            );
        }
        println!(
            "运动参数: speed {}, align {}, empty {}, tray {}",
            config.movement.speed,
            config.movement.align_speed,
            config.movement.empty_speed,
            config.movement.tray_capacity
        );
        println!("✅ 配置有效");
        Ok(())
    }

    fn init_(options: &SessionOptions, force: bool) -> Result<()> {
        let path = options.config_path()?;
        if path.exists() && !force {
            anyhow::bail!("配置文件已存在: {}（使用 --force 覆盖）", path.display());
        }

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).context("创建配置目录失败")?;
        }
        SystemConfig::default().save_to_file(&path)?;

        println!("✅ 已写入默认配置: {}", path.display());
        Ok(())
    }
}
