//! 急停命令
//!
//! 软件急停：清空运动队列并暂停控制器

use anyhow::Result;
use clap::Args;

use crate::session::{Session, SessionOptions};

/// 急停命令参数
#[derive(Args, Debug)]
pub struct StopCommand {
    /// 急停配置中的所有机械臂
    #[arg(long)]
    pub all: bool,
}

impl StopCommand {
    pub fn execute(&self, options: &SessionOptions) -> Result<()> {
        let mut session = Session::open(options)?;

        if self.all {
            let config = options.load_config()?;
            for robot in &config.robots {
                let holder = session.holder().to_string();
                let api = session.api();
                // 急停需要一条控制连接
                let connected = api
                    .acquire_lease(&robot.robot_id, &holder, None)
                    .into_result()
                    .and_then(|_| api.connect_safe(&robot.robot_id, &holder).into_result());
                if let Err(e) = connected {
                    eprintln!("⚠️  {}: {}", robot.robot_id, e);
                }
            }

            println!("🛑 发送急停命令（全部）...");
            let unreachable = session.api().emergency_stop_all().into_result()?;
            if unreachable.is_empty() {
                println!("✅ 急停完成");
            } else {
                println!("⚠️  急停未送达: {}", unreachable.join(", "));
            }

            for robot in &config.robots {
                let _ = session.api().release_lease(&robot.robot_id, session.holder());
            }
            return Ok(());
        }

        session.connect()?;
        println!("🛑 发送急停命令...");
        session.api().emergency_stop(session.robot_id()).into_result()?;
        println!("✅ 急停完成");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_command_defaults() {
        let cmd = StopCommand { all: false };
        assert!(!cmd.all);
    }
}
