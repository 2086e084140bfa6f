//! 速度命令

use anyhow::Result;
use clap::Args;

use crate::session::{Session, SessionOptions};

/// 速度命令参数
#[derive(Args, Debug)]
pub struct SpeedCommand {
    /// 关节速度百分比（0, 100]
    pub percent: f64,
}

impl SpeedCommand {
    pub fn execute(&self, options: &SessionOptions) -> Result<()> {
        if !(self.percent > 0.0 && self.percent <= 100.0) {
            anyhow::bail!("速度必须在 (0, 100] 之间，得到 {}", self.percent);
        }

        let mut session = Session::open(options)?;
        session.activate()?;
        session
            .api()
            .set_velocity(session.robot_id(), session.holder(), self.percent)
            .into_result()?;

        println!("✅ 关节速度: {}%", self.percent);
        Ok(())
    }
}
