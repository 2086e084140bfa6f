//! 安全回零命令
//!
//! 关节越限或位置未知导致无法回零时使用：恢复模式下低速移到配置的安全关节位，再回零

use anyhow::Result;
use clap::Args;
use meca_sdk::client::RECOVERY_SPEED_LIMIT;

use crate::commands::status::print_status;
use crate::session::{Session, SessionOptions};

/// 安全回零参数
#[derive(Args, Debug)]
pub struct RecoverCommand {
    /// 移动速度百分比（超过 20 按 20 执行）
    #[arg(short, long, default_value_t = RECOVERY_SPEED_LIMIT)]
    pub speed: f64,
}

impl RecoverCommand {
    pub fn execute(&self, options: &SessionOptions) -> Result<()> {
        if !(self.speed > 0.0 && self.speed <= 100.0) {
            anyhow::bail!("速度必须在 (0, 100] 之间，得到 {}", self.speed);
        }

        let mut session = Session::open(options)?;
        session.connect()?;
        let safe_joints = session
            .api()
            .config()
            .robot(session.robot_id())?
            .safe_joints;
        if !session.confirm(&format!(
            "机械臂 {} 将在恢复模式下移动到 {:?}，确定要继续吗？",
            session.robot_id(),
            safe_joints
        ))? {
            anyhow::bail!("操作已取消");
        }

        println!("🛟 安全回零（速度 {}%）...", self.speed.min(RECOVERY_SPEED_LIMIT));
        session
            .api()
            .safe_home(session.robot_id(), session.holder(), Some(self.speed))
            .into_result()?;
        println!("✅ 已回零");

        let status = session.api().get_status(session.robot_id()).into_result()?;
        print_status(&status);
        Ok(())
    }
}
