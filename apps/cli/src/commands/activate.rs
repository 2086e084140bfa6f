//! 激活命令
//!
//! 连接、激活并回零，用于上电后的首次检查

use anyhow::Result;
use clap::Args;

use crate::commands::status::print_status;
use crate::session::{Session, SessionOptions};

/// 激活命令参数
#[derive(Args, Debug)]
pub struct ActivateCommand {}

impl ActivateCommand {
    pub fn execute(&self, options: &SessionOptions) -> Result<()> {
        let mut session = Session::open(options)?;
        session.activate()?;

        let status = session.api().get_status(session.robot_id()).into_result()?;
        print_status(&status);
        Ok(())
    }
}
