//! 状态查询命令

use anyhow::Result;
use clap::Args;
use meca_sdk::client::StatusSnapshot;
use meca_sdk::SequenceStatus;
use std::thread;
use std::time::Duration;

use crate::session::{Session, SessionOptions};

/// 状态命令参数
#[derive(Args, Debug)]
pub struct StatusCommand {
    /// 先连接以读取实时遥测
    #[arg(long)]
    pub connect: bool,

    /// 以 JSON 输出
    #[arg(long)]
    pub json: bool,
}

impl StatusCommand {
    pub fn execute(&self, options: &SessionOptions) -> Result<()> {
        let mut session = Session::open(options)?;
        if self.connect {
            session.connect()?;
            // 等待第一帧遥测
            thread::sleep(Duration::from_millis(300));
        }

        let api = session.api();
        let status = api.get_status(session.robot_id()).into_result()?;
        let sequence = api.sequence_status(session.robot_id()).into_result()?;

        if self.json {
            let value = serde_json::json!({
                "status": status,
                "sequence": sequence,
            });
            println!("{}", serde_json::to_string_pretty(&value)?);
        } else {
            print_status(&status);
            print_sequence(&sequence);
        }
        Ok(())
    }
}

pub fn print_status(status: &StatusSnapshot) {
    println!("机械臂: {}", status.robot_id);
    println!("  状态:     {:?}", status.state);
    println!(
        "  连接: {}  激活: {}  回零: {}  错误: {}  暂停: {}",
        yes_no(status.connected),
        yes_no(status.activated),
        yes_no(status.homed),
        yes_no(status.error),
        yes_no(status.paused)
    );
    println!("  遥测:     {}", if status.monitor_healthy { "正常" } else { "静默" });
    println!("  租约:     {}", status.lease_holder.as_deref().unwrap_or("(无)"));

    let [x, y, z, rx, ry, rz] = status.pose;
    println!("  位姿 (mm / °):");
    println!("    X: {:8.3}  Y: {:8.3}  Z: {:8.3}", x, y, z);
    println!("    Rx: {:7.3}  Ry: {:7.3}  Rz: {:7.3}", rx, ry, rz);

    println!("  关节角 (°):");
    for (i, angle) in status.joints.iter().enumerate() {
        print!("  J{}: {:7.2}", i + 1, angle);
    }
    println!();
}

fn print_sequence(sequence: &SequenceStatus) {
    println!("序列:       {}", sequence.phase.as_str());
    if let Some(checkpoint) = &sequence.checkpoint {
        println!(
            "  检查点:   {} {} 起点 {} 共 {} 片，已完成 {:?}，失败 {:?}",
            checkpoint.sequence_id,
            checkpoint.kind,
            checkpoint.start,
            checkpoint.count,
            checkpoint.completed,
            checkpoint.failed
        );
    }
    if let Some(result) = &sequence.last_result {
        println!(
            "  上一批次: {} ({:.0}%)",
            result.status.as_str(),
            result.success_rate() * 100.0
        );
    }
}

fn yes_no(value: bool) -> &'static str {
    if value { "是" } else { "否" }
}
