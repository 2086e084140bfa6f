//! 监控命令
//!
//! 订阅状态流并打印，Ctrl+C 退出

use anyhow::Result;
use clap::Args;
use meca_sdk::client::BroadcastMessage;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::commands::status::print_status;
use crate::session::{Session, SessionOptions};

/// 监控命令参数
#[derive(Args, Debug)]
pub struct MonitorCommand {
    /// 打印频率（Hz）
    #[arg(short, long, default_value_t = 2)]
    pub frequency: u32,

    /// 同时打印命令结果和序列进度
    #[arg(long)]
    pub events: bool,
}

impl MonitorCommand {
    pub fn execute(&self, options: &SessionOptions) -> Result<()> {
        let mut session = Session::open(options)?;
        session.connect()?;

        let subscription = session.api().subscribe(Some(session.robot_id()));
        println!("📊 监控中 ({} Hz)...", self.frequency);
        println!("按 Ctrl+C 停止\n");

        // 设置 Ctrl+C 处理
        let running = Arc::new(AtomicBool::new(true));
        let r = running.clone();
        ctrlc::set_handler(move || {
            r.store(false, Ordering::SeqCst);
        })?;

        let interval = if self.frequency > 0 {
            Duration::from_secs_f64(1.0 / self.frequency as f64)
        } else {
            Duration::from_secs(1)
        };
        let heartbeat = session
            .api()
            .config()
            .robot(session.robot_id())?
            .heartbeat_interval();
        let mut last_print: Option<Instant> = None;
        let mut last_heartbeat = Instant::now();

        while running.load(Ordering::SeqCst) {
            if last_heartbeat.elapsed() >= heartbeat {
                session.acquire()?;
                last_heartbeat = Instant::now();
            }

            let Some(message) = subscription.recv_timeout(Duration::from_millis(200)) else {
                continue;
            };
            match message {
                BroadcastMessage::StatusUpdate(status) => {
                    if last_print.is_none_or(|t| t.elapsed() >= interval) {
                        println!("========================================");
                        print_status(&status);
                        last_print = Some(Instant::now());
                    }
                },
                BroadcastMessage::CommandResponse(response) if self.events => {
                    println!("📨 {}", serde_json::to_string(&response)?);
                },
                BroadcastMessage::OperationUpdate(update) if self.events => {
                    println!(
                        "📦 {} {} {:.0}%{}",
                        update.operation,
                        update.phase,
                        update.progress * 100.0,
                        update.item.map(|i| format!(" (第 {} 片)", i)).unwrap_or_default()
                    );
                },
                _ => {},
            }
        }

        session.api().unsubscribe(subscription.id());
        println!("\n✅ 监控已结束");
        Ok(())
    }
}
