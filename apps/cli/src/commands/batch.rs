//! 批量取放片命令
//!
//! 批次在后台线程运行，本命令只负责等待和交互：
//! - Ctrl+C：急停，随后选择继续、放弃或保留检查点退出
//! - 单片恢复失败：选择重试该片、放弃或保留检查点退出
//! - 部分成功：`--retry`（一轮）或确认后只重试失败的片

use anyhow::Result;
use clap::{Args, Subcommand};
use meca_sdk::control::{BatchResult, BatchStatus, SequenceKind, SequencePhase};
use std::process;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::warn;

use crate::session::{Session, SessionOptions};

const POLL: Duration = Duration::from_millis(200);

/// 批次范围参数
#[derive(Args, Debug)]
pub struct BatchRange {
    /// 起始片序号（从 0 开始）
    #[arg(short, long, default_value_t = 0)]
    pub start: usize,

    /// 片数
    #[arg(short = 'n', long)]
    pub count: usize,

    /// 部分成功时自动重试失败的片
    #[arg(long)]
    pub retry: bool,
}

/// 批次命令
#[derive(Subcommand, Debug)]
pub enum BatchCommand {
    /// 惰性托盘 → 铺片机
    Pickup(BatchRange),

    /// 铺片机 → 烘烤托盘
    Drop(BatchRange),

    /// 从上次保留的检查点继续
    Resume,

    /// 放弃上次保留的检查点
    Abandon,

    /// 确认夹爪已空（夹持中放弃批次后必须执行）
    ConfirmEmpty,
}

/// 中断后的选择
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Choice {
    Continue,
    Abandon,
    Exit,
}

impl std::fmt::Display for Choice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Choice::Continue => "继续",
            Choice::Abandon => "放弃批次",
            Choice::Exit => "保留检查点并退出",
        })
    }
}

impl BatchCommand {
    pub fn execute(self, options: &SessionOptions) -> Result<()> {
        let mut session = Session::open(options)?;

        match self {
            BatchCommand::Abandon => {
                session.acquire()?;
                session
                    .api()
                    .abandon_sequence(session.robot_id(), session.holder())
                    .into_result()?;
                println!("✅ 检查点已清除");
                Ok(())
            },
            BatchCommand::ConfirmEmpty => {
                if !session.confirm("夹爪中的片已人工取出？")? {
                    anyhow::bail!("操作已取消");
                }
                session.acquire()?;
                session
                    .api()
                    .confirm_gripper_empty(session.robot_id(), session.holder())
                    .into_result()?;
                println!("✅ 可以开始新批次");
                Ok(())
            },
            BatchCommand::Resume => {
                let status = session.api().sequence_status(session.robot_id()).into_result()?;
                let Some(checkpoint) = status.checkpoint else {
                    anyhow::bail!("没有可恢复的检查点");
                };
                println!(
                    "📍 检查点 {}: {} 起点 {} 共 {} 片，已完成 {:?}",
                    checkpoint.sequence_id,
                    checkpoint.kind,
                    checkpoint.start,
                    checkpoint.count,
                    checkpoint.completed
                );

                session.activate()?;
                session
                    .api()
                    .resume_sequence(session.robot_id(), session.holder())
                    .into_result()?;
                supervise(&session, false)
            },
            BatchCommand::Pickup(range) => run(&mut session, SequenceKind::Pickup, &range),
            BatchCommand::Drop(range) => run(&mut session, SequenceKind::Drop, &range),
        }
    }
}

fn run(session: &mut Session, kind: SequenceKind, range: &BatchRange) -> Result<()> {
    session.activate()?;

    let sequence_id = session
        .api()
        .start_sequence(session.robot_id(), session.holder(), kind, range.start, range.count)
        .into_result()?;
    println!(
        "📦 {} {}: 第 {}–{} 片",
        kind,
        sequence_id,
        range.start + 1,
        range.start + range.count
    );

    supervise(session, range.retry)
}

/// 等待批次结束，处理急停、失败和重试
fn supervise(session: &Session, auto_retry: bool) -> Result<()> {
    let api = session.api();
    let (robot, holder) = (session.robot_id(), session.holder());

    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = interrupted.clone();
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
    })?;
    println!("按 Ctrl+C 急停\n");

    loop {
        if interrupted.swap(false, Ordering::SeqCst) {
            println!("\n🛑 急停...");
            if let Err(e) = api.emergency_stop(robot).into_result() {
                warn!(robot_id = %robot, "Emergency stop failed: {}", e);
            }
            wait_for_phase(session, &[SequencePhase::Paused, SequencePhase::Failed]);

            match choose(session, "批次已急停，接下来？")? {
                Choice::Continue => {
                    api.clear_emergency_stop(robot, holder).into_result()?;
                    api.resume_sequence(robot, holder).into_result()?;
                    println!("▶️  已恢复");
                },
                Choice::Abandon => {
                    api.abandon_sequence(robot, holder).into_result()?;
                    api.clear_emergency_stop(robot, holder).into_result()?;
                },
                Choice::Exit => exit_keeping_checkpoint(),
            }
            continue;
        }

        if let Some(result) = api.wait_for_batch(robot, POLL) {
            print_result(&result);
            if !should_retry(session, &result, auto_retry)? {
                return Ok(());
            }
            api.retry_failed_items(robot, holder).into_result()?;
            println!("🔁 重试 {:?}", result.failed_items);
            continue;
        }

        let phase = api.sequence_status(robot).into_result()?.phase;
        if phase == SequencePhase::Failed {
            match choose(session, "当前片恢复失败，接下来？")? {
                Choice::Continue => api.resume_sequence(robot, holder).into_result()?,
                Choice::Abandon => api.abandon_sequence(robot, holder).into_result()?,
                Choice::Exit => exit_keeping_checkpoint(),
            }
        }
    }
}

fn should_retry(session: &Session, result: &BatchResult, auto_retry: bool) -> Result<bool> {
    if result.status != BatchStatus::PartialSuccess {
        return Ok(false);
    }
    // 自动重试只做一轮
    if auto_retry {
        return Ok(!result.retry);
    }
    if session.assume_yes() {
        return Ok(false);
    }
    session.confirm("重试失败的片？")
}

fn wait_for_phase(session: &Session, phases: &[SequencePhase]) {
    for _ in 0..50 {
        let phase = session
            .api()
            .sequence_status(session.robot_id())
            .into_result()
            .map(|s| s.phase);
        if phase.is_ok_and(|p| phases.contains(&p)) {
            return;
        }
        std::thread::sleep(POLL / 2);
    }
}

/// `--yes` 时不继续运动，保留检查点退出
fn choose(session: &Session, message: &str) -> Result<Choice> {
    if session.assume_yes() {
        return Ok(Choice::Exit);
    }

    let choice = inquire::Select::new(message, vec![Choice::Continue, Choice::Abandon, Choice::Exit])
        .prompt();
    match choice {
        Ok(choice) => Ok(choice),
        Err(inquire::InquireError::OperationInterrupted | inquire::InquireError::OperationCanceled) => {
            Ok(Choice::Exit)
        },
        Err(e) => Err(anyhow::anyhow!("用户交互失败: {}", e)),
    }
}

/// 直接退出进程，不经过引擎的放弃流程
fn exit_keeping_checkpoint() -> ! {
    println!("💾 检查点已保留，使用 `meca-cli batch resume` 继续");
    process::exit(130);
}

fn print_result(result: &BatchResult) {
    let icon = match result.status {
        BatchStatus::Completed => "✅",
        BatchStatus::PartialSuccess => "⚠️ ",
        BatchStatus::Abandoned => "❌",
    };
    println!(
        "{} {} {}: {}（成功率 {:.0}%）",
        icon,
        result.kind,
        result.sequence_id,
        result.status.as_str(),
        result.success_rate() * 100.0
    );
    if !result.completed_items.is_empty() {
        println!("  完成: {:?}", result.completed_items);
    }
    if !result.failed_items.is_empty() {
        println!("  失败: {:?}", result.failed_items);
    }
}
