//! 协议驱动（对外 API）
//!
//! 管理两条连接：
//!
//! - 控制连接：严格一问一答，由 `command_gate` 保证同一时刻只有一条命令在途
//! - 监控连接：只读遥测，独立线程
//!
//! 控制连接在整个会话期间保持打开；关闭重开会让控制器丢失使能/回零状态。
//! 因此读超时（连接仍在）只对只读查询重发，不关闭连接；
//! socket 级失败则关闭、按重试策略重连，并通过 [`session_generation`](ProtocolDriver::session_generation)
//! 通知上层必须重新激活。

use std::sync::Arc;
use std::time::Duration;

use meca_protocol::{Command, JointSet, Pose, Response, StatusFlags, codes};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::checkpoint::{CheckpointTicket, CheckpointTracker};
use crate::control::ControlSession;
use crate::monitor::MonitorWorker;
use crate::{DriverConfig, DriverContext, DriverError, ParameterSet, RobotStatus};

/// Mecademic 协议驱动
pub struct ProtocolDriver {
    config: DriverConfig,
    ctx: Arc<DriverContext>,
    tracker: Arc<CheckpointTracker>,
    control: RwLock<Option<Arc<ControlSession>>>,
    /// 控制连接上同一时刻只允许一条命令在途
    command_gate: Mutex<()>,
    monitor: Mutex<Option<MonitorWorker>>,
}

impl ProtocolDriver {
    /// 建立控制与监控连接（不激活、不回零）
    pub fn connect(config: DriverConfig) -> Result<Self, DriverError> {
        let ctx = Arc::new(DriverContext::new(config.monitor_silence_timeout()));
        let driver = Self {
            config,
            ctx,
            tracker: Arc::new(CheckpointTracker::new()),
            control: RwLock::new(None),
            command_gate: Mutex::new(()),
            monitor: Mutex::new(None),
        };

        driver.open_control()?;
        let worker = MonitorWorker::start(&driver.config, driver.ctx.clone())?;
        *driver.monitor.lock() = Some(worker);

        info!(
            "Connected to {} (control {}, monitor {})",
            driver.config.host, driver.config.control_port, driver.config.monitor_port
        );
        Ok(driver)
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// 共享上下文（状态快照、遥测新鲜度）
    pub fn context(&self) -> &Arc<DriverContext> {
        &self.ctx
    }

    /// 最新状态快照（来自监控连接，无锁）
    pub fn status(&self) -> Arc<RobotStatus> {
        self.ctx.status()
    }

    /// 控制会话代数；变化意味着控制连接被重建，控制器需要重新激活
    pub fn session_generation(&self) -> u64 {
        self.ctx.session_generation()
    }

    pub fn is_connected(&self) -> bool {
        self.control
            .read()
            .as_ref()
            .is_some_and(|session| session.is_alive())
    }

    /// 遥测在静默阈值内
    pub fn is_monitor_healthy(&self) -> bool {
        self.monitor.lock().as_ref().is_some_and(MonitorWorker::is_running)
            && self.ctx.is_monitor_connected()
            && self.ctx.telemetry.is_fresh()
    }

    fn open_control(&self) -> Result<(), DriverError> {
        let session = self.config.reconnect.run(
            &format!("control connect {}:{}", self.config.host, self.config.control_port),
            |_| ControlSession::open(&self.config, self.tracker.clone()),
            // 刚断开的旧会话可能还未被控制器释放，`[3001]` 也值得重试
            |e: &DriverError| match e {
                DriverError::Transport(t) => t.is_connect_error() || t.is_retryable(),
                DriverError::ConnectionRefused(_) => true,
                other => other.is_retryable(),
            },
        )?;

        let generation = self.ctx.begin_session();
        debug!("Control session #{} with {}", generation, session.remote_addr());
        *self.control.write() = Some(Arc::new(session));
        self.ctx.set_control_connected(true);
        // 新会话的控制器状态未知，等上层重新激活
        self.ctx.update_flags(|flags| {
            flags.activated = false;
            flags.homed = false;
        });
        Ok(())
    }

    fn close_control(&self) {
        if let Some(session) = self.control.write().take() {
            session.close();
        }
        self.ctx.set_control_connected(false);
    }

    fn session(&self) -> Result<Arc<ControlSession>, DriverError> {
        self.control.read().clone().ok_or(DriverError::NotConnected)
    }

    /// socket 级失败：关闭并重连控制连接，本次调用仍返回 `ConnectionLost`
    fn recover_control(&self, failed: &Arc<ControlSession>, err: DriverError) -> DriverError {
        let is_current = self
            .control
            .read()
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, failed));

        if is_current {
            warn!("Control connection failed ({}), reconnecting", err);
            self.close_control();
            if let Err(e) = self.open_control() {
                warn!("Control reconnect failed: {}", e);
            }
        }
        err
    }

    /// 执行一条命令
    ///
    /// Immediate 命令返回应答；Queued 命令写出即返回 `None`（物理完成需用检查点确认）。
    pub fn execute(&self, command: Command) -> Result<Option<Response>, DriverError> {
        command
            .validate()
            .map_err(|e| DriverError::InvalidInput(e.to_string()))?;

        let _gate = self.command_gate.lock();
        let session = self.session()?;

        if command.expected_replies().is_empty() {
            return match session.write(&command) {
                Ok(()) => Ok(None),
                Err(e) => Err(self.recover_control(&session, e)),
            };
        }

        let attempts = if command.is_query() {
            self.config.query_retries + 1
        } else {
            1
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            match session.request(&command, self.config.command_timeout) {
                Ok(resp) => {
                    self.observe_reply(&command, &resp);
                    return Ok(Some(resp));
                },
                Err(e) if e.is_retryable() && attempt < attempts && session.is_alive() => {
                    debug!("{} timed out (attempt {}/{}), resending", command.name(), attempt, attempts);
                },
                Err(e) if !session.is_alive() => {
                    let err = match e {
                        DriverError::ConnectionLost { .. } => e,
                        other => DriverError::connection_lost(command.name(), other),
                    };
                    return Err(self.recover_control(&session, err));
                },
                Err(e) => return Err(e),
            }
        }
    }

    /// 根据应答同步本地状态位
    fn observe_reply(&self, command: &Command, resp: &Response) {
        match resp.code {
            codes::MOTORS_ACTIVATED => self.ctx.update_flags(|f| f.activated = true),
            codes::MOTORS_DEACTIVATED => self.ctx.update_flags(|f| {
                f.activated = false;
                f.homed = false;
            }),
            codes::HOMING_DONE | codes::HOMING_ALREADY_DONE => self.ctx.update_flags(|f| f.homed = true),
            codes::ERROR_RESET | codes::NO_ERROR_TO_RESET => self.ctx.update_flags(|f| f.error = false),
            codes::MOTION_PAUSED => self.ctx.update_flags(|f| f.paused = true),
            codes::MOTION_RESUMED => self.ctx.update_flags(|f| f.paused = false),
            codes::STATUS_ROBOT => match StatusFlags::parse(&resp.message) {
                Ok(flags) => self.ctx.apply_flags(flags),
                Err(e) => warn!("{} returned unparsable status: {}", command.name(), e),
            },
            _ => {},
        }
    }

    fn expect_reply(&self, command: Command) -> Result<Response, DriverError> {
        let name = command.name();
        self.execute(command)?
            .ok_or_else(|| DriverError::InvalidInput(format!("{name} produces no reply")))
    }

    fn queue(&self, command: Command) -> Result<(), DriverError> {
        self.execute(command).map(|_| ())
    }

    // ==================== Immediate 命令 ====================

    pub fn activate(&self) -> Result<(), DriverError> {
        self.expect_reply(Command::ActivateRobot).map(|_| ())
    }

    pub fn deactivate(&self) -> Result<(), DriverError> {
        self.expect_reply(Command::DeactivateRobot).map(|_| ())
    }

    pub fn home(&self) -> Result<(), DriverError> {
        self.expect_reply(Command::Home).map(|_| ())
    }

    pub fn reset_error(&self) -> Result<(), DriverError> {
        self.expect_reply(Command::ResetError).map(|_| ())
    }

    pub fn clear_motion(&self) -> Result<(), DriverError> {
        self.expect_reply(Command::ClearMotion).map(|_| ())
    }

    pub fn pause_motion(&self) -> Result<(), DriverError> {
        self.expect_reply(Command::PauseMotion).map(|_| ())
    }

    pub fn resume_motion(&self) -> Result<(), DriverError> {
        self.expect_reply(Command::ResumeMotion).map(|_| ())
    }

    /// 开关恢复模式（放宽关节限位，速度上限 20%）
    pub fn set_recovery_mode(&self, enabled: bool) -> Result<(), DriverError> {
        self.expect_reply(Command::SetRecoveryMode(enabled)).map(|_| ())
    }

    /// 通过控制连接查询状态位（同时刷新快照）
    pub fn get_status(&self) -> Result<StatusFlags, DriverError> {
        let resp = self.expect_reply(Command::GetStatusRobot)?;
        Ok(StatusFlags::parse(&resp.message)?)
    }

    pub fn get_joints(&self) -> Result<JointSet, DriverError> {
        let resp = self.expect_reply(Command::GetJoints)?;
        match meca_protocol::MonitorMessage::from_response(resp)? {
            meca_protocol::MonitorMessage::Joints(joints) => Ok(joints),
            other => Err(DriverError::InvalidInput(format!("unexpected reply {other:?}"))),
        }
    }

    pub fn get_pose(&self) -> Result<Pose, DriverError> {
        let resp = self.expect_reply(Command::GetPose)?;
        match meca_protocol::MonitorMessage::from_response(resp)? {
            meca_protocol::MonitorMessage::Pose(pose) => Ok(pose),
            other => Err(DriverError::InvalidInput(format!("unexpected reply {other:?}"))),
        }
    }

    // ==================== Queued 命令 ====================

    pub fn move_pose(&self, pose: Pose) -> Result<(), DriverError> {
        self.queue(Command::MovePose(pose))
    }

    pub fn move_lin(&self, pose: Pose) -> Result<(), DriverError> {
        self.queue(Command::MoveLin(pose))
    }

    pub fn move_joints(&self, joints: JointSet) -> Result<(), DriverError> {
        self.queue(Command::MoveJoints(joints))
    }

    /// 关节速度（0.1–100 %）
    pub fn set_velocity(&self, percent: f64) -> Result<(), DriverError> {
        self.queue(Command::SetJointVel(percent))
    }

    pub fn set_joint_acc(&self, percent: f64) -> Result<(), DriverError> {
        self.queue(Command::SetJointAcc(percent))
    }

    pub fn set_blending(&self, percent: f64) -> Result<(), DriverError> {
        self.queue(Command::SetBlending(percent))
    }

    pub fn set_conf(&self, shoulder: i8, elbow: i8, wrist: i8) -> Result<(), DriverError> {
        self.queue(Command::SetConf(shoulder, elbow, wrist))
    }

    pub fn set_gripper_force(&self, percent: f64) -> Result<(), DriverError> {
        self.queue(Command::SetGripperForce(percent))
    }

    pub fn set_torque_limits(&self, limits: [f64; 6]) -> Result<(), DriverError> {
        self.queue(Command::SetTorqueLimits(limits))
    }

    pub fn set_torque_limits_cfg(&self, severity: u8, skip_acceleration: u8) -> Result<(), DriverError> {
        self.queue(Command::SetTorqueLimitsCfg(severity, skip_acceleration))
    }

    pub fn gripper_open(&self) -> Result<(), DriverError> {
        self.queue(Command::GripperOpen)
    }

    pub fn gripper_close(&self) -> Result<(), DriverError> {
        self.queue(Command::GripperClose)
    }

    pub fn move_gripper(&self, opening: f64) -> Result<(), DriverError> {
        self.queue(Command::MoveGripper(opening))
    }

    /// 队列内延时（秒）
    pub fn delay(&self, seconds: f64) -> Result<(), DriverError> {
        self.queue(Command::Delay(seconds))
    }

    /// 下发初始化运动参数
    pub fn initialize_parameters(&self, params: &ParameterSet) -> Result<(), DriverError> {
        for command in params.commands() {
            self.queue(command)?;
        }
        Ok(())
    }

    // ==================== 检查点 ====================

    /// 追加检查点，返回等待凭据
    pub fn set_checkpoint(&self) -> Result<CheckpointTicket, DriverError> {
        let ticket = self.tracker.issue();
        self.queue(Command::SetCheckpoint(ticket.id))?;
        Ok(ticket)
    }

    /// 等待检查点到达（不占用命令闸门，等待期间可以暂停/急停/查询）
    pub fn wait_checkpoint(&self, ticket: CheckpointTicket, timeout: Duration) -> Result<(), DriverError> {
        self.tracker.wait(ticket, timeout)
    }

    /// 执行一条命令并确认其物理完成
    ///
    /// Immediate 命令以应答为准；Queued 命令追加检查点并等待 `[3030]`。
    pub fn execute_confirmed(&self, command: Command, timeout: Duration) -> Result<(), DriverError> {
        if !command.expected_replies().is_empty() {
            return self.execute(command).map(|_| ());
        }
        let ticket = self.submit_confirmed(&command)?;
        self.wait_confirmed(command.name(), ticket, timeout)
    }

    /// 写出一条 Queued 命令并紧跟检查点（两帧在同一次闸门内写出）
    pub fn submit_confirmed(&self, command: &Command) -> Result<CheckpointTicket, DriverError> {
        command
            .validate()
            .map_err(|e| DriverError::InvalidInput(e.to_string()))?;
        if !command.expected_replies().is_empty() {
            return Err(DriverError::InvalidInput(format!(
                "{} is not a motion-queue command",
                command.name()
            )));
        }

        let _gate = self.command_gate.lock();
        let session = self.session()?;
        // 先分配凭据：命令本身触发的错误帧也要算进这次等待
        let ticket = self.tracker.issue();
        let written = session
            .write(command)
            .and_then(|_| session.write(&Command::SetCheckpoint(ticket.id)));
        match written {
            Ok(()) => Ok(ticket),
            Err(e) => Err(self.recover_control(&session, e)),
        }
    }

    /// 等待 [`submit_confirmed`](Self::submit_confirmed) 的检查点，错误归属到 `command`
    pub fn wait_confirmed(
        &self,
        command: &str,
        ticket: CheckpointTicket,
        timeout: Duration,
    ) -> Result<(), DriverError> {
        self.tracker.wait(ticket, timeout).map_err(|e| match e {
            DriverError::Timeout { .. } => DriverError::Timeout {
                command: command.to_string(),
                timeout,
            },
            DriverError::ConnectionLost { reason, .. } => DriverError::connection_lost(command, reason),
            DriverError::Rejected { code, message, .. } => DriverError::rejected(command, code, &message),
            other => other,
        })
    }

    // ==================== 急停与连接管理 ====================

    /// 急停：`PauseMotion` + `ClearMotion`
    ///
    /// 走优先路径，不经过命令闸门，不等待应答；正在等待的检查点会收到 `[3031]`。
    pub fn emergency_stop(&self) -> Result<(), DriverError> {
        let session = self.session()?;
        warn!("Emergency stop issued to {}", session.remote_addr());
        session.write_priority(&[Command::PauseMotion, Command::ClearMotion])?;
        self.ctx.update_flags(|f| f.paused = true);
        Ok(())
    }

    /// 主动重建两条连接（之后必须重新激活）
    pub fn reconnect(&self) -> Result<(), DriverError> {
        let _gate = self.command_gate.lock();
        info!("Reconnecting to {}", self.config.host);

        if let Some(worker) = self.monitor.lock().take() {
            worker.shutdown();
        }
        self.close_control();

        self.open_control()?;
        let worker = MonitorWorker::start(&self.config, self.ctx.clone())?;
        *self.monitor.lock() = Some(worker);
        Ok(())
    }

    /// 关闭两条连接（幂等）
    pub fn disconnect(&self) {
        let _gate = self.command_gate.lock();
        if let Some(worker) = self.monitor.lock().take() {
            worker.shutdown();
        }
        self.close_control();
        info!("Disconnected from {}", self.config.host);
    }
}

impl Drop for ProtocolDriver {
    fn drop(&mut self) {
        if let Some(worker) = self.monitor.get_mut().take() {
            worker.shutdown();
        }
        if let Some(session) = self.control.get_mut().take() {
            session.close();
        }
    }
}
