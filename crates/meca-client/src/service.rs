//! 机械臂服务（单一入口）
//!
//! 所有物理动作都经过这里：租约 → 急停状态 → 连接 → 激活 → 熔断器 → 驱动。
//! 任何一道检查不通过都直接返回错误，不会静默继续。
//!
//! # 安全规则
//!
//! - `connect_safe` 只建立连接，绝不自动激活/回零
//! - `confirm_activation` 是单独的显式步骤：复位错误、激活、回零、清空残留运动队列
//! - 激活只对当前控制会话有效；控制连接重建后必须重新确认
//! - `emergency_stop` 不检查租约，任何调用方都可以触发
//! - 操作员命令失败（前置检查以外）先急停再返回错误
//! - 急停状态只能通过 `clear_emergency_stop` 显式解除
//!
//! [`execute_confirmed`](RobotService::execute_confirmed) 是序列引擎使用的通路：
//! 控制器拒绝（硬件错误）只把状态置为 `Error` 交给调用方恢复；
//! 结果未知的失败（断线、协议错误、超时）仍然急停。
//!
//! # 恢复
//!
//! - [`quick_recovery`](RobotService::quick_recovery)：复位错误、恢复运动与默认速度，不移动机械臂
//! - [`safe_home`](RobotService::safe_home)：恢复模式下低速移到安全关节位后回零，速度不超过 20%

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use meca_driver::{DriverConfig, DriverError, ProtocolDriver};
use meca_protocol::command::MIN_PERCENT;
use meca_protocol::{Command, JointSet, Pose, StatusFlags};
use meca_tools::{BreakerSettings, RobotConfig, SPEED_RANGE};
use meca_transport::{BindTarget, TransportConfig};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::broadcaster::EventPublisher;
use crate::circuit_breaker::CircuitBreaker;
use crate::events::{BroadcastMessage, CommandResponse, StatusSnapshot};
use crate::{AtomicStateManager, ClientError, Lease, OperationState, ResourceLockManager};

/// 激活后的默认关节速度（%）
pub const DEFAULT_SPEED: f64 = 35.0;
/// 恢复模式下的关节速度上限（%）
pub const RECOVERY_SPEED_LIMIT: f64 = 20.0;

/// 由机械臂配置生成驱动配置
pub fn driver_config(config: &RobotConfig) -> Result<DriverConfig, ClientError> {
    let bind = match config.bind.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        Some(target) => target
            .parse::<BindTarget>()
            .map_err(|e| ClientError::InvalidInput(e.to_string()))?,
        None => BindTarget::Any,
    };

    Ok(DriverConfig {
        host: config.ip.clone(),
        control_port: config.control_port,
        monitor_port: config.monitor_port,
        transport: TransportConfig {
            bind,
            connect_timeout: config.connection_timeout(),
            ..Default::default()
        },
        command_timeout: config.command_timeout(),
        ..Default::default()
    })
}

/// 单台机械臂的服务
pub struct RobotService {
    robot_id: String,
    config: RobotConfig,
    driver_config: DriverConfig,
    driver: RwLock<Option<Arc<ProtocolDriver>>>,
    locks: Arc<ResourceLockManager>,
    states: Arc<AtomicStateManager>,
    connect_breaker: CircuitBreaker,
    command_breaker: CircuitBreaker,
    /// 已确认激活的控制会话代数（0 = 未激活）
    activated_generation: AtomicU64,
    /// 有一条确认中的命令（决定 resume 回到 Busy 还是 Idle）
    in_flight: AtomicBool,
    /// 控制器处于恢复模式（关节限位放宽）
    recovery_mode: AtomicBool,
    default_speed: f64,
    speed_in_effect: Mutex<Option<f64>>,
    events: Option<EventPublisher>,
}

impl RobotService {
    pub fn new(
        config: RobotConfig,
        breaker: &BreakerSettings,
        locks: Arc<ResourceLockManager>,
        states: Arc<AtomicStateManager>,
    ) -> Result<Self, ClientError> {
        config.validate("robot")?;
        let driver_config = driver_config(&config)?;
        let robot_id = config.robot_id.clone();
        states.register(&robot_id);

        Ok(Self {
            connect_breaker: CircuitBreaker::new(format!("{robot_id}/connect"), breaker.connect),
            command_breaker: CircuitBreaker::new(format!("{robot_id}/command"), breaker.command),
            robot_id,
            config,
            driver_config,
            driver: RwLock::new(None),
            locks,
            states,
            activated_generation: AtomicU64::new(0),
            in_flight: AtomicBool::new(false),
            recovery_mode: AtomicBool::new(false),
            default_speed: DEFAULT_SPEED,
            speed_in_effect: Mutex::new(None),
            events: None,
        })
    }

    /// 覆盖驱动配置（重试策略、监控周期等）
    pub fn with_driver_config(mut self, driver_config: DriverConfig) -> Self {
        self.driver_config = driver_config;
        self
    }

    /// 激活后下发的关节速度
    pub fn with_default_speed(mut self, speed: f64) -> Self {
        self.default_speed = speed;
        self
    }

    /// 每次调用结果发布为 `command_response`
    pub fn with_events(mut self, publisher: EventPublisher) -> Self {
        self.events = Some(publisher);
        self
    }

    pub fn robot_id(&self) -> &str {
        &self.robot_id
    }

    pub fn config(&self) -> &RobotConfig {
        &self.config
    }

    pub fn state(&self) -> OperationState {
        self.states
            .get_state(&self.robot_id)
            .unwrap_or(OperationState::Idle)
    }

    pub fn is_connected(&self) -> bool {
        self.driver
            .read()
            .as_ref()
            .is_some_and(|driver| driver.is_connected())
    }

    /// 当前控制会话已确认激活
    pub fn is_activated(&self) -> bool {
        match self.driver.read().as_ref() {
            Some(driver) => self.activation_valid(driver),
            None => false,
        }
    }

    pub fn in_recovery_mode(&self) -> bool {
        self.recovery_mode.load(Ordering::Acquire)
    }

    /// 最近一次下发的关节速度
    pub fn speed_in_effect(&self) -> Option<f64> {
        *self.speed_in_effect.lock()
    }

    pub fn command_timeout(&self) -> Duration {
        self.config.command_timeout()
    }

    pub fn connect_breaker(&self) -> &CircuitBreaker {
        &self.connect_breaker
    }

    pub fn command_breaker(&self) -> &CircuitBreaker {
        &self.command_breaker
    }

    // ==================== 租约 ====================

    pub fn acquire_lease(&self, holder_id: &str, duration: Option<Duration>) -> Result<Lease, ClientError> {
        let duration = duration.unwrap_or_else(|| self.config.lease_duration());
        let result = self.locks.acquire(&self.robot_id, holder_id, duration);
        self.publish("acquire_lease", &result);
        result
    }

    pub fn heartbeat(&self, lease: &Lease) -> Result<Lease, ClientError> {
        self.check_robot(lease)?;
        self.locks.heartbeat(lease)
    }

    pub fn release_lease(&self, lease: &Lease) -> bool {
        let released = self.locks.release(lease);
        let result: Result<(), ClientError> = Ok(());
        self.publish("release_lease", &result);
        released
    }

    pub fn lease_holder(&self) -> Option<String> {
        self.locks.current(&self.robot_id).map(|lease| lease.holder_id)
    }

    // ==================== 连接与激活 ====================

    /// 建立连接（不激活、不回零）
    pub fn connect_safe(&self, lease: &Lease) -> Result<(), ClientError> {
        let result = self.connect_inner(lease);
        self.publish("connect_safe", &result);
        result
    }

    fn connect_inner(&self, lease: &Lease) -> Result<(), ClientError> {
        self.check_lease(lease)?;
        if self.is_connected() {
            return Ok(());
        }

        let driver = self
            .connect_breaker
            .call(|| ProtocolDriver::connect(self.driver_config.clone()).map_err(ClientError::from))?;
        self.activated_generation.store(0, Ordering::Release);
        self.recovery_mode.store(false, Ordering::Release);
        *self.driver.write() = Some(Arc::new(driver));
        info!(robot_id = %self.robot_id, "Connected (activation required)");
        Ok(())
    }

    /// 激活、回零、清空残留运动队列、恢复运动、下发默认速度
    pub fn confirm_activation(&self, lease: &Lease) -> Result<(), ClientError> {
        let result = self.activation_inner(lease);
        self.publish("confirm_activation", &result);
        result
    }

    fn activation_inner(&self, lease: &Lease) -> Result<(), ClientError> {
        self.check_lease(lease)?;
        self.check_not_stopped()?;
        let driver = self.connected_driver()?;
        if self.in_flight.load(Ordering::Acquire) {
            return Err(ClientError::InvalidTransition {
                robot_id: self.robot_id.clone(),
                actual: Some(self.state()),
                target: OperationState::Idle,
            });
        }

        let generation = driver.session_generation();
        let speed = self.default_speed;
        let result = self.command_breaker.call(|| {
            driver.reset_error()?;
            driver.activate()?;
            driver.home()?;
            // 重启前遗留的运动绝不能被恢复执行
            driver.clear_motion()?;
            driver.resume_motion()?;
            driver.set_velocity(speed)?;
            if driver.session_generation() != generation {
                return Err(ClientError::ConnectionLost {
                    command: "confirm_activation".to_string(),
                    reason: "control session replaced during activation".to_string(),
                });
            }
            Ok(())
        });

        match result {
            Ok(()) => {
                self.activated_generation.store(generation, Ordering::Release);
                *self.speed_in_effect.lock() = Some(speed);
                self.force_idle();
                info!(robot_id = %self.robot_id, session = generation, "Activation confirmed");
                Ok(())
            },
            Err(e) if e.is_guard_rejection() => Err(e),
            Err(e) => {
                let err = match e {
                    ClientError::Hardware {
                        command,
                        code,
                        message,
                    } => ClientError::Activation {
                        robot_id: self.robot_id.clone(),
                        code: Some(code),
                        reason: format!("{command}: {message}"),
                    },
                    other => other,
                };
                self.fail_safe("confirm_activation", &err);
                Err(err)
            },
        }
    }

    /// 重建连接（之后必须重新确认激活）
    pub fn reconnect(&self, lease: &Lease) -> Result<(), ClientError> {
        let result = (|| -> Result<(), ClientError> {
            self.check_lease(lease)?;
            self.activated_generation.store(0, Ordering::Release);
            self.recovery_mode.store(false, Ordering::Release);
            let existing = self.driver.read().clone();
            match existing {
                Some(driver) => self
                    .connect_breaker
                    .call(|| driver.reconnect().map_err(ClientError::from)),
                None => self.connect_inner(lease),
            }
        })();
        self.publish("reconnect", &result);
        result
    }

    pub fn disconnect(&self, lease: &Lease) -> Result<(), ClientError> {
        let result = self.check_lease(lease).map(|()| self.shutdown());
        self.publish("disconnect", &result);
        result
    }

    /// 关闭连接（不检查租约，用于进程退出）
    pub fn shutdown(&self) {
        self.activated_generation.store(0, Ordering::Release);
        self.recovery_mode.store(false, Ordering::Release);
        if let Some(driver) = self.driver.write().take() {
            driver.disconnect();
            info!(robot_id = %self.robot_id, "Disconnected");
        }
    }

    // ==================== 运动 ====================

    pub fn move_pose(&self, lease: &Lease, pose: Pose) -> Result<(), ClientError> {
        self.operator_motion(lease, "move_pose", Command::MovePose(pose))
    }

    pub fn move_lin(&self, lease: &Lease, pose: Pose) -> Result<(), ClientError> {
        self.operator_motion(lease, "move_lin", Command::MoveLin(pose))
    }

    pub fn move_joints(&self, lease: &Lease, joints: JointSet) -> Result<(), ClientError> {
        self.operator_motion(lease, "move_joints", Command::MoveJoints(joints))
    }

    fn operator_motion(&self, lease: &Lease, name: &str, command: Command) -> Result<(), ClientError> {
        let timeout = self.command_timeout();
        let result = self.confirmed(lease, command, timeout);
        if let Err(e) = &result
            && Self::requires_fail_safe(e)
            && !self.states.is_emergency_stopped(&self.robot_id)
        {
            self.fail_safe(name, e);
        }
        self.publish(name, &result);
        result
    }

    /// 关节速度（0.1–100 %），写入运动队列即返回
    pub fn set_velocity(&self, lease: &Lease, percent: f64) -> Result<(), ClientError> {
        let result = self.velocity_inner(lease, percent);
        self.publish("set_velocity", &result);
        result
    }

    fn velocity_inner(&self, lease: &Lease, percent: f64) -> Result<(), ClientError> {
        if !SPEED_RANGE.contains(&percent) {
            return Err(ClientError::InvalidInput(format!(
                "velocity {percent} outside {MIN_PERCENT}..=100"
            )));
        }
        self.check_lease(lease)?;
        self.check_not_stopped()?;
        let driver = self.connected_driver()?;
        let percent = self.recovery_speed(percent);

        let result = self
            .command_breaker
            .call(|| driver.set_velocity(percent).map_err(ClientError::from));
        match result {
            Ok(()) => {
                *self.speed_in_effect.lock() = Some(percent);
                Ok(())
            },
            Err(e) => {
                if Self::requires_fail_safe(&e) {
                    self.fail_safe("set_velocity", &e);
                }
                Err(e)
            },
        }
    }

    /// 暂停运动（Busy/Idle → Paused，已暂停则直接成功）
    pub fn pause(&self, lease: &Lease) -> Result<(), ClientError> {
        let result = self.pause_inner(lease);
        self.publish("pause_motion", &result);
        result
    }

    fn pause_inner(&self, lease: &Lease) -> Result<(), ClientError> {
        self.check_lease(lease)?;
        self.check_not_stopped()?;
        let driver = self.connected_driver()?;

        let previous = self.enter_paused()?;
        self.command_breaker
            .call(|| driver.pause_motion().map_err(ClientError::from))
            .inspect_err(|e| {
                if e.is_guard_rejection() {
                    // 命令没有发出，控制器仍在运动
                    self.states
                        .set_state(&self.robot_id, OperationState::Paused, previous);
                } else if Self::requires_fail_safe(e) {
                    self.fail_safe("pause_motion", e);
                }
            })
    }

    /// 进入 Paused，返回进入前的状态
    fn enter_paused(&self) -> Result<OperationState, ClientError> {
        loop {
            let current = self.state();
            match current {
                OperationState::Paused => return Ok(current),
                OperationState::Busy | OperationState::Idle => {
                    if self.states.set_state(&self.robot_id, current, OperationState::Paused) {
                        return Ok(current);
                    }
                },
                _ => {
                    return Err(self.transition_error(current, OperationState::Paused));
                },
            }
        }
    }

    /// 恢复运动（幂等）
    ///
    /// 有命令在途时回到 Busy，否则回到 Idle。
    pub fn resume(&self, lease: &Lease) -> Result<(), ClientError> {
        let result = self.resume_inner(lease);
        self.publish("resume_motion", &result);
        result
    }

    fn resume_inner(&self, lease: &Lease) -> Result<(), ClientError> {
        self.check_lease(lease)?;
        self.check_not_stopped()?;
        let driver = self.connected_driver()?;
        if !self.in_recovery_mode() {
            self.check_activated(&driver)?;
        }

        let current = self.state();
        if current == OperationState::Error {
            return Err(self.transition_error(current, OperationState::Idle));
        }

        self.command_breaker
            .call(|| driver.resume_motion().map_err(ClientError::from))
            .inspect_err(|e| {
                if Self::requires_fail_safe(e) {
                    self.fail_safe("resume_motion", e);
                }
            })?;
        self.leave_paused();
        Ok(())
    }

    fn leave_paused(&self) {
        let target = if self.in_flight.load(Ordering::Acquire) {
            OperationState::Busy
        } else {
            OperationState::Idle
        };
        self.states
            .set_state(&self.robot_id, OperationState::Paused, target);
    }

    /// 清空运动队列（在途命令的检查点被丢弃）
    pub fn clear_motion(&self, lease: &Lease) -> Result<(), ClientError> {
        let result = (|| -> Result<(), ClientError> {
            self.check_lease(lease)?;
            self.check_not_stopped()?;
            let driver = self.connected_driver()?;
            self.command_breaker
                .call(|| driver.clear_motion().map_err(ClientError::from))
                .inspect_err(|e| {
                    if Self::requires_fail_safe(e) {
                        self.fail_safe("clear_motion", e);
                    }
                })
        })();
        self.publish("clear_motion", &result);
        result
    }

    /// 复位控制器错误（Error → Idle）
    pub fn reset_error(&self, lease: &Lease) -> Result<(), ClientError> {
        let result = (|| -> Result<(), ClientError> {
            self.check_lease(lease)?;
            self.check_not_stopped()?;
            let driver = self.connected_driver()?;
            self.command_breaker
                .call(|| driver.reset_error().map_err(ClientError::from))
                .inspect_err(|e| {
                    if Self::requires_fail_safe(e) {
                        self.fail_safe("reset_error", e);
                    }
                })?;
            self.states
                .set_state(&self.robot_id, OperationState::Error, OperationState::Idle);
            Ok(())
        })();
        self.publish("reset_error", &result);
        result
    }

    // ==================== 恢复 ====================

    /// 开关恢复模式
    ///
    /// 恢复模式放宽关节限位，允许未回零时运动；控制器把速度限制在 20%。
    pub fn set_recovery_mode(&self, lease: &Lease, enabled: bool) -> Result<(), ClientError> {
        let result = self.recovery_mode_inner(lease, enabled);
        self.publish("set_recovery_mode", &result);
        result
    }

    fn recovery_mode_inner(&self, lease: &Lease, enabled: bool) -> Result<(), ClientError> {
        self.check_lease(lease)?;
        self.check_not_stopped()?;
        let driver = self.connected_driver()?;

        self.command_breaker
            .call(|| self.switch_recovery_mode(&driver, enabled))
            .inspect_err(|e| {
                if Self::requires_fail_safe(e) {
                    self.fail_safe("set_recovery_mode", e);
                }
            })
    }

    fn switch_recovery_mode(&self, driver: &ProtocolDriver, enabled: bool) -> Result<(), ClientError> {
        driver.set_recovery_mode(enabled)?;
        self.recovery_mode.store(enabled, Ordering::Release);
        if enabled {
            warn!(robot_id = %self.robot_id, "Recovery mode enabled, joint limits relaxed");
        } else {
            info!(robot_id = %self.robot_id, "Recovery mode disabled");
        }
        Ok(())
    }

    /// 恢复模式下速度不超过上限
    fn recovery_speed(&self, percent: f64) -> f64 {
        if self.in_recovery_mode() && percent > RECOVERY_SPEED_LIMIT {
            warn!(
                robot_id = %self.robot_id,
                requested = percent,
                "Velocity clamped to {} in recovery mode", RECOVERY_SPEED_LIMIT
            );
            RECOVERY_SPEED_LIMIT
        } else {
            percent
        }
    }

    /// 快速恢复：复位错误、下发默认速度、恢复运动，状态回到 Idle
    ///
    /// 不移动机械臂，只适用于已确认激活的会话。
    pub fn quick_recovery(&self, lease: &Lease) -> Result<(), ClientError> {
        let result = self.quick_recovery_inner(lease);
        self.publish("quick_recovery", &result);
        result
    }

    fn quick_recovery_inner(&self, lease: &Lease) -> Result<(), ClientError> {
        self.check_lease(lease)?;
        self.check_not_stopped()?;
        let driver = self.connected_driver()?;
        self.check_activated(&driver)?;
        if self.in_flight.load(Ordering::Acquire) {
            return Err(self.transition_error(self.state(), OperationState::Idle));
        }

        let speed = self.recovery_speed(self.default_speed);
        self.command_breaker
            .call(|| {
                driver.reset_error()?;
                // 暂停中入队，恢复运动后生效
                driver.set_velocity(speed)?;
                driver.resume_motion()?;
                Ok(())
            })
            .inspect_err(|e| {
                if Self::requires_fail_safe(e) {
                    self.fail_safe("quick_recovery", e);
                }
            })?;

        *self.speed_in_effect.lock() = Some(speed);
        self.force_idle();
        info!(robot_id = %self.robot_id, speed, "Quick recovery completed");
        Ok(())
    }

    /// 安全回零
    ///
    /// 复位错误并激活，开启恢复模式后以不超过 20% 的速度移到配置的
    /// `safe_joints`，关闭恢复模式、回零、恢复默认速度。成功后当前会话
    /// 视为已确认激活。移动期间可用 [`pause`](Self::pause) 停下、
    /// [`resume`](Self::resume) 继续。
    pub fn safe_home(&self, lease: &Lease, speed: f64) -> Result<(), ClientError> {
        let result = self.safe_home_inner(lease, speed);
        self.publish("safe_home", &result);
        result
    }

    fn safe_home_inner(&self, lease: &Lease, speed: f64) -> Result<(), ClientError> {
        if !speed.is_finite() || speed < MIN_PERCENT {
            return Err(ClientError::InvalidInput(format!(
                "safe homing speed {speed} below {MIN_PERCENT}"
            )));
        }
        let speed = if speed > RECOVERY_SPEED_LIMIT {
            warn!(
                robot_id = %self.robot_id,
                requested = speed,
                "Safe homing speed clamped to {}", RECOVERY_SPEED_LIMIT
            );
            RECOVERY_SPEED_LIMIT
        } else {
            speed
        };
        self.check_lease(lease)?;
        self.check_not_stopped()?;
        let driver = self.connected_driver()?;

        let was_error = self
            .states
            .set_state(&self.robot_id, OperationState::Error, OperationState::Idle);
        self.states
            .transition(&self.robot_id, OperationState::Idle, OperationState::Busy)
            .map_err(|e| self.stopped_or(e))?;
        self.in_flight.store(true, Ordering::Release);

        let generation = driver.session_generation();
        let safe_joints = Command::MoveJoints(JointSet(self.config.safe_joints));
        let timeout = self.command_timeout();
        let default_speed = self.default_speed;
        info!(robot_id = %self.robot_id, speed, "Safe homing started");
        let result = self.command_breaker.call(|| {
            driver.reset_error()?;
            driver.activate()?;
            driver.clear_motion()?;
            self.switch_recovery_mode(&driver, true)?;
            driver.resume_motion()?;
            driver.set_velocity(speed)?;
            self.submit_and_wait(&driver, &safe_joints, timeout)?;
            self.switch_recovery_mode(&driver, false)?;
            driver.home()?;
            driver.set_velocity(default_speed)?;
            if driver.session_generation() != generation {
                return Err(ClientError::ConnectionLost {
                    command: "safe_home".to_string(),
                    reason: "control session replaced during safe homing".to_string(),
                });
            }
            Ok(())
        });
        self.in_flight.store(false, Ordering::Release);

        match result {
            Ok(()) => {
                self.activated_generation.store(generation, Ordering::Release);
                *self.speed_in_effect.lock() = Some(default_speed);
                self.force_idle();
                info!(robot_id = %self.robot_id, session = generation, "Safe homing completed");
                Ok(())
            },
            Err(e) => {
                let err = self.settle_failure("safe_home", e);
                if was_error && err.is_guard_rejection() {
                    self.states
                        .set_state(&self.robot_id, OperationState::Idle, OperationState::Error);
                }
                Err(err)
            },
        }
    }

    // ==================== 急停 ====================

    /// 急停（不检查租约）
    ///
    /// 先把状态置为 EmergencyStopped，再走驱动的优先通路下发
    /// `PauseMotion` + `ClearMotion`。未连接时状态照样生效。
    pub fn emergency_stop(&self) -> Result<(), ClientError> {
        let previous = self.states.emergency_stop(&self.robot_id);
        warn!(robot_id = %self.robot_id, ?previous, "Emergency stop requested");

        let driver = self.driver.read().clone();
        let result = match driver {
            Some(driver) => driver.emergency_stop().map_err(ClientError::from),
            None => Err(ClientError::NotConnected(self.robot_id.clone())),
        };
        if let Err(e) = &result {
            error!(robot_id = %self.robot_id, "Emergency stop could not reach controller: {}", e);
        }
        self.publish("emergency_stop", &result);
        result
    }

    /// 显式解除急停（EmergencyStopped → Idle）
    ///
    /// 控制器仍处于暂停状态，需要随后调用 [`resume`](Self::resume)。
    pub fn clear_emergency_stop(&self, lease: &Lease) -> Result<(), ClientError> {
        let result = self
            .check_lease(lease)
            .and_then(|()| self.states.clear_emergency_stop(&self.robot_id));
        self.publish("clear_emergency_stop", &result);
        result
    }

    fn fail_safe(&self, command: &str, cause: &ClientError) {
        error!(robot_id = %self.robot_id, command, "Command failed ({}), stopping robot", cause);
        let _ = self.emergency_stop();
    }

    fn requires_fail_safe(err: &ClientError) -> bool {
        !err.is_guard_rejection()
            && !matches!(err, ClientError::Driver(DriverError::CheckpointDiscarded(_)))
    }

    // ==================== 状态 ====================

    /// 监控快照（不经过控制连接）
    pub fn snapshot(&self) -> StatusSnapshot {
        let driver = self.driver.read().clone();
        let (status, connected, healthy) = match &driver {
            Some(driver) => (driver.status(), driver.is_connected(), driver.is_monitor_healthy()),
            None => (Default::default(), false, false),
        };
        StatusSnapshot::from_status(
            &self.robot_id,
            self.state(),
            &status,
            connected,
            healthy,
            self.lease_holder(),
        )
    }

    /// 通过控制连接查询状态位（不需要租约）
    pub fn query_status(&self) -> Result<StatusFlags, ClientError> {
        let result = self.connected_driver().and_then(|driver| {
            self.command_breaker
                .call(|| driver.get_status().map_err(ClientError::from))
        });
        self.publish("get_status", &result);
        result
    }

    // ==================== 序列引擎通路 ====================

    /// 执行一条命令并确认完成（序列引擎使用）
    ///
    /// Queued 命令等待检查点；暂停期间的超时不算失败，继续等待。
    /// 控制器拒绝时状态置为 `Error` 并返回 `Hardware`，不急停。
    pub fn execute_confirmed(
        &self,
        lease: &Lease,
        command: Command,
        timeout: Duration,
    ) -> Result<(), ClientError> {
        let name = command.name();
        let result = self.confirmed(lease, command, timeout);
        self.publish(name, &result);
        result
    }

    fn confirmed(&self, lease: &Lease, command: Command, timeout: Duration) -> Result<(), ClientError> {
        self.check_lease(lease)?;
        self.check_not_stopped()?;
        let driver = self.connected_driver()?;
        if command.is_motion() {
            self.check_activated(&driver)?;
        }

        if !command.expected_replies().is_empty() {
            return self.confirmed_immediate(&driver, command);
        }

        self.states
            .transition(&self.robot_id, OperationState::Idle, OperationState::Busy)
            .map_err(|e| self.stopped_or(e))?;
        self.in_flight.store(true, Ordering::Release);

        let result = self
            .command_breaker
            .call(|| self.submit_and_wait(&driver, &command, timeout));
        self.in_flight.store(false, Ordering::Release);

        match result {
            Ok(()) => {
                if let Command::SetJointVel(percent) = command {
                    *self.speed_in_effect.lock() = Some(percent);
                }
                self.states
                    .set_state(&self.robot_id, OperationState::Busy, OperationState::Idle);
                Ok(())
            },
            Err(e) => Err(self.settle_failure(command.name(), e)),
        }
    }

    fn submit_and_wait(
        &self,
        driver: &ProtocolDriver,
        command: &Command,
        timeout: Duration,
    ) -> Result<(), ClientError> {
        let ticket = driver.submit_confirmed(command)?;
        loop {
            match driver.wait_confirmed(command.name(), ticket, timeout) {
                Err(DriverError::Timeout { .. }) if self.state() == OperationState::Paused => {
                    debug!(robot_id = %self.robot_id, "{} still paused, waiting", command.name());
                },
                other => return other.map_err(ClientError::from),
            }
        }
    }

    fn confirmed_immediate(&self, driver: &ProtocolDriver, command: Command) -> Result<(), ClientError> {
        let result = self
            .command_breaker
            .call(|| driver.execute(command).map(|_| ()).map_err(ClientError::from));
        match result {
            Ok(()) => {
                match command {
                    Command::ResetError => {
                        self.states
                            .set_state(&self.robot_id, OperationState::Error, OperationState::Idle);
                    },
                    Command::PauseMotion => {
                        self.enter_paused()?;
                    },
                    Command::ResumeMotion => self.leave_paused(),
                    _ => {},
                }
                Ok(())
            },
            Err(e) => Err(self.settle_failure(command.name(), e)),
        }
    }

    /// 失败后的状态处理：急停优先，硬件错误进入 Error，结果未知则急停
    fn settle_failure(&self, command: &str, err: ClientError) -> ClientError {
        if self.states.is_emergency_stopped(&self.robot_id) {
            debug!(robot_id = %self.robot_id, command, "Failed after emergency stop: {}", err);
            return ClientError::EmergencyStopped(self.robot_id.clone());
        }

        match &err {
            ClientError::Hardware { code, .. } => {
                warn!(robot_id = %self.robot_id, command, code, "Controller rejected command");
                self.enter_error();
            },
            ClientError::Driver(DriverError::CheckpointDiscarded(_)) => {
                self.states
                    .set_state(&self.robot_id, OperationState::Busy, OperationState::Idle);
            },
            e if e.is_guard_rejection() => {
                self.states
                    .set_state(&self.robot_id, OperationState::Busy, OperationState::Idle);
            },
            _ => self.fail_safe(command, &err),
        }
        err
    }

    fn enter_error(&self) {
        loop {
            let current = self.state();
            match current {
                OperationState::Error | OperationState::EmergencyStopped => return,
                _ => {
                    if self.states.set_state(&self.robot_id, current, OperationState::Error) {
                        return;
                    }
                },
            }
        }
    }

    fn force_idle(&self) {
        loop {
            let current = self.state();
            if matches!(current, OperationState::Idle | OperationState::EmergencyStopped)
                || self.states.set_state(&self.robot_id, current, OperationState::Idle)
            {
                return;
            }
        }
    }

    // ==================== 前置检查 ====================

    fn check_robot(&self, lease: &Lease) -> Result<(), ClientError> {
        if lease.robot_id != self.robot_id {
            return Err(ClientError::NotLeaseHolder {
                robot_id: self.robot_id.clone(),
                holder: lease.holder_id.clone(),
            });
        }
        Ok(())
    }

    fn check_lease(&self, lease: &Lease) -> Result<(), ClientError> {
        self.check_robot(lease)?;
        self.locks.validate(lease)
    }

    fn check_not_stopped(&self) -> Result<(), ClientError> {
        if self.states.is_emergency_stopped(&self.robot_id) {
            return Err(ClientError::EmergencyStopped(self.robot_id.clone()));
        }
        Ok(())
    }

    fn connected_driver(&self) -> Result<Arc<ProtocolDriver>, ClientError> {
        self.driver
            .read()
            .clone()
            .filter(|driver| driver.is_connected())
            .ok_or_else(|| ClientError::NotConnected(self.robot_id.clone()))
    }

    fn activation_valid(&self, driver: &ProtocolDriver) -> bool {
        let generation = self.activated_generation.load(Ordering::Acquire);
        generation != 0 && generation == driver.session_generation()
    }

    fn check_activated(&self, driver: &ProtocolDriver) -> Result<(), ClientError> {
        if self.activation_valid(driver) {
            return Ok(());
        }
        let reason = if self.activated_generation.load(Ordering::Acquire) == 0 {
            "activation not confirmed"
        } else {
            "control session was re-established, activation must be confirmed again"
        };
        Err(ClientError::Activation {
            robot_id: self.robot_id.clone(),
            code: None,
            reason: reason.to_string(),
        })
    }

    fn transition_error(&self, actual: OperationState, target: OperationState) -> ClientError {
        ClientError::InvalidTransition {
            robot_id: self.robot_id.clone(),
            actual: Some(actual),
            target,
        }
    }

    fn stopped_or(&self, err: ClientError) -> ClientError {
        match err {
            ClientError::InvalidTransition {
                actual: Some(OperationState::EmergencyStopped),
                ..
            } => ClientError::EmergencyStopped(self.robot_id.clone()),
            other => other,
        }
    }

    fn publish<T>(&self, command: &str, result: &Result<T, ClientError>) {
        if let Some(events) = &self.events {
            let _ = events.send(BroadcastMessage::CommandResponse(CommandResponse::new(
                &self.robot_id,
                command,
                result,
            )));
        }
    }
}

impl Drop for RobotService {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.get_mut().take() {
            driver.disconnect();
        }
    }
}
