//! 进程内机械臂模拟器（`mock` feature）
//!
//! 在 `127.0.0.1` 上监听控制/监控两个端口，按原生 ASCII 协议应答，
//! 用于在无硬件环境下测试驱动与上层逻辑：
//!
//! - 控制端口只接受一个客户端，第二个客户端收到 `[3001]` 后被断开
//! - 控制连接断开即失去使能/回零状态（与真机一致）
//! - 运动队列由独立线程按 `motion_duration` 执行，检查点在控制连接上推送
//! - 监控端口按 `push_interval` 推送 `[2026]`/`[2027]`/`[2007]`
//! - 支持故障注入：第 n 次某命令被拒绝、断开控制连接、监控静默、激活失败

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use meca_protocol::{
    Command, FrameDecoder, JointSet, MonitorMessage, Pose, Response, StatusFlags, codes,
    encode_frame,
};
use meca_transport::{BindTarget, RetryPolicy, TransportConfig};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use crate::DriverConfig;

const ACCEPT_POLL: Duration = Duration::from_millis(5);
const READ_POLL: Duration = Duration::from_millis(10);

/// 模拟器配置
#[derive(Debug, Clone)]
pub struct FakeServerConfig {
    /// 每条运动命令的执行时长
    pub motion_duration: Duration,
    /// `Delay(s)` 的实际耗时为 `s * delay_scale` 秒
    pub delay_scale: f64,
    /// 监控端口推送周期
    pub push_interval: Duration,
}

impl Default for FakeServerConfig {
    fn default() -> Self {
        Self {
            motion_duration: Duration::from_millis(5),
            delay_scale: 0.001,
            push_interval: Duration::from_millis(20),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Injection {
    Reject(u16),
    DropConnection,
}

#[derive(Debug)]
struct Rule {
    name: String,
    occurrence: usize,
    injection: Injection,
}

#[derive(Debug)]
struct QueuedItem {
    command: Command,
    fail_code: Option<u16>,
}

#[derive(Debug, Default)]
struct SimState {
    activated: bool,
    homed: bool,
    error: bool,
    paused: bool,
    recovery_mode: bool,
    executing: bool,
    queue: VecDeque<QueuedItem>,
    pose: Pose,
    joints: JointSet,
    velocity: f64,
    gripper_closed: bool,
}

impl SimState {
    fn flags(&self) -> StatusFlags {
        let idle = self.queue.is_empty() && !self.executing;
        StatusFlags {
            activated: self.activated,
            homed: self.homed,
            simulation: true,
            error: self.error,
            paused: self.paused,
            end_of_block: idle,
            end_of_movement: idle,
        }
    }

    /// 进入错误：运动同时暂停，复位错误后仍需 `ResumeMotion`
    fn enter_error(&mut self) {
        self.error = true;
        self.paused = true;
    }

    fn can_execute(&self) -> bool {
        self.activated && self.motion_allowed() && !self.error && !self.paused
    }

    /// 未归零时仅恢复模式允许运动
    fn motion_allowed(&self) -> bool {
        self.homed || self.recovery_mode
    }

    /// 清空队列，返回被丢弃的检查点编号
    fn discard_queue(&mut self) -> Vec<u32> {
        self.queue
            .drain(..)
            .filter_map(|item| match item.command {
                Command::SetCheckpoint(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    fn reset_session(&mut self) {
        self.activated = false;
        self.homed = false;
        self.paused = false;
        self.recovery_mode = false;
        self.queue.clear();
    }
}

struct Shared {
    config: FakeServerConfig,
    sim: Mutex<SimState>,
    work: Condvar,
    control: Mutex<Option<TcpStream>>,
    received: Mutex<Vec<Command>>,
    counts: Mutex<HashMap<String, usize>>,
    rules: Mutex<Vec<Rule>>,
    reject_activation: AtomicBool,
    monitor_silent: AtomicBool,
    is_running: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Shared {
    fn running(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
    }

    /// 向当前控制客户端写一帧（无客户端时丢弃）
    fn send_control(&self, response: &Response) {
        let mut control = self.control.lock();
        if let Some(stream) = control.as_mut() {
            trace!("fake <- {}", response.encode());
            if let Err(e) = stream.write_all(&encode_frame(&response.encode())) {
                debug!("Fake server: control write failed: {}", e);
            }
        }
    }

    fn send_discarded(&self, ids: Vec<u32>) {
        for id in ids {
            self.send_control(&Response::new(codes::CHECKPOINT_DISCARDED, id.to_string()));
        }
    }

    fn spawn_worker(self: &Arc<Self>, name: &str, f: impl FnOnce(Arc<Shared>) + Send + 'static) {
        let shared = self.clone();
        match thread::Builder::new()
            .name(name.to_string())
            .spawn(move || f(shared))
        {
            Ok(handle) => self.workers.lock().push(handle),
            Err(e) => warn!("Fake server: failed to spawn {}: {}", name, e),
        }
    }
}

enum Flow {
    Continue,
    Drop,
}

/// 进程内 Mecademic 模拟器
pub struct FakeMecaServer {
    shared: Arc<Shared>,
    control_addr: SocketAddr,
    monitor_addr: SocketAddr,
    threads: Vec<JoinHandle<()>>,
}

impl FakeMecaServer {
    pub fn start() -> io::Result<Self> {
        Self::start_with(FakeServerConfig::default())
    }

    pub fn start_with(config: FakeServerConfig) -> io::Result<Self> {
        let control_listener = TcpListener::bind("127.0.0.1:0")?;
        let monitor_listener = TcpListener::bind("127.0.0.1:0")?;
        control_listener.set_nonblocking(true)?;
        monitor_listener.set_nonblocking(true)?;
        let control_addr = control_listener.local_addr()?;
        let monitor_addr = monitor_listener.local_addr()?;

        let shared = Arc::new(Shared {
            config,
            sim: Mutex::new(SimState {
                velocity: 100.0,
                ..Default::default()
            }),
            work: Condvar::new(),
            control: Mutex::new(None),
            received: Mutex::new(Vec::new()),
            counts: Mutex::new(HashMap::new()),
            rules: Mutex::new(Vec::new()),
            reject_activation: AtomicBool::new(false),
            monitor_silent: AtomicBool::new(false),
            is_running: AtomicBool::new(true),
            workers: Mutex::new(Vec::new()),
        });

        let threads = vec![
            {
                let shared = shared.clone();
                thread::Builder::new()
                    .name("fake-meca-control".to_string())
                    .spawn(move || control_acceptor(control_listener, shared))?
            },
            {
                let shared = shared.clone();
                thread::Builder::new()
                    .name("fake-meca-monitor".to_string())
                    .spawn(move || monitor_acceptor(monitor_listener, shared))?
            },
            {
                let shared = shared.clone();
                thread::Builder::new()
                    .name("fake-meca-executor".to_string())
                    .spawn(move || executor_loop(shared))?
            },
        ];

        debug!("Fake Meca server on {} / {}", control_addr, monitor_addr);
        Ok(Self {
            shared,
            control_addr,
            monitor_addr,
            threads,
        })
    }

    pub fn control_port(&self) -> u16 {
        self.control_addr.port()
    }

    pub fn monitor_port(&self) -> u16 {
        self.monitor_addr.port()
    }

    /// 适合本模拟器的驱动配置（本地回环、短超时、快速重连）
    pub fn driver_config(&self) -> DriverConfig {
        DriverConfig {
            host: "127.0.0.1".to_string(),
            control_port: self.control_port(),
            monitor_port: self.monitor_port(),
            transport: TransportConfig {
                bind: BindTarget::Ip(self.control_addr.ip()),
                connect_timeout: Duration::from_secs(1),
                write_timeout: Duration::from_secs(1),
                nodelay: true,
                keepalive: None,
            },
            command_timeout: Duration::from_secs(2),
            handshake_timeout: Duration::from_secs(1),
            query_retries: 1,
            reconnect: RetryPolicy {
                max_attempts: 3,
                initial_delay: Duration::from_millis(10),
                backoff_factor: 2.0,
                max_delay: Duration::from_millis(50),
            },
            monitor_interval: self.shared.config.push_interval,
            monitor_missed_intervals: 5,
            poll_interval: READ_POLL,
        }
    }

    // ==================== 观察 ====================

    /// 收到的全部命令（按到达顺序）
    pub fn received_commands(&self) -> Vec<Command> {
        self.shared.received.lock().clone()
    }

    /// 某命令累计收到次数
    pub fn count_of(&self, name: &str) -> usize {
        self.shared.counts.lock().get(name).copied().unwrap_or(0)
    }

    pub fn clear_log(&self) {
        self.shared.received.lock().clear();
    }

    pub fn is_activated(&self) -> bool {
        self.shared.sim.lock().activated
    }

    pub fn is_homed(&self) -> bool {
        self.shared.sim.lock().homed
    }

    pub fn in_recovery_mode(&self) -> bool {
        self.shared.sim.lock().recovery_mode
    }

    pub fn is_paused(&self) -> bool {
        self.shared.sim.lock().paused
    }

    pub fn is_in_error(&self) -> bool {
        self.shared.sim.lock().error
    }

    pub fn queue_len(&self) -> usize {
        self.shared.sim.lock().queue.len()
    }

    pub fn pose(&self) -> Pose {
        self.shared.sim.lock().pose
    }

    pub fn joints(&self) -> JointSet {
        self.shared.sim.lock().joints
    }

    pub fn velocity(&self) -> f64 {
        self.shared.sim.lock().velocity
    }

    pub fn gripper_closed(&self) -> bool {
        self.shared.sim.lock().gripper_closed
    }

    pub fn has_control_client(&self) -> bool {
        self.shared.control.lock().is_some()
    }

    // ==================== 故障注入 ====================

    /// 第 `occurrence` 次（从 1 开始计数，含此前已收到的）收到 `name` 时以 `code` 拒绝
    ///
    /// Immediate 命令立即应答错误码；Queued 命令在执行到它时报错并进入错误状态。
    pub fn reject_nth(&self, name: &str, occurrence: usize, code: u16) {
        self.shared.rules.lock().push(Rule {
            name: name.to_string(),
            occurrence,
            injection: Injection::Reject(code),
        });
    }

    /// 第 `occurrence` 次收到 `name` 时断开控制连接（命令不执行）
    pub fn drop_control_on(&self, name: &str, occurrence: usize) {
        self.shared.rules.lock().push(Rule {
            name: name.to_string(),
            occurrence,
            injection: Injection::DropConnection,
        });
    }

    pub fn clear_injections(&self) {
        self.shared.rules.lock().clear();
    }

    /// 立即断开当前控制客户端
    pub fn drop_control_now(&self) {
        if let Some(stream) = self.shared.control.lock().as_ref() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    /// 停止/恢复监控推送（连接保持）
    pub fn set_monitor_silent(&self, silent: bool) {
        self.shared.monitor_silent.store(silent, Ordering::Release);
    }

    pub fn set_reject_activation(&self, reject: bool) {
        self.shared.reject_activation.store(reject, Ordering::Release);
    }

    /// 把机器人置于错误状态（如碰撞），丢弃队列
    pub fn inject_fault(&self, code: u16) {
        let discarded = {
            let mut sim = self.shared.sim.lock();
            sim.enter_error();
            sim.discard_queue()
        };
        self.shared.send_control(&Response::new(code, "Injected fault."));
        self.shared.send_discarded(discarded);
    }

    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.shared.is_running.store(false, Ordering::Release);
        self.shared.work.notify_all();
        self.drop_control_now();

        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        let workers: Vec<_> = self.shared.workers.lock().drain(..).collect();
        for handle in workers {
            let _ = handle.join();
        }
    }
}

impl Drop for FakeMecaServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn control_acceptor(listener: TcpListener, shared: Arc<Shared>) {
    while shared.running() {
        match listener.accept() {
            Ok((mut stream, peer)) => {
                if let Err(e) = stream.set_nonblocking(false) {
                    warn!("Fake server: set_nonblocking failed: {}", e);
                    continue;
                }

                let occupied = shared.control.lock().is_some();
                if occupied {
                    debug!("Fake server: refusing second control client {}", peer);
                    let refusal = Response::new(
                        codes::ALREADY_CONNECTED,
                        "Another user is already connected, closing connection.",
                    );
                    let _ = stream.write_all(&encode_frame(&refusal.encode()));
                    let _ = stream.shutdown(Shutdown::Both);
                    continue;
                }

                let writer = match stream.try_clone() {
                    Ok(writer) => writer,
                    Err(e) => {
                        warn!("Fake server: try_clone failed: {}", e);
                        continue;
                    },
                };
                *shared.control.lock() = Some(writer);
                shared.send_control(&Response::new(codes::CONNECTED, "Connected to Meca500 (simulated)."));
                debug!("Fake server: control client {} connected", peer);

                shared.spawn_worker("fake-meca-session", move |shared| control_session(stream, shared));
            },
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
            Err(e) => {
                warn!("Fake server: control accept failed: {}", e);
                thread::sleep(ACCEPT_POLL);
            },
        }
    }
}

fn control_session(mut stream: TcpStream, shared: Arc<Shared>) {
    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; 1024];
    if let Err(e) = stream.set_read_timeout(Some(READ_POLL)) {
        warn!("Fake server: set_read_timeout failed: {}", e);
    }

    'session: while shared.running() {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                decoder.push(&buf[..n]);
                while let Some(frame) = decoder.next_frame() {
                    let flow = match frame {
                        Ok(text) => handle_frame(&shared, &text),
                        Err(e) => {
                            shared.send_control(&Response::new(codes::INVALID_COMMAND, e.to_string()));
                            Flow::Continue
                        },
                    };
                    if let Flow::Drop = flow {
                        break 'session;
                    }
                }
            },
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {},
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {},
            Err(_) => break,
        }
    }

    shared.sim.lock().reset_session();
    if let Some(writer) = shared.control.lock().take() {
        let _ = writer.shutdown(Shutdown::Both);
    }
    debug!("Fake server: control client disconnected, motors deactivated");
}

fn handle_frame(shared: &Arc<Shared>, text: &str) -> Flow {
    trace!("fake -> {}", text);
    let command = match Command::decode(text) {
        Ok(command) => command,
        Err(e) => {
            shared.send_control(&Response::new(
                codes::INVALID_COMMAND,
                format!("Invalid command: {e}"),
            ));
            return Flow::Continue;
        },
    };

    shared.received.lock().push(command);
    let occurrence = {
        let mut counts = shared.counts.lock();
        let count = counts.entry(command.name().to_string()).or_insert(0);
        *count += 1;
        *count
    };
    let injection = shared
        .rules
        .lock()
        .iter()
        .find(|rule| rule.name == command.name() && rule.occurrence == occurrence)
        .map(|rule| rule.injection);

    let immediate = !command.expected_replies().is_empty();
    match injection {
        Some(Injection::DropConnection) => {
            debug!("Fake server: dropping control connection on {}", command.name());
            return Flow::Drop;
        },
        Some(Injection::Reject(code)) if immediate => {
            shared.send_control(&Response::new(code, "Injected failure."));
            return Flow::Continue;
        },
        _ => {},
    }

    if immediate {
        handle_immediate(shared, command);
    } else {
        let fail_code = match injection {
            Some(Injection::Reject(code)) => Some(code),
            _ => None,
        };
        enqueue(shared, command, fail_code);
    }
    Flow::Continue
}

fn handle_immediate(shared: &Shared, command: Command) {
    let mut discarded = Vec::new();
    let response = {
        let mut sim = shared.sim.lock();
        match command {
            Command::ActivateRobot if shared.reject_activation.load(Ordering::Acquire) => {
                Response::new(codes::ACTIVATION_FAILED, "Activation failed.")
            },
            Command::ActivateRobot => {
                sim.activated = true;
                Response::new(codes::MOTORS_ACTIVATED, "Motors activated.")
            },
            Command::DeactivateRobot => {
                discarded = sim.discard_queue();
                sim.activated = false;
                sim.homed = false;
                sim.recovery_mode = false;
                Response::new(codes::MOTORS_DEACTIVATED, "Motors deactivated.")
            },
            Command::Home if !sim.activated => {
                Response::new(codes::NOT_ACTIVATED, "Motors deactivated.")
            },
            Command::Home if sim.homed => {
                Response::new(codes::HOMING_ALREADY_DONE, "Homing already done.")
            },
            Command::Home => {
                sim.homed = true;
                Response::new(codes::HOMING_DONE, "Homing done.")
            },
            Command::ResetError if sim.error => {
                sim.error = false;
                Response::new(codes::ERROR_RESET, "The error was reset.")
            },
            Command::ResetError => Response::new(codes::NO_ERROR_TO_RESET, "There was no error to reset."),
            Command::ClearMotion => {
                discarded = sim.discard_queue();
                Response::new(codes::MOTION_CLEARED, "The motion was cleared.")
            },
            Command::PauseMotion => {
                sim.paused = true;
                Response::new(codes::MOTION_PAUSED, "Motion paused.")
            },
            Command::ResumeMotion if sim.error => {
                Response::new(codes::ROBOT_IN_ERROR, "The robot is in error.")
            },
            Command::ResumeMotion => {
                sim.paused = false;
                shared.work.notify_all();
                Response::new(codes::MOTION_RESUMED, "Motion resumed.")
            },
            Command::SetRecoveryMode(true) => {
                sim.recovery_mode = true;
                Response::new(codes::RECOVERY_MODE_ON, "Recovery mode enabled.")
            },
            Command::SetRecoveryMode(false) => {
                sim.recovery_mode = false;
                Response::new(codes::RECOVERY_MODE_OFF, "Recovery mode disabled.")
            },
            Command::GetStatusRobot => Response::new(codes::STATUS_ROBOT, sim.flags().encode()),
            Command::GetJoints => MonitorMessage::Joints(sim.joints).to_response(),
            Command::GetPose => MonitorMessage::Pose(sim.pose).to_response(),
            other => Response::new(
                codes::INVALID_COMMAND,
                format!("{} is not an immediate command", other.name()),
            ),
        }
    };

    shared.send_discarded(discarded);
    shared.send_control(&response);
}

fn enqueue(shared: &Shared, command: Command, fail_code: Option<u16>) {
    let rejection = {
        let mut sim = shared.sim.lock();
        let rejection = if !command.is_motion() {
            None
        } else if !sim.activated {
            Some(Response::new(codes::NOT_ACTIVATED, "Motors deactivated."))
        } else if !sim.motion_allowed() {
            Some(Response::new(codes::NOT_HOMED, "Homing not performed."))
        } else if sim.error {
            Some(Response::new(codes::ROBOT_IN_ERROR, "The robot is in error."))
        } else {
            None
        };

        if rejection.is_none() {
            sim.queue.push_back(QueuedItem { command, fail_code });
            shared.work.notify_all();
        }
        rejection
    };

    if let Some(response) = rejection {
        shared.send_control(&response);
    }
}

fn executor_loop(shared: Arc<Shared>) {
    loop {
        let item = {
            let mut sim = shared.sim.lock();
            loop {
                if !shared.running() {
                    return;
                }
                if sim.can_execute()
                    && let Some(item) = sim.queue.pop_front()
                {
                    sim.executing = true;
                    break item;
                }
                shared.work.wait_for(&mut sim, Duration::from_millis(20));
            }
        };

        if let Some(code) = item.fail_code {
            thread::sleep(shared.config.motion_duration);
            let discarded = {
                let mut sim = shared.sim.lock();
                sim.enter_error();
                sim.executing = false;
                sim.discard_queue()
            };
            debug!("Fake server: {} failed with [{}]", item.command.name(), code);
            shared.send_control(&Response::new(code, "Injected motion failure."));
            shared.send_discarded(discarded);
            continue;
        }

        let motion = shared.config.motion_duration;
        match item.command {
            Command::MovePose(pose) | Command::MoveLin(pose) => {
                thread::sleep(motion);
                shared.sim.lock().pose = pose;
            },
            Command::MoveJoints(joints) => {
                thread::sleep(motion);
                shared.sim.lock().joints = joints;
            },
            Command::GripperOpen => {
                thread::sleep(motion);
                shared.sim.lock().gripper_closed = false;
            },
            Command::GripperClose => {
                thread::sleep(motion);
                shared.sim.lock().gripper_closed = true;
            },
            Command::MoveGripper(_) => thread::sleep(motion),
            Command::Delay(seconds) => {
                thread::sleep(Duration::from_secs_f64(seconds * shared.config.delay_scale));
            },
            Command::SetJointVel(percent) => shared.sim.lock().velocity = percent,
            Command::SetCheckpoint(id) => {
                shared.send_control(&Response::new(codes::CHECKPOINT_REACHED, id.to_string()));
            },
            _ => {},
        }

        let idle = {
            let mut sim = shared.sim.lock();
            sim.executing = false;
            sim.queue.is_empty()
        };
        if idle && item.command.is_motion() {
            shared.send_control(&Response::new(codes::END_OF_MOVEMENT, "End of movement."));
        }
    }
}

fn monitor_acceptor(listener: TcpListener, shared: Arc<Shared>) {
    while shared.running() {
        match listener.accept() {
            Ok((stream, peer)) => {
                if let Err(e) = stream.set_nonblocking(false) {
                    warn!("Fake server: set_nonblocking failed: {}", e);
                    continue;
                }
                debug!("Fake server: monitor client {} connected", peer);
                shared.spawn_worker("fake-meca-push", move |shared| monitor_push(stream, shared));
            },
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
            Err(e) => {
                warn!("Fake server: monitor accept failed: {}", e);
                thread::sleep(ACCEPT_POLL);
            },
        }
    }
}

fn monitor_push(mut stream: TcpStream, shared: Arc<Shared>) {
    while shared.running() {
        if !shared.monitor_silent.load(Ordering::Acquire) {
            let messages = {
                let sim = shared.sim.lock();
                [
                    MonitorMessage::Joints(sim.joints),
                    MonitorMessage::Pose(sim.pose),
                    MonitorMessage::Status(sim.flags()),
                ]
            };

            let mut payload = Vec::new();
            for message in &messages {
                payload.extend_from_slice(&encode_frame(&message.to_response().encode()));
            }
            if stream.write_all(&payload).is_err() {
                break;
            }
        }
        thread::sleep(shared.config.push_interval);
    }
    let _ = stream.shutdown(Shutdown::Both);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_frame(stream: &mut TcpStream, decoder: &mut FrameDecoder) -> Response {
        let mut buf = [0u8; 256];
        stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        loop {
            if let Some(frame) = decoder.next_frame() {
                return Response::parse(&frame.unwrap()).unwrap();
            }
            let n = stream.read(&mut buf).unwrap();
            assert!(n > 0, "server closed connection");
            decoder.push(&buf[..n]);
        }
    }

    fn send(stream: &mut TcpStream, command: Command) {
        stream.write_all(&encode_frame(&command.encode())).unwrap();
    }

    #[test]
    fn test_handshake_and_single_client() {
        let server = FakeMecaServer::start().unwrap();
        let mut first = TcpStream::connect(("127.0.0.1", server.control_port())).unwrap();
        let mut decoder = FrameDecoder::new();
        assert_eq!(read_frame(&mut first, &mut decoder).code, codes::CONNECTED);

        let mut second = TcpStream::connect(("127.0.0.1", server.control_port())).unwrap();
        let mut decoder2 = FrameDecoder::new();
        assert_eq!(
            read_frame(&mut second, &mut decoder2).code,
            codes::ALREADY_CONNECTED
        );
    }

    #[test]
    fn test_activation_and_checkpoint() {
        let server = FakeMecaServer::start().unwrap();
        let mut stream = TcpStream::connect(("127.0.0.1", server.control_port())).unwrap();
        let mut decoder = FrameDecoder::new();
        read_frame(&mut stream, &mut decoder);

        send(&mut stream, Command::MovePose(Pose::default()));
        assert_eq!(read_frame(&mut stream, &mut decoder).code, codes::NOT_ACTIVATED);

        send(&mut stream, Command::ActivateRobot);
        assert_eq!(read_frame(&mut stream, &mut decoder).code, codes::MOTORS_ACTIVATED);
        send(&mut stream, Command::Home);
        assert_eq!(read_frame(&mut stream, &mut decoder).code, codes::HOMING_DONE);

        let target = Pose::new(100.0, 0.0, 200.0, 0.0, 90.0, 0.0);
        send(&mut stream, Command::MovePose(target));
        send(&mut stream, Command::SetCheckpoint(7));

        let mut reached = false;
        for _ in 0..3 {
            let resp = read_frame(&mut stream, &mut decoder);
            if resp.code == codes::CHECKPOINT_REACHED {
                assert_eq!(resp.checkpoint_id(), Some(7));
                reached = true;
                break;
            }
        }
        assert!(reached);
        assert_eq!(server.pose(), target);
    }

    #[test]
    fn test_error_leaves_motion_paused_until_resumed() {
        let server = FakeMecaServer::start().unwrap();
        let mut stream = TcpStream::connect(("127.0.0.1", server.control_port())).unwrap();
        let mut decoder = FrameDecoder::new();
        read_frame(&mut stream, &mut decoder);
        send(&mut stream, Command::ActivateRobot);
        read_frame(&mut stream, &mut decoder);
        send(&mut stream, Command::Home);
        read_frame(&mut stream, &mut decoder);

        server.inject_fault(codes::MOTION_FAILED);
        assert_eq!(read_frame(&mut stream, &mut decoder).code, codes::MOTION_FAILED);
        assert!(server.is_in_error() && server.is_paused());

        send(&mut stream, Command::ResetError);
        assert_eq!(read_frame(&mut stream, &mut decoder).code, codes::ERROR_RESET);
        assert!(!server.is_in_error());
        assert!(server.is_paused());

        // 暂停中的队列不执行，检查点不会到达
        send(&mut stream, Command::SetJointVel(20.0));
        send(&mut stream, Command::SetCheckpoint(9));
        thread::sleep(Duration::from_millis(100));
        assert_eq!(server.queue_len(), 2);

        send(&mut stream, Command::ResumeMotion);
        let replies = [
            read_frame(&mut stream, &mut decoder),
            read_frame(&mut stream, &mut decoder),
        ];
        assert!(replies.iter().any(|r| r.code == codes::MOTION_RESUMED));
        assert!(replies
            .iter()
            .any(|r| r.code == codes::CHECKPOINT_REACHED && r.checkpoint_id() == Some(9)));
        assert_eq!(server.velocity(), 20.0);
    }

    #[test]
    fn test_recovery_mode_allows_motion_before_homing() {
        let server = FakeMecaServer::start().unwrap();
        let mut stream = TcpStream::connect(("127.0.0.1", server.control_port())).unwrap();
        let mut decoder = FrameDecoder::new();
        read_frame(&mut stream, &mut decoder);
        send(&mut stream, Command::ActivateRobot);
        read_frame(&mut stream, &mut decoder);

        let target = JointSet([0.0, -10.0, 10.0, 0.0, 0.0, 0.0]);
        send(&mut stream, Command::MoveJoints(target));
        assert_eq!(read_frame(&mut stream, &mut decoder).code, codes::NOT_HOMED);

        send(&mut stream, Command::SetRecoveryMode(true));
        assert_eq!(read_frame(&mut stream, &mut decoder).code, codes::RECOVERY_MODE_ON);
        send(&mut stream, Command::MoveJoints(target));
        send(&mut stream, Command::SetCheckpoint(3));
        let reached = read_frame(&mut stream, &mut decoder);
        assert_eq!(reached.checkpoint_id(), Some(3));
        assert_eq!(server.joints(), target);
        assert!(!server.is_homed());

        send(&mut stream, Command::SetRecoveryMode(false));
        assert_eq!(read_frame(&mut stream, &mut decoder).code, codes::RECOVERY_MODE_OFF);
        assert!(!server.in_recovery_mode());
    }

    #[test]
    fn test_disconnect_deactivates() {
        let server = FakeMecaServer::start().unwrap();
        let mut stream = TcpStream::connect(("127.0.0.1", server.control_port())).unwrap();
        let mut decoder = FrameDecoder::new();
        read_frame(&mut stream, &mut decoder);
        send(&mut stream, Command::ActivateRobot);
        read_frame(&mut stream, &mut decoder);
        assert!(server.is_activated());

        drop(stream);
        for _ in 0..100 {
            if !server.has_control_client() {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert!(!server.has_control_client());
        assert!(!server.is_activated());
    }
}
