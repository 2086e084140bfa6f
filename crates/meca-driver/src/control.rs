//! 控制连接会话
//!
//! 一条控制连接对应一个会话：
//!
//! - 写端由 `Mutex` 保护，只在写帧期间持有，急停帧因此不会排在等待应答的命令之后
//! - 接收线程持有 socket 克隆，把应答投递到通道，把检查点/错误帧投递到 [`CheckpointTracker`]
//!
//! 会话不负责重连；连接失效后由 [`ProtocolDriver`](crate::ProtocolDriver) 丢弃并重建。

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use meca_protocol::{Command, FrameDecoder, ProtocolError, Response, codes, encode_frame};
use meca_transport::{BoundTransport, Transport, TransportError};
use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

use crate::checkpoint::CheckpointTracker;
use crate::{DriverConfig, DriverError};

const READ_BUF_LEN: usize = 1024;

type Inbound = Result<Response, ProtocolError>;

/// 一条已握手的控制连接
pub(crate) struct ControlSession {
    writer: Mutex<BoundTransport>,
    responses: Receiver<Inbound>,
    is_running: Arc<AtomicBool>,
    alive: Arc<AtomicBool>,
    rx_thread: Mutex<Option<JoinHandle<()>>>,
    remote_addr: SocketAddr,
}

impl ControlSession {
    /// 建立控制连接并完成 `[3000]` 握手
    pub(crate) fn open(
        config: &DriverConfig,
        tracker: Arc<CheckpointTracker>,
    ) -> Result<Self, DriverError> {
        let mut transport =
            BoundTransport::connect(&config.host, config.control_port, &config.transport)?;
        let mut decoder = FrameDecoder::new();

        if let Err(e) = handshake(&mut transport, &mut decoder, config.handshake_timeout) {
            transport.close();
            return Err(e);
        }

        let reader = transport.try_clone()?;
        let remote_addr = transport.remote_addr();
        let (tx, rx) = crossbeam_channel::unbounded();
        let is_running = Arc::new(AtomicBool::new(true));
        let alive = Arc::new(AtomicBool::new(true));

        let rx_thread = {
            let is_running = is_running.clone();
            let alive = alive.clone();
            let poll = config.poll_interval;
            thread::Builder::new()
                .name("meca-control-rx".to_string())
                .spawn(move || control_rx_loop(reader, decoder, tx, tracker, is_running, alive, poll))
                .map_err(|e| DriverError::IoThread(e.to_string()))?
        };

        info!("Control session established with {}", remote_addr);
        Ok(Self {
            writer: Mutex::new(transport),
            responses: rx,
            is_running,
            alive,
            rx_thread: Mutex::new(Some(rx_thread)),
            remote_addr,
        })
    }

    /// socket 仍然有效
    pub(crate) fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub(crate) fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// 丢弃积压的应答（上一条命令超时后迟到的应答、急停的确认等）
    fn drain_stale(&self) {
        for stale in self.responses.try_iter() {
            match stale {
                Ok(resp) => debug!("Discarding stale frame {}", resp.encode()),
                Err(e) => debug!("Discarding stale malformed frame: {}", e),
            }
        }
    }

    /// 写一帧（socket 级失败时标记会话失效）
    pub(crate) fn write(&self, command: &Command) -> Result<(), DriverError> {
        let frame = encode_frame(&command.encode());
        let mut writer = self.writer.lock();
        match writer.send(&frame) {
            Ok(()) => {
                trace!("-> {}", command);
                Ok(())
            },
            Err(e) => {
                drop(writer);
                self.alive.store(false, Ordering::Release);
                Err(DriverError::connection_lost(command.name(), e))
            },
        }
    }

    /// 优先路径：连续写入多帧，不经过命令闸门，不等待应答
    pub(crate) fn write_priority(&self, commands: &[Command]) -> Result<(), DriverError> {
        let mut writer = self.writer.lock();
        for command in commands {
            if let Err(e) = writer.send(&encode_frame(&command.encode())) {
                drop(writer);
                self.alive.store(false, Ordering::Release);
                return Err(DriverError::connection_lost(command.name(), e));
            }
        }
        Ok(())
    }

    /// 发送 Immediate 命令并等待期望的应答
    ///
    /// 期望集合以外的非错误帧被丢弃；任何 1xxx 帧都使本次命令失败。
    pub(crate) fn request(
        &self,
        command: &Command,
        timeout: Duration,
    ) -> Result<Response, DriverError> {
        let expected = command.expected_replies();
        self.drain_stale();
        self.write(command)?;

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.responses.recv_timeout(remaining) {
                Ok(Ok(resp)) if resp.is_error() => {
                    return Err(DriverError::rejected(command.name(), resp.code, &resp.message));
                },
                Ok(Ok(resp)) if expected.contains(&resp.code) => {
                    trace!("<- {}", resp.encode());
                    return Ok(resp);
                },
                Ok(Ok(resp)) => {
                    debug!("{} pending, ignoring unrelated frame {}", command.name(), resp.encode());
                },
                Ok(Err(e)) => return Err(DriverError::Protocol(e)),
                Err(RecvTimeoutError::Timeout) if self.is_alive() => {
                    return Err(DriverError::Timeout {
                        command: command.name().to_string(),
                        timeout,
                    });
                },
                Err(_) => {
                    return Err(DriverError::connection_lost(
                        command.name(),
                        "control connection closed",
                    ));
                },
            }
        }
    }

    /// 关闭会话（幂等）
    pub(crate) fn close(&self) {
        self.is_running.store(false, Ordering::Release);
        self.alive.store(false, Ordering::Release);
        {
            let mut writer = self.writer.lock();
            writer.shutdown();
            writer.close();
        }

        if let Some(handle) = self.rx_thread.lock().take()
            && handle.join().is_err()
        {
            error!("Control RX thread panicked");
        }
    }
}

impl Drop for ControlSession {
    fn drop(&mut self) {
        self.close();
    }
}

fn handshake(
    transport: &mut BoundTransport,
    decoder: &mut FrameDecoder,
    timeout: Duration,
) -> Result<(), DriverError> {
    let deadline = Instant::now() + timeout;
    let mut buf = [0u8; READ_BUF_LEN];

    loop {
        while let Some(frame) = decoder.next_frame() {
            let resp = Response::parse(&frame?)?;
            match resp.code {
                codes::CONNECTED => {
                    debug!("Handshake: {}", resp.encode());
                    return Ok(());
                },
                codes::ALREADY_CONNECTED => {
                    return Err(DriverError::ConnectionRefused(resp.message));
                },
                _ => debug!("Handshake: ignoring {}", resp.encode()),
            }
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(DriverError::Timeout {
                command: "handshake".to_string(),
                timeout,
            });
        }

        match transport.receive(&mut buf, remaining) {
            Ok(n) => decoder.push(&buf[..n]),
            Err(TransportError::Timeout(_)) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

fn control_rx_loop(
    mut reader: BoundTransport,
    mut decoder: FrameDecoder,
    tx: Sender<Inbound>,
    tracker: Arc<CheckpointTracker>,
    is_running: Arc<AtomicBool>,
    alive: Arc<AtomicBool>,
    poll: Duration,
) {
    let mut buf = [0u8; READ_BUF_LEN];

    // 握手时可能已经读入了后续帧
    let dispatch = |decoder: &mut FrameDecoder| {
        while let Some(frame) = decoder.next_frame() {
            let inbound = frame.and_then(|text| Response::parse(&text));
            match inbound {
                Ok(resp) => match resp.code {
                    codes::CHECKPOINT_REACHED | codes::CHECKPOINT_DISCARDED => {
                        match resp.checkpoint_id() {
                            Some(id) if resp.code == codes::CHECKPOINT_REACHED => {
                                trace!("Checkpoint {} reached", id);
                                tracker.on_reached(id);
                            },
                            Some(id) => {
                                debug!("Checkpoint {} discarded", id);
                                tracker.on_discarded(id);
                            },
                            None => warn!("Checkpoint frame without id: {}", resp.encode()),
                        }
                    },
                    codes::END_OF_MOVEMENT | codes::CONNECTED => {
                        trace!("Notification {}", resp.encode());
                    },
                    _ => {
                        // 先入通道再通知等待方，下一条命令的 drain 一定能看到它
                        let fault = resp.is_error().then(|| resp.clone());
                        let _ = tx.send(Ok(resp));
                        if let Some(fault) = fault {
                            warn!("Controller error {}", fault.encode());
                            tracker.on_fault(fault);
                        }
                    },
                },
                Err(e) => {
                    warn!("Malformed frame on control connection: {}", e);
                    let _ = tx.send(Err(e));
                },
            }
        }
    };

    dispatch(&mut decoder);

    while is_running.load(Ordering::Acquire) {
        match reader.receive(&mut buf, poll) {
            Ok(n) => {
                decoder.push(&buf[..n]);
                dispatch(&mut decoder);
            },
            Err(TransportError::Timeout(_)) => continue,
            Err(e) => {
                if is_running.load(Ordering::Acquire) {
                    warn!("Control connection lost: {}", e);
                }
                break;
            },
        }
    }

    alive.store(false, Ordering::Release);
    tracker.on_disconnect();
    reader.close();
    trace!("Control RX thread exiting");
}
