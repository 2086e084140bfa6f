//! 监控连接线程
//!
//! 只读连接，持续接收 `[2026]`/`[2027]`/`[2007]` 推送并写入 [`DriverContext`]。
//! 读超时是正常情况；静默超过 `monitor_silence_timeout` 才认为断线，
//! 此时只重连监控连接，控制会话保持不动。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use meca_protocol::{FrameDecoder, MonitorMessage};
use meca_transport::{BoundTransport, Transport, TransportError};
use tracing::{debug, error, info, trace, warn};

use crate::{DriverConfig, DriverContext, DriverError};

const READ_BUF_LEN: usize = 2048;

/// 监控线程句柄
pub(crate) struct MonitorWorker {
    is_running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl MonitorWorker {
    /// 建立监控连接并启动线程
    ///
    /// 首次连接失败直接返回错误；之后的断线由线程内部重连。
    pub(crate) fn start(config: &DriverConfig, ctx: Arc<DriverContext>) -> Result<Self, DriverError> {
        let transport = connect_monitor(config)?;
        ctx.telemetry.reset();
        ctx.set_monitor_connected(true);

        let is_running = Arc::new(AtomicBool::new(true));
        let handle = {
            let is_running = is_running.clone();
            let config = config.clone();
            thread::Builder::new()
                .name("meca-monitor".to_string())
                .spawn(move || monitor_loop(transport, config, ctx, is_running))
                .map_err(|e| DriverError::IoThread(e.to_string()))?
        };

        Ok(Self {
            is_running,
            handle: Some(handle),
        })
    }

    pub(crate) fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
    }

    pub(crate) fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.is_running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            error!("Monitor thread panicked");
        }
    }
}

impl Drop for MonitorWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn connect_monitor(config: &DriverConfig) -> Result<BoundTransport, DriverError> {
    Ok(BoundTransport::connect(
        &config.host,
        config.monitor_port,
        &config.transport,
    )?)
}

fn monitor_loop(
    mut transport: BoundTransport,
    config: DriverConfig,
    ctx: Arc<DriverContext>,
    is_running: Arc<AtomicBool>,
) {
    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; READ_BUF_LEN];

    while is_running.load(Ordering::Acquire) {
        let lost = match transport.receive(&mut buf, config.poll_interval) {
            Ok(n) => {
                decoder.push(&buf[..n]);
                while let Some(frame) = decoder.next_frame() {
                    match frame.and_then(|text| MonitorMessage::parse(&text)) {
                        Ok(MonitorMessage::Other(resp)) => trace!("Monitor: ignoring {}", resp.encode()),
                        Ok(message) => ctx.apply_telemetry(&message),
                        Err(e) => debug!("Monitor: dropping malformed frame: {}", e),
                    }
                }
                None
            },
            Err(TransportError::Timeout(_)) if ctx.telemetry.is_fresh() => None,
            Err(TransportError::Timeout(_)) => Some(format!(
                "no telemetry for {:?}",
                ctx.telemetry.silence()
            )),
            Err(e) => Some(e.to_string()),
        };

        if let Some(reason) = lost {
            warn!("Monitor connection lost ({}), reconnecting", reason);
            transport.close();
            ctx.set_monitor_connected(false);
            decoder.clear();

            match reconnect(&config, &is_running) {
                Some(fresh) => {
                    transport = fresh;
                    ctx.telemetry.reset();
                    ctx.set_monitor_connected(true);
                    ctx.record_monitor_reconnect();
                    info!("Monitor connection re-established");
                },
                None => break,
            }
        }
    }

    transport.close();
    ctx.set_monitor_connected(false);
    trace!("Monitor thread exiting");
}

/// 按退避策略无限重连，直到成功或线程被要求退出
fn reconnect(config: &DriverConfig, is_running: &AtomicBool) -> Option<BoundTransport> {
    let mut attempt = 0u32;
    while is_running.load(Ordering::Acquire) {
        match connect_monitor(config) {
            Ok(transport) => return Some(transport),
            Err(e) => {
                let delay = config.reconnect.delay_for(attempt);
                debug!("Monitor reconnect attempt {} failed: {}, retrying in {:?}", attempt + 1, e, delay);
                attempt = attempt.saturating_add(1);
                sleep_while_running(delay, is_running);
            },
        }
    }
    None
}

fn sleep_while_running(total: Duration, is_running: &AtomicBool) {
    let step = Duration::from_millis(10);
    let mut slept = Duration::ZERO;
    while slept < total && is_running.load(Ordering::Acquire) {
        let chunk = step.min(total - slept);
        thread::sleep(chunk);
        slept += chunk;
    }
}
