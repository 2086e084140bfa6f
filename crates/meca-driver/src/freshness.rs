//! 遥测新鲜度监视
//!
//! 监控端口按固定周期推送遥测。记录最近一次收到遥测帧的时间，
//! 超过静默阈值即视为监控连接失效。
//!
//! 时间基准为进程内单调时钟（相对首次访问的微秒数），不受系统时钟调整影响，
//! 可以直接存入 `AtomicU64` 无锁读写。

use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

static CLOCK_ORIGIN: OnceLock<Instant> = OnceLock::new();

/// 进程内单调时间（微秒）
pub(crate) fn clock_micros() -> u64 {
    CLOCK_ORIGIN.get_or_init(Instant::now).elapsed().as_micros() as u64
}

/// 遥测新鲜度
#[derive(Debug)]
pub struct TelemetryWatch {
    last_frame_us: AtomicU64,
    frames: AtomicU64,
    silence_timeout: Duration,
}

impl TelemetryWatch {
    /// `silence_timeout`: 超过该时长未收到遥测即视为断线
    pub fn new(silence_timeout: Duration) -> Self {
        Self {
            last_frame_us: AtomicU64::new(clock_micros()),
            frames: AtomicU64::new(0),
            silence_timeout,
        }
    }

    /// 静默阈值内收到过遥测
    pub fn is_fresh(&self) -> bool {
        self.silence() < self.silence_timeout
    }

    /// 记录一帧遥测
    pub fn record_frame(&self) {
        self.last_frame_us.store(clock_micros(), Ordering::Relaxed);
        self.frames.fetch_add(1, Ordering::Relaxed);
    }

    /// 重连后重新计时（给新连接一个完整的静默窗口）
    pub fn reset(&self) {
        self.last_frame_us.store(clock_micros(), Ordering::Relaxed);
    }

    /// 距上一帧遥测（或上次重置）的时长
    pub fn silence(&self) -> Duration {
        let since = clock_micros().saturating_sub(self.last_frame_us.load(Ordering::Relaxed));
        Duration::from_micros(since)
    }

    /// 累计收到的遥测帧数
    pub fn frames_received(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    pub fn silence_timeout(&self) -> Duration {
        self.silence_timeout
    }
}
