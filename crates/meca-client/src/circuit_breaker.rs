//! 熔断器
//!
//! ```text
//!            N 次失败（窗口内）          冷却结束
//! Closed ─────────────────────► Open ─────────────► HalfOpen（只放行一次探测）
//!   ▲                             ▲                    │
//!   └──────── 探测成功 ───────────┼──── 探测失败 ──────┘
//! ```
//!
//! 只有连接类失败（[`ClientError::is_connection_failure`]）计数；
//! 控制器拒绝命令说明链路是通的，不应触发熔断。

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use meca_tools::BreakerThresholds;
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::ClientError;

/// 熔断器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    /// Closed 状态下窗口内的连续失败时刻
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

/// 熔断器
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    thresholds: BreakerThresholds,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, thresholds: BreakerThresholds) -> Self {
        Self {
            name: name.into(),
            thresholds,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failures: VecDeque::new(),
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    /// 通过熔断器执行 `op`
    ///
    /// 断开时直接返回 `CircuitOpen`，不调用 `op`。
    pub fn call<T>(&self, op: impl FnOnce() -> Result<T, ClientError>) -> Result<T, ClientError> {
        let mut guard = HalfOpenGuard {
            breaker: self,
            armed: self.try_acquire_at(Instant::now())?,
        };
        let result = op();
        guard.armed = false;
        match &result {
            Err(e) if e.is_connection_failure() => self.record_failure_at(Instant::now()),
            _ => self.record_success(),
        }
        result
    }

    /// 请求放行；返回 `true` 表示本次调用是半开探测
    pub fn try_acquire_at(&self, now: Instant) -> Result<bool, ClientError> {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => Ok(false),
            BreakerState::Open => {
                let opened_at = inner.opened_at.unwrap_or(now);
                let elapsed = now.saturating_duration_since(opened_at);
                if elapsed >= self.thresholds.cooldown() {
                    info!("Circuit {} half-open, allowing one trial call", self.name);
                    inner.state = BreakerState::HalfOpen;
                    inner.trial_in_flight = true;
                    Ok(true)
                } else {
                    Err(self.open_error(self.thresholds.cooldown() - elapsed))
                }
            },
            BreakerState::HalfOpen => {
                if inner.trial_in_flight {
                    Err(self.open_error(Duration::ZERO))
                } else {
                    inner.trial_in_flight = true;
                    Ok(true)
                }
            },
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => inner.failures.clear(),
            BreakerState::HalfOpen => {
                info!("Circuit {} closed after successful trial call", self.name);
                inner.state = BreakerState::Closed;
                inner.failures.clear();
                inner.opened_at = None;
                inner.trial_in_flight = false;
            },
            // 断开前发出的调用迟到的成功不改变状态
            BreakerState::Open => {},
        }
    }

    pub fn record_failure_at(&self, now: Instant) {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => {
                let window = self.thresholds.window();
                while inner
                    .failures
                    .front()
                    .is_some_and(|t| now.saturating_duration_since(*t) > window)
                {
                    inner.failures.pop_front();
                }
                inner.failures.push_back(now);

                if inner.failures.len() >= self.thresholds.failure_threshold as usize {
                    warn!(
                        "Circuit {} opened after {} failures",
                        self.name,
                        inner.failures.len()
                    );
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(now);
                    inner.failures.clear();
                }
            },
            BreakerState::HalfOpen => {
                warn!("Circuit {} trial call failed, reopening", self.name);
                inner.state = BreakerState::Open;
                inner.opened_at = Some(now);
                inner.trial_in_flight = false;
            },
            BreakerState::Open => {},
        }
    }

    /// 手动复位
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = BreakerState::Closed;
        inner.failures.clear();
        inner.opened_at = None;
        inner.trial_in_flight = false;
    }

    fn open_error(&self, retry_in: Duration) -> ClientError {
        ClientError::CircuitOpen {
            name: self.name.clone(),
            retry_in,
        }
    }
}

/// 半开探测中 `op` 展开时按失败记录，避免熔断器停在 HalfOpen
struct HalfOpenGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for HalfOpenGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.record_failure_at(Instant::now());
        }
    }
}
