//! 有界指数退避重试
//!
//! 所有重连/重试逻辑集中于此，调用方不再各自编写重试循环。
//! 第 `n` 次重试前等待 `initial_delay * backoff_factor^n`，上限 `max_delay`。

use std::fmt::Display;
use std::thread;
use std::time::Duration;

/// 重试策略
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// 最大尝试次数（含首次，至少为 1）
    pub max_attempts: u32,
    /// 首次重试前的等待
    pub initial_delay: Duration,
    /// 退避倍数
    pub backoff_factor: f64,
    /// 单次等待上限
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// 只尝试一次
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// 第 `retry` 次重试（从 0 开始）前的等待时间
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = self.backoff_factor.max(1.0).powi(retry.min(i32::MAX as u32) as i32);
        let secs = self.initial_delay.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// 按策略执行 `op`
    ///
    /// `op` 接收当前尝试序号（从 0 开始）。只有 `is_retryable` 返回 true 的错误才会重试，
    /// 其余错误立即返回。
    pub fn run<T, E, F, R>(&self, what: &str, mut op: F, is_retryable: R) -> Result<T, E>
    where
        F: FnMut(u32) -> Result<T, E>,
        R: Fn(&E) -> bool,
        E: Display,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            match op(attempt) {
                Ok(value) => {
                    if attempt > 0 {
                        tracing::info!("{} succeeded on attempt {}/{}", what, attempt + 1, attempts);
                    }
                    return Ok(value);
                },
                Err(e) if attempt + 1 < attempts && is_retryable(&e) => {
                    let delay = self.delay_for(attempt);
                    tracing::warn!(
                        "{} failed (attempt {}/{}): {}, retrying in {:?}",
                        what,
                        attempt + 1,
                        attempts,
                        e,
                        delay
                    );
                    thread::sleep(delay);
                    attempt += 1;
                },
                Err(e) => {
                    tracing::error!("{} failed after {} attempt(s): {}", what, attempt + 1, e);
                    return Err(e);
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            backoff_factor: 2.0,
            max_delay: Duration::from_millis(5),
        }
    }

    #[test]
    fn test_delay_grows_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(5), Duration::from_secs(10));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn test_retries_until_success() {
        let calls = Cell::new(0);
        let result: Result<u32, String> = fast_policy(3).run(
            "op",
            |attempt| {
                calls.set(calls.get() + 1);
                if attempt < 2 {
                    Err("transient".to_string())
                } else {
                    Ok(attempt)
                }
            },
            |_| true,
        );
        assert_eq!(result, Ok(2));
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_gives_up_after_max_attempts() {
        let calls = Cell::new(0);
        let result: Result<(), String> = fast_policy(4).run(
            "op",
            |_| {
                calls.set(calls.get() + 1);
                Err("down".to_string())
            },
            |_| true,
        );
        assert_eq!(result, Err("down".to_string()));
        assert_eq!(calls.get(), 4);
    }

    #[test]
    fn test_non_retryable_error_returns_immediately() {
        let calls = Cell::new(0);
        let result: Result<(), String> = fast_policy(5).run(
            "op",
            |_| {
                calls.set(calls.get() + 1);
                Err("fatal".to_string())
            },
            |e| e != "fatal",
        );
        assert!(result.is_err());
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_zero_attempts_still_runs_once() {
        let calls = Cell::new(0);
        let _: Result<(), String> = fast_policy(0).run(
            "op",
            |_| {
                calls.set(calls.get() + 1);
                Err("x".to_string())
            },
            |_| true,
        );
        assert_eq!(calls.get(), 1);
    }
}
