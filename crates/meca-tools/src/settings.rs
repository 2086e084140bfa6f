//! 服务层设置：熔断器、租约清扫、状态广播

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// 单类操作的熔断阈值
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerThresholds {
    /// 窗口内连续失败多少次后断开
    pub failure_threshold: u32,
    /// 断开后多久允许一次探测
    pub cooldown_ms: u64,
    /// 失败计数窗口（超出窗口的旧失败不再累计）
    pub window_ms: u64,
}

impl BreakerThresholds {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    fn validate(&self, field: &str) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::invalid(
                format!("{field}.failure_threshold"),
                "must be non-zero",
            ));
        }
        if self.cooldown_ms == 0 {
            return Err(ConfigError::invalid(format!("{field}.cooldown_ms"), "must be non-zero"));
        }
        if self.window_ms == 0 {
            return Err(ConfigError::invalid(format!("{field}.window_ms"), "must be non-zero"));
        }
        Ok(())
    }
}

/// 熔断器设置（建连与常规命令分别计数）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    pub connect: BreakerThresholds,
    pub command: BreakerThresholds,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            connect: BreakerThresholds {
                failure_threshold: 3,
                cooldown_ms: 30_000,
                window_ms: 60_000,
            },
            command: BreakerThresholds {
                failure_threshold: 5,
                cooldown_ms: 60_000,
                window_ms: 60_000,
            },
        }
    }
}

impl BreakerSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.connect.validate("breaker.connect")?;
        self.command.validate("breaker.command")
    }
}

/// 租约设置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseSettings {
    /// 过期租约清扫周期
    pub sweep_interval_ms: u64,
}

impl Default for LeaseSettings {
    fn default() -> Self {
        Self {
            sweep_interval_ms: 1_000,
        }
    }
}

impl LeaseSettings {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sweep_interval_ms == 0 {
            return Err(ConfigError::invalid("lease.sweep_interval_ms", "must be non-zero"));
        }
        Ok(())
    }
}

/// 状态广播设置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcasterSettings {
    /// 推送周期（默认 100 ms，约 10 Hz）
    pub interval_ms: u64,
    /// 每个订阅者的缓冲条数（满了丢最旧）
    pub buffer: usize,
}

impl Default for BroadcasterSettings {
    fn default() -> Self {
        Self {
            interval_ms: 100,
            buffer: 32,
        }
    }
}

impl BroadcasterSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval_ms == 0 {
            return Err(ConfigError::invalid("broadcaster.interval_ms", "must be non-zero"));
        }
        if self.buffer == 0 {
            return Err(ConfigError::invalid("broadcaster.buffer", "must be non-zero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_breaker_defaults() {
        let settings = BreakerSettings::default();
        assert_eq!(settings.connect.failure_threshold, 3);
        assert_eq!(settings.connect.cooldown(), Duration::from_secs(30));
        assert_eq!(settings.command.failure_threshold, 5);
        assert_eq!(settings.command.cooldown(), Duration::from_secs(60));
        assert_eq!(settings.command.window(), Duration::from_secs(60));
        settings.validate().unwrap();
    }

    #[test]
    fn test_zero_threshold_rejected() {
        let mut settings = BreakerSettings::default();
        settings.command.failure_threshold = 0;
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("breaker.command.failure_threshold"), "{err}");
    }

    #[test]
    fn test_broadcaster_defaults() {
        let settings = BroadcasterSettings::default();
        assert_eq!(settings.interval(), Duration::from_millis(100));
        assert_eq!(settings.buffer, 32);
        settings.validate().unwrap();

        let settings = BroadcasterSettings {
            buffer: 0,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_lease_defaults() {
        let settings = LeaseSettings::default();
        assert_eq!(settings.sweep_interval(), Duration::from_secs(1));
        settings.validate().unwrap();
    }
}
