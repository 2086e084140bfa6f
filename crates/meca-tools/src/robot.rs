//! 单台机械臂的连接配置
//!
//! 核心层只接收解析完成的对象，不直接读取环境变量或配置文件。

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// 单台机械臂的连接配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RobotConfig {
    /// 机械臂 ID（注册表键）
    pub robot_id: String,
    /// 控制器地址
    pub ip: String,
    pub control_port: u16,
    pub monitor_port: u16,
    /// 绑定网卡名或本地 IP（为空则由路由表决定）
    pub bind: Option<String>,
    pub connection_timeout_ms: u64,
    pub command_timeout_ms: u64,
    pub lease_duration_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// 安全回零时先移到的关节位（度）
    pub safe_joints: [f64; 6],
}

impl Default for RobotConfig {
    fn default() -> Self {
        Self {
            robot_id: "meca".to_string(),
            ip: "192.168.0.100".to_string(),
            control_port: 10000,
            monitor_port: 10001,
            bind: None,
            connection_timeout_ms: 10_000,
            command_timeout_ms: 30_000,
            lease_duration_ms: 30_000,
            heartbeat_interval_ms: 10_000,
            safe_joints: [0.0; 6],
        }
    }
}

impl RobotConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_millis(self.lease_duration_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// 校验（`prefix` 用于错误信息中的字段路径）
    pub fn validate(&self, prefix: &str) -> Result<(), ConfigError> {
        let field = |name: &str| format!("{prefix}.{name}");

        if self.robot_id.trim().is_empty() {
            return Err(ConfigError::invalid(field("robot_id"), "must not be empty"));
        }
        if self.ip.trim().is_empty() {
            return Err(ConfigError::invalid(field("ip"), "must not be empty"));
        }
        if self.control_port == 0 {
            return Err(ConfigError::invalid(field("control_port"), "must be non-zero"));
        }
        if self.monitor_port == 0 {
            return Err(ConfigError::invalid(field("monitor_port"), "must be non-zero"));
        }
        if self.control_port == self.monitor_port {
            return Err(ConfigError::invalid(
                field("monitor_port"),
                format!("must differ from control_port {}", self.control_port),
            ));
        }

        for (name, value) in [
            ("connection_timeout_ms", self.connection_timeout_ms),
            ("command_timeout_ms", self.command_timeout_ms),
            ("lease_duration_ms", self.lease_duration_ms),
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::invalid(field(name), "must be non-zero"));
            }
        }

        // 心跳必须赶在租约过期之前
        if self.heartbeat_interval_ms >= self.lease_duration_ms {
            return Err(ConfigError::invalid(
                field("heartbeat_interval_ms"),
                format!(
                    "{} must be shorter than lease_duration_ms {}",
                    self.heartbeat_interval_ms, self.lease_duration_ms
                ),
            ));
        }

        if let Some(value) = self.safe_joints.iter().find(|v| !v.is_finite()) {
            return Err(ConfigError::invalid(
                field("safe_joints"),
                format!("{value} is not a finite angle"),
            ));
        }

        Ok(())
    }
}
