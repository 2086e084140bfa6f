//! 系统配置（TOML）
//!
//! ```toml
//! [[robots]]
//! robot_id = "meca"
//! ip = "192.168.0.100"
//! bind = "enp3s0"
//!
//! [movement]
//! align_speed = 20.0
//!
//! [breaker.command]
//! failure_threshold = 5
//! cooldown_ms = 60000
//! window_ms = 60000
//! ```
//!
//! 未出现的字段取默认值。

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{
    BreakerSettings, BroadcasterSettings, ConfigError, LeaseSettings, MovementParams,
    PositionsConfig, RobotConfig, SequenceOffsets,
};

/// 系统配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub robots: Vec<RobotConfig>,
    pub movement: MovementParams,
    pub positions: PositionsConfig,
    pub offsets: SequenceOffsets,
    pub breaker: BreakerSettings,
    pub lease: LeaseSettings,
    pub broadcaster: BroadcasterSettings,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            robots: vec![RobotConfig::default()],
            movement: MovementParams::default(),
            positions: PositionsConfig::default(),
            offsets: SequenceOffsets::default(),
            breaker: BreakerSettings::default(),
            lease: LeaseSettings::default(),
            broadcaster: BroadcasterSettings::default(),
        }
    }
}

impl SystemConfig {
    /// 解析并校验
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: SystemConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// 从文件加载并校验
    ///
    /// 配置文件路径（CLI 默认）：
    /// - Linux/macOS: `~/.config/meca/config.toml`
    /// - Windows: `%APPDATA%\meca\config.toml`
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let text = self.to_toml_string()?;
        fs::write(path, text).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.robots.is_empty() {
            return Err(ConfigError::invalid("robots", "at least one robot is required"));
        }

        let mut seen = HashSet::new();
        for (index, robot) in self.robots.iter().enumerate() {
            robot.validate(&format!("robots[{index}]"))?;
            if !seen.insert(robot.robot_id.as_str()) {
                return Err(ConfigError::invalid(
                    format!("robots[{index}].robot_id"),
                    format!("duplicate robot id {:?}", robot.robot_id),
                ));
            }
        }

        self.movement.validate()?;
        self.positions.validate()?;
        self.breaker.validate()?;
        self.lease.validate()?;
        self.broadcaster.validate()
    }

    /// 按 ID 查找机械臂
    pub fn robot(&self, robot_id: &str) -> Result<&RobotConfig, ConfigError> {
        self.robots
            .iter()
            .find(|robot| robot.robot_id == robot_id)
            .ok_or_else(|| ConfigError::UnknownRobot(robot_id.to_string()))
    }

    /// 第一台机械臂（单机部署的默认目标）
    pub fn default_robot(&self) -> Result<&RobotConfig, ConfigError> {
        self.robots
            .first()
            .ok_or_else(|| ConfigError::invalid("robots", "at least one robot is required"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = SystemConfig::from_toml_str("").unwrap();
        assert_eq!(config, SystemConfig::default());
        assert_eq!(config.default_robot().unwrap().robot_id, "meca");
    }

    #[test]
    fn test_partial_override() {
        let config = SystemConfig::from_toml_str(
            r#"
            [[robots]]
            robot_id = "meca-a"
            ip = "10.0.0.5"
            bind = "enp3s0"
            lease_duration_ms = 5000
            heartbeat_interval_ms = 1000
            safe_joints = [0.0, -20.0, 20.0, 0.0, 30.0, 0.0]

            [movement]
            align_speed = 15.0

            [broadcaster]
            buffer = 8
            "#,
        )
        .unwrap();

        let robot = config.robot("meca-a").unwrap();
        assert_eq!(robot.ip, "10.0.0.5");
        assert_eq!(robot.bind.as_deref(), Some("enp3s0"));
        assert_eq!(robot.control_port, 10000);
        assert_eq!(robot.lease_duration_ms, 5000);
        assert_eq!(robot.safe_joints[1], -20.0);
        assert_eq!(config.movement.align_speed, 15.0);
        assert_eq!(config.movement.speed, 35.0);
        assert_eq!(config.broadcaster.buffer, 8);
        assert_eq!(config.broadcaster.interval_ms, 100);
        assert!(matches!(config.robot("other"), Err(ConfigError::UnknownRobot(_))));
    }

    #[test]
    fn test_duplicate_robot_ids_rejected() {
        let err = SystemConfig::from_toml_str(
            r#"
            [[robots]]
            robot_id = "meca"
            [[robots]]
            robot_id = "meca"
            ip = "10.0.0.6"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate robot id"), "{err}");
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = SystemConfig::from_toml_str(
            r#"
            [movement]
            speed = 150.0
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));

        let err = SystemConfig::from_toml_str(
            r#"
            [positions]
            gen_drop = [[0.0, 0.0, 0.0, 0.0, 0.0, 0.0]]
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("gen_drop"), "{err}");
    }

    #[test]
    fn test_parse_error() {
        let err = SystemConfig::from_toml_str("[[robots]\nip = ").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_file_roundtrip() {
        let mut config = SystemConfig::default();
        config.robots[0].bind = Some("192.168.0.10".to_string());
        config.movement.spread_wait_s = 2.0;

        let file = NamedTempFile::new().unwrap();
        config.save_to_file(file.path()).unwrap();

        let loaded = SystemConfig::load_from_file(file.path()).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_from_written_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[lease]\nsweep_interval_ms = 250").unwrap();

        let config = SystemConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.lease.sweep_interval_ms, 250);
    }

    #[test]
    fn test_missing_file() {
        let err = SystemConfig::load_from_file("/nonexistent/meca/config.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
        assert!(err.to_string().contains("/nonexistent/meca/config.toml"));
    }

    #[test]
    fn test_json_view_of_defaults() {
        // 外层 API 以 JSON 展示配置
        let json = serde_json::to_value(SystemConfig::default()).unwrap();
        assert_eq!(json["robots"][0]["control_port"], 10000);
        assert_eq!(json["breaker"]["connect"]["failure_threshold"], 3);
    }
}
