//! 驱动配置

use std::time::Duration;

use meca_protocol::Command;
use meca_transport::{RetryPolicy, TransportConfig};

/// 默认控制端口
pub const DEFAULT_CONTROL_PORT: u16 = 10000;
/// 默认监控端口
pub const DEFAULT_MONITOR_PORT: u16 = 10001;

/// 驱动配置
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// 机械臂地址
    pub host: String,
    pub control_port: u16,
    pub monitor_port: u16,
    /// 传输层配置（绑定网卡、建连超时）
    pub transport: TransportConfig,
    /// Immediate 命令的应答超时
    pub command_timeout: Duration,
    /// 等待 `[3000]` 握手的超时
    pub handshake_timeout: Duration,
    /// 只读查询在读超时后的重发次数（不关闭连接）
    pub query_retries: u32,
    /// 断线重连策略
    pub reconnect: RetryPolicy,
    /// 监控端口推送周期
    pub monitor_interval: Duration,
    /// 连续错过多少个推送周期视为断线
    pub monitor_missed_intervals: u32,
    /// 接收线程单次读超时（决定退出响应速度）
    pub poll_interval: Duration,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            host: "192.168.0.100".to_string(),
            control_port: DEFAULT_CONTROL_PORT,
            monitor_port: DEFAULT_MONITOR_PORT,
            transport: TransportConfig::default(),
            command_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(5),
            query_retries: 2,
            reconnect: RetryPolicy::default(),
            monitor_interval: Duration::from_millis(100),
            monitor_missed_intervals: 5,
            poll_interval: Duration::from_millis(50),
        }
    }
}

impl DriverConfig {
    pub fn new(host: impl Into<String>, control_port: u16, monitor_port: u16) -> Self {
        Self {
            host: host.into(),
            control_port,
            monitor_port,
            ..Default::default()
        }
    }

    /// 监控端口静默多久后重连
    pub fn monitor_silence_timeout(&self) -> Duration {
        self.monitor_interval * self.monitor_missed_intervals.max(1)
    }
}

/// 运动参数初始化集合
///
/// 激活后、执行序列前一次性下发。
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterSet {
    /// 夹爪力（%）
    pub gripper_force: f64,
    /// 关节加速度（%）
    pub joint_acc: f64,
    /// 六轴力矩限制（%）
    pub torque_limits: [f64; 6],
    /// 力矩超限策略 (severity, skip_acceleration)
    pub torque_limits_cfg: (u8, u8),
    /// 轨迹融合（%）
    pub blending: f64,
    /// 姿态配置
    pub conf: (i8, i8, i8),
}

impl Default for ParameterSet {
    fn default() -> Self {
        Self {
            gripper_force: 100.0,
            joint_acc: 50.0,
            torque_limits: [40.0; 6],
            torque_limits_cfg: (2, 1),
            blending: 0.0,
            conf: (1, 1, 1),
        }
    }
}

impl ParameterSet {
    /// 展开为命令序列（均为 Queued 命令）
    pub fn commands(&self) -> Vec<Command> {
        let (c1, c3, c5) = self.conf;
        let (severity, skip_acc) = self.torque_limits_cfg;
        vec![
            Command::SetGripperForce(self.gripper_force),
            Command::SetJointAcc(self.joint_acc),
            Command::SetTorqueLimits(self.torque_limits),
            Command::SetTorqueLimitsCfg(severity, skip_acc),
            Command::SetBlending(self.blending),
            Command::SetConf(c1, c3, c5),
        ]
    }
}
