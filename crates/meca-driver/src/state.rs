//! 状态快照与共享上下文
//!
//! 监控线程写入、任意线程无锁读取（`ArcSwap`）。

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use arc_swap::ArcSwap;
use meca_protocol::{JointSet, MonitorMessage, Pose, StatusFlags};

use crate::freshness::TelemetryWatch;

/// 机器人状态快照（只读）
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RobotStatus {
    /// 关节角（度）
    pub joints: JointSet,
    /// 末端位姿（mm / 度）
    pub pose: Pose,
    /// 状态位（使能、回零、错误、暂停……）
    pub flags: StatusFlags,
    /// 最近一次更新的 UNIX 时间（毫秒），0 表示尚未收到遥测
    pub timestamp_ms: u64,
}

impl RobotStatus {
    /// 已收到过至少一帧遥测
    pub fn has_telemetry(&self) -> bool {
        self.timestamp_ms != 0
    }

    fn apply(&mut self, message: &MonitorMessage) -> bool {
        match message {
            MonitorMessage::Joints(joints) => self.joints = *joints,
            MonitorMessage::Pose(pose) => self.pose = *pose,
            MonitorMessage::Status(flags) => self.flags = *flags,
            MonitorMessage::Other(_) => return false,
        }
        self.timestamp_ms = unix_millis();
        true
    }
}

pub(crate) fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// 驱动共享上下文
///
/// 由控制会话、监控线程和上层读取者共享。
#[derive(Debug)]
pub struct DriverContext {
    status: ArcSwap<RobotStatus>,
    /// 遥测新鲜度
    pub telemetry: TelemetryWatch,
    control_connected: AtomicBool,
    monitor_connected: AtomicBool,
    /// 控制会话代数：每建立一次新的控制连接加 1
    session_generation: AtomicU64,
    monitor_reconnects: AtomicU64,
}

impl DriverContext {
    pub fn new(silence_timeout: Duration) -> Self {
        Self {
            status: ArcSwap::from_pointee(RobotStatus::default()),
            telemetry: TelemetryWatch::new(silence_timeout),
            control_connected: AtomicBool::new(false),
            monitor_connected: AtomicBool::new(false),
            session_generation: AtomicU64::new(0),
            monitor_reconnects: AtomicU64::new(0),
        }
    }

    /// 当前状态快照
    pub fn status(&self) -> Arc<RobotStatus> {
        self.status.load_full()
    }

    /// 应用一条遥测
    pub fn apply_telemetry(&self, message: &MonitorMessage) {
        let mut applied = false;
        self.status.rcu(|current| {
            let mut next = RobotStatus::clone(current);
            applied = next.apply(message);
            next
        });
        if applied {
            self.telemetry.record_frame();
        }
    }

    /// 用控制端口查询到的状态位覆盖快照
    pub fn apply_flags(&self, flags: StatusFlags) {
        self.apply_telemetry(&MonitorMessage::Status(flags));
    }

    /// 局部更新状态位（如收到 `[2000]` 后标记已使能）
    pub fn update_flags(&self, update: impl Fn(&mut StatusFlags)) {
        self.status.rcu(|current| {
            let mut next = RobotStatus::clone(current);
            update(&mut next.flags);
            next
        });
    }

    pub fn is_control_connected(&self) -> bool {
        self.control_connected.load(Ordering::Acquire)
    }

    pub(crate) fn set_control_connected(&self, connected: bool) {
        self.control_connected.store(connected, Ordering::Release);
    }

    pub fn is_monitor_connected(&self) -> bool {
        self.monitor_connected.load(Ordering::Acquire)
    }

    pub(crate) fn set_monitor_connected(&self, connected: bool) {
        self.monitor_connected.store(connected, Ordering::Release);
    }

    pub fn session_generation(&self) -> u64 {
        self.session_generation.load(Ordering::Acquire)
    }

    pub(crate) fn begin_session(&self) -> u64 {
        self.session_generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn monitor_reconnects(&self) -> u64 {
        self.monitor_reconnects.load(Ordering::Relaxed)
    }

    pub(crate) fn record_monitor_reconnect(&self) {
        self.monitor_reconnects.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_telemetry_updates_snapshot() {
        let ctx = DriverContext::new(Duration::from_secs(1));
        assert!(!ctx.status().has_telemetry());

        let pose = Pose::new(135.0, -17.6, 160.0, 123.3, 40.9, -101.3);
        ctx.apply_telemetry(&MonitorMessage::Pose(pose));

        let status = ctx.status();
        assert_eq!(status.pose, pose);
        assert!(status.has_telemetry());
        assert_eq!(ctx.telemetry.frames_received(), 1);
    }

    #[test]
    fn test_other_messages_ignored() {
        let ctx = DriverContext::new(Duration::from_secs(1));
        ctx.apply_telemetry(&MonitorMessage::Other(meca_protocol::Response::new(3000, "hi")));
        assert!(!ctx.status().has_telemetry());
        assert_eq!(ctx.telemetry.frames_received(), 0);
    }

    #[test]
    fn test_update_flags_keeps_other_fields() {
        let ctx = DriverContext::new(Duration::from_secs(1));
        let joints = JointSet([1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        ctx.apply_telemetry(&MonitorMessage::Joints(joints));
        ctx.update_flags(|flags| flags.activated = true);

        let status = ctx.status();
        assert!(status.flags.activated);
        assert_eq!(status.joints, joints);
    }

    #[test]
    fn test_session_generation() {
        let ctx = DriverContext::new(Duration::from_secs(1));
        assert_eq!(ctx.session_generation(), 0);
        assert_eq!(ctx.begin_session(), 1);
        assert_eq!(ctx.begin_session(), 2);
        assert_eq!(ctx.session_generation(), 2);
    }
}
