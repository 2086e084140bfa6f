//! 序列引擎对机械臂的需求
//!
//! 引擎只通过 [`SequenceRobot`] 操作机械臂；生产实现是 [`RobotService`]，
//! 每一步都经过租约、熔断器与原子状态检查。

use std::time::Duration;

use meca_client::{ClientError, Lease, OperationState, RobotService};
use meca_protocol::{Command, Pose};

/// 序列引擎使用的机械臂操作
pub trait SequenceRobot: Send + Sync {
    fn robot_id(&self) -> &str;

    fn operation_state(&self) -> OperationState;

    /// 执行一步并等待物理完成确认
    fn execute_step(&self, lease: &Lease, command: Command, timeout: Duration) -> Result<(), ClientError>;

    fn pause_motion(&self, lease: &Lease) -> Result<(), ClientError>;

    fn resume_motion(&self, lease: &Lease) -> Result<(), ClientError>;

    /// 清空运动队列（在途步骤的确认被丢弃）
    fn clear_motion(&self, lease: &Lease) -> Result<(), ClientError>;

    /// 下发关节速度（不等待确认，暂停中也可下发）
    fn apply_speed(&self, lease: &Lease, percent: f64) -> Result<(), ClientError>;

    fn renew_lease(&self, lease: &Lease) -> Result<Lease, ClientError>;

    /// 遥测中的当前位姿（遥测不可用时为 `None`）
    fn current_pose(&self) -> Option<Pose>;
}

impl SequenceRobot for RobotService {
    fn robot_id(&self) -> &str {
        RobotService::robot_id(self)
    }

    fn operation_state(&self) -> OperationState {
        self.state()
    }

    fn execute_step(&self, lease: &Lease, command: Command, timeout: Duration) -> Result<(), ClientError> {
        self.execute_confirmed(lease, command, timeout)
    }

    fn pause_motion(&self, lease: &Lease) -> Result<(), ClientError> {
        self.pause(lease)
    }

    fn resume_motion(&self, lease: &Lease) -> Result<(), ClientError> {
        self.resume(lease)
    }

    fn clear_motion(&self, lease: &Lease) -> Result<(), ClientError> {
        RobotService::clear_motion(self, lease)
    }

    fn apply_speed(&self, lease: &Lease, percent: f64) -> Result<(), ClientError> {
        self.set_velocity(lease, percent)
    }

    fn renew_lease(&self, lease: &Lease) -> Result<Lease, ClientError> {
        self.heartbeat(lease)
    }

    fn current_pose(&self) -> Option<Pose> {
        let snapshot = self.snapshot();
        (snapshot.connected && snapshot.monitor_healthy).then(|| Pose::from_array(snapshot.pose))
    }
}
