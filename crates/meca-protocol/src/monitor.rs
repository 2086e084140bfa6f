//! 监控端口遥测帧
//!
//! 监控端口只读，控制器按固定周期推送关节角、位姿和状态位。

use crate::response::{Response, codes};
use crate::types::{JointSet, Pose, StatusFlags};
use crate::ProtocolError;

/// 监控端口消息
#[derive(Debug, Clone, PartialEq)]
pub enum MonitorMessage {
    /// `[2026][j1,...,j6]`
    Joints(JointSet),
    /// `[2027][x,y,z,α,β,γ]`
    Pose(Pose),
    /// `[2007][as,hs,sm,es,pm,eob,eom]`
    Status(StatusFlags),
    /// 其他帧（保留原样，由上层决定是否关心）
    Other(Response),
}

impl MonitorMessage {
    pub fn from_response(response: Response) -> Result<Self, ProtocolError> {
        match response.code {
            codes::JOINTS => {
                let values = response.values()?;
                Ok(MonitorMessage::Joints(JointSet::from_slice("[2026]", &values)?))
            },
            codes::POSE => {
                let values = response.values()?;
                Ok(MonitorMessage::Pose(Pose::from_slice("[2027]", &values)?))
            },
            codes::STATUS_ROBOT => Ok(MonitorMessage::Status(StatusFlags::parse(
                &response.message,
            )?)),
            _ => Ok(MonitorMessage::Other(response)),
        }
    }

    /// 解析一帧文本
    pub fn parse(frame: &str) -> Result<Self, ProtocolError> {
        Self::from_response(Response::parse(frame)?)
    }

    /// 编码为应答帧（模拟器推送使用）
    pub fn to_response(&self) -> Response {
        let join = |values: &[f64]| {
            values
                .iter()
                .map(|v| format!("{v:.4}"))
                .collect::<Vec<_>>()
                .join(",")
        };

        match self {
            MonitorMessage::Joints(joints) => Response::new(codes::JOINTS, join(&joints.0)),
            MonitorMessage::Pose(pose) => Response::new(codes::POSE, join(&pose.to_array())),
            MonitorMessage::Status(flags) => Response::new(codes::STATUS_ROBOT, flags.encode()),
            MonitorMessage::Other(response) => response.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_joints() {
        let msg = MonitorMessage::parse("[2026][0.0,10.5,-20.0,0.0,45.0,90.0]").unwrap();
        assert_eq!(
            msg,
            MonitorMessage::Joints(JointSet([0.0, 10.5, -20.0, 0.0, 45.0, 90.0]))
        );
    }

    #[test]
    fn test_parse_pose() {
        let msg = MonitorMessage::parse("[2027][135,-17.6177,160,123.2804,40.9554,-101.3308]")
            .unwrap();
        match msg {
            MonitorMessage::Pose(pose) => assert_eq!(pose.z, 160.0),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_status() {
        let msg = MonitorMessage::parse("[2007][1,1,0,0,0,1,1]").unwrap();
        match msg {
            MonitorMessage::Status(flags) => {
                assert!(flags.activated && flags.homed && flags.end_of_block)
            },
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_short_pose_rejected() {
        assert!(matches!(
            MonitorMessage::parse("[2027][1,2,3]"),
            Err(ProtocolError::InvalidArity { expected: 6, actual: 3, .. })
        ));
    }

    #[test]
    fn test_other_frames_preserved() {
        let msg = MonitorMessage::parse("[3004][End of movement.]").unwrap();
        assert_eq!(
            msg,
            MonitorMessage::Other(Response::new(3004, "End of movement."))
        );
    }

    #[test]
    fn test_to_response_parses_back() {
        let msg = MonitorMessage::Status(StatusFlags {
            activated: true,
            homed: true,
            ..Default::default()
        });
        let reparsed = MonitorMessage::from_response(msg.to_response()).unwrap();
        assert_eq!(reparsed, msg);
    }
}
