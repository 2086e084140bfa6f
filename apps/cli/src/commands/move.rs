//! 移动命令
//!
//! 移动机械臂到目标位姿或关节角，包含范围检查和确认机制

use anyhow::Result;
use clap::Args;

use crate::session::{Session, SessionOptions};
use crate::validation::{JointValidator, parse_six};

/// 移动命令参数
#[derive(Args, Debug)]
pub struct MoveCommand {
    /// 目标位姿 x,y,z (mm), rx,ry,rz (度)
    /// 例如：135,-17.6,160,123.3,40.9,-101.3
    #[arg(short, long, allow_hyphen_values = true)]
    pub pose: Option<String>,

    /// 目标关节角（度），逗号分隔
    #[arg(short, long, allow_hyphen_values = true, conflicts_with = "pose")]
    pub joints: Option<String>,

    /// 直线插补（只对 --pose 生效）
    #[arg(long, requires = "pose")]
    pub linear: bool,
}

/// 解析后的目标
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MoveTarget {
    Pose([f64; 6]),
    Linear([f64; 6]),
    Joints([f64; 6]),
}

impl MoveCommand {
    /// 解析目标
    pub fn target(&self) -> Result<MoveTarget> {
        if let Some(pose) = &self.pose {
            let pose = parse_six(pose, "位姿")?;
            return Ok(if self.linear {
                MoveTarget::Linear(pose)
            } else {
                MoveTarget::Pose(pose)
            });
        }

        let joints = self
            .joints
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("未指定目标，请使用 --pose 或 --joints 参数"))?;
        let joints = parse_six(joints, "关节角")?;
        JointValidator::meca500().validate_joints(&joints)?;
        Ok(MoveTarget::Joints(joints))
    }

    /// 执行移动
    pub fn execute(&self, options: &SessionOptions) -> Result<()> {
        let target = self.target()?;

        let mut session = Session::open(options)?;
        session.activate()?;

        println!("⏳ 正在移动到目标位置...");
        let api = session.api();
        let (robot, holder) = (session.robot_id(), session.holder());
        let result = match target {
            MoveTarget::Pose(pose) => {
                print_six("位姿", &pose);
                api.move_pose(robot, holder, pose)
            },
            MoveTarget::Linear(pose) => {
                print_six("位姿（直线）", &pose);
                api.move_lin(robot, holder, pose)
            },
            MoveTarget::Joints(joints) => {
                print_six("关节角", &joints);
                api.move_joints(robot, holder, joints)
            },
        };
        result.into_result()?;

        println!("✅ 移动完成");
        Ok(())
    }
}

fn print_six(label: &str, values: &[f64; 6]) {
    let text: Vec<String> = values.iter().map(|v| format!("{:.3}", v)).collect();
    println!("  {}: [{}]", label, text.join(", "));
}
