//! 输入验证模块
//!
//! 解析逗号分隔的六元组，并按 Meca500 关节范围检查关节角

use anyhow::{Context, Result};

/// Meca500 关节范围（度）
const JOINT_LIMITS: [(f64, f64); 6] = [
    (-175.0, 175.0),
    (-70.0, 90.0),
    (-135.0, 70.0),
    (-170.0, 170.0),
    (-115.0, 115.0),
    (-180.0, 180.0),
];

/// 解析 6 个逗号分隔的数值
///
/// 例如 `135,-17.6,160,123.3,40.9,-101.3`
pub fn parse_six(text: &str, what: &str) -> Result<[f64; 6]> {
    let values: Vec<f64> = text
        .split(',')
        .map(|s| s.trim().parse::<f64>())
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("解析{}失败", what))?;

    let array: [f64; 6] = values
        .as_slice()
        .try_into()
        .map_err(|_| anyhow::anyhow!("{}需要 6 个数值，得到 {} 个", what, values.len()))?;

    for (i, value) in array.iter().enumerate() {
        if !value.is_finite() {
            anyhow::bail!("{}第 {} 个数值无效: {}", what, i + 1, value);
        }
    }

    Ok(array)
}

/// 关节角验证器
pub struct JointValidator {
    limits: [(f64, f64); 6],
}

impl JointValidator {
    pub fn meca500() -> Self {
        Self {
            limits: JOINT_LIMITS,
        }
    }

    pub fn validate_joints(&self, joints: &[f64; 6]) -> Result<()> {
        for (i, (&angle, &(min, max))) in joints.iter().zip(self.limits.iter()).enumerate() {
            if angle < min || angle > max {
                anyhow::bail!(
                    "关节 J{} 角度 {:.2}° 超出范围 [{:.1}°, {:.1}°]",
                    i + 1,
                    angle,
                    min,
                    max
                );
            }
        }
        Ok(())
    }
}

impl Default for JointValidator {
    fn default() -> Self {
        Self::meca500()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_six() {
        let pose = parse_six("135, -17.6, 160, 123.3, 40.9, -101.3", "位姿").unwrap();
        assert_eq!(pose, [135.0, -17.6, 160.0, 123.3, 40.9, -101.3]);
    }

    #[test]
    fn test_parse_six_rejects_wrong_count() {
        let err = parse_six("1,2,3", "位姿").unwrap_err();
        assert!(err.to_string().contains("得到 3 个"));
    }

    #[test]
    fn test_parse_six_rejects_garbage() {
        assert!(parse_six("1,2,x,4,5,6", "关节角").is_err());
        assert!(parse_six("1,2,NaN,4,5,6", "关节角").is_err());
    }

    #[test]
    fn test_joint_limits() {
        let validator = JointValidator::meca500();
        assert!(validator.validate_joints(&[0.0; 6]).is_ok());
        assert!(validator.validate_joints(&[0.0, 95.0, 0.0, 0.0, 0.0, 0.0]).is_err());
        assert!(validator.validate_joints(&[0.0, 0.0, -135.0, 0.0, 0.0, 0.0]).is_ok());
    }
}
