//! One-shot 会话
//!
//! 每个命令独立执行：
//! 1. 读取配置
//! 2. 获取租约并连接机械臂
//! 3. 执行操作
//! 4. 释放租约、断开连接（`Drop`）

use anyhow::{Context, Result, bail};
use meca_sdk::control::JsonFileCheckpointStore;
use meca_sdk::{LeaseInfo, RobotApi};
use meca_sdk::tools::SystemConfig;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// 默认配置文件：`<config_dir>/meca/config.toml`
pub fn default_config_file() -> Result<PathBuf> {
    let mut path = dirs::config_dir().ok_or_else(|| anyhow::anyhow!("无法确定配置目录"))?;
    path.push("meca");
    path.push("config.toml");
    Ok(path)
}

/// 检查点目录：`<data_dir>/meca/checkpoints`
fn checkpoint_dir() -> Result<PathBuf> {
    let mut path = dirs::data_dir().ok_or_else(|| anyhow::anyhow!("无法确定数据目录"))?;
    path.push("meca");
    path.push("checkpoints");
    Ok(path)
}

/// 全局命令行选项
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub config: Option<PathBuf>,
    pub robot: Option<String>,
    pub holder: String,
    pub assume_yes: bool,
}

impl SessionOptions {
    /// 实际使用的配置文件路径
    pub fn config_path(&self) -> Result<PathBuf> {
        match &self.config {
            Some(path) => Ok(path.clone()),
            None => default_config_file(),
        }
    }

    /// 加载配置
    ///
    /// 显式指定的文件必须存在；默认位置没有文件时使用内置默认值。
    pub fn load_config(&self) -> Result<SystemConfig> {
        let path = self.config_path()?;
        if self.config.is_none() && !path.exists() {
            warn!(path = %path.display(), "Config file not found, using defaults");
            return Ok(SystemConfig::default());
        }

        SystemConfig::load_from_file(&path)
            .with_context(|| format!("加载配置失败: {}", path.display()))
    }

    /// 目标机械臂 ID（未指定时取配置中的第一台）
    pub fn robot_id(&self, config: &SystemConfig) -> Result<String> {
        let robot = match &self.robot {
            Some(id) => config.robot(id)?,
            None => config.default_robot()?,
        };
        Ok(robot.robot_id.clone())
    }
}

/// 单台机械臂的一次性会话
pub struct Session {
    api: RobotApi,
    robot_id: String,
    holder: String,
    assume_yes: bool,
    leased: bool,
}

impl Session {
    /// 读取配置并创建 API（尚未连接）
    pub fn open(options: &SessionOptions) -> Result<Self> {
        let config = options.load_config()?;
        let robot_id = options.robot_id(&config)?;

        let store = JsonFileCheckpointStore::new(checkpoint_dir()?).context("打开检查点目录失败")?;
        let api = RobotApi::from_config(config)?.with_checkpoint_store(Arc::new(store));

        Ok(Self {
            api,
            robot_id,
            holder: options.holder.clone(),
            assume_yes: options.assume_yes,
            leased: false,
        })
    }

    pub fn api(&self) -> &RobotApi {
        &self.api
    }

    pub fn robot_id(&self) -> &str {
        &self.robot_id
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    pub fn assume_yes(&self) -> bool {
        self.assume_yes
    }

    /// 获取租约（重复调用只续约）
    pub fn acquire(&mut self) -> Result<LeaseInfo> {
        let lease = if self.leased {
            self.api.heartbeat(&self.robot_id, &self.holder)
        } else {
            self.api.acquire_lease(&self.robot_id, &self.holder, None)
        }
        .into_result()?;
        self.leased = true;
        Ok(lease)
    }

    /// 获取租约并建立连接
    pub fn connect(&mut self) -> Result<()> {
        self.acquire()?;
        println!("🔌 连接到机械臂 {}...", self.robot_id);
        self.api.connect_safe(&self.robot_id, &self.holder).into_result()?;
        println!("✅ 已连接");
        Ok(())
    }

    /// 连接并激活（激活会让机械臂回零，需要确认）
    pub fn activate(&mut self) -> Result<()> {
        self.connect()?;

        if !self.confirm(&format!("机械臂 {} 将被激活并回零，确定要继续吗？", self.robot_id))? {
            bail!("操作已取消");
        }

        println!("⚡ 激活并回零...");
        self.api.confirm_activation(&self.robot_id, &self.holder).into_result()?;
        info!(robot_id = %self.robot_id, holder = %self.holder, "Robot activated");
        println!("✅ 已激活");
        Ok(())
    }

    /// 确认提示（`--yes` 时直接通过）
    pub fn confirm(&self, message: &str) -> Result<bool> {
        if self.assume_yes {
            return Ok(true);
        }

        inquire::Confirm::new(message)
            .with_default(false)
            .prompt()
            .map_err(|e| anyhow::anyhow!("用户交互失败: {}", e))
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.leased {
            let _ = self.api.disconnect(&self.robot_id, &self.holder);
            let _ = self.api.release_lease(&self.robot_id, &self.holder);
        }
    }
}
