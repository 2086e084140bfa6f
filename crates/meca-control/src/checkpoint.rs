//! 序列检查点
//!
//! 检查点只在某一步的物理效果被控制器确认后写入，记录“下一步从哪里开始”。
//! 每台机械臂最多一个检查点，批次正常结束时删除。

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use meca_client::events::unix_millis;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{SequenceError, SequenceKind};

/// 恢复点
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceCheckpoint {
    pub sequence_id: String,
    pub robot_id: String,
    pub kind: SequenceKind,
    /// 批次起点（从 0 开始）
    pub start: usize,
    pub count: usize,
    /// 本次运行要处理的片序号（从 0 开始；重试时只含失败的片）
    pub items: Vec<usize>,
    /// `items` 中当前片的位置
    pub position: usize,
    /// 当前片下一步的序号（之前的步骤都已确认）
    pub next_step: usize,
    /// 准备段已完成
    pub setup_done: bool,
    /// 夹爪中有片
    pub holding: bool,
    /// 已完成的片（从 1 开始编号）
    pub completed: Vec<usize>,
    /// 失败的片（从 1 开始编号）
    pub failed: Vec<usize>,
    pub retry: bool,
    /// 批次在夹持中被放弃，等待操作员确认夹爪已空
    #[serde(default)]
    pub abandoned: bool,
    pub updated_ms: u64,
}

impl SequenceCheckpoint {
    /// 当前片序号（全部完成时为 `None`）
    pub fn current_item(&self) -> Option<usize> {
        self.items.get(self.position).copied()
    }

    pub fn is_finished(&self) -> bool {
        self.position >= self.items.len()
    }

    /// 已有步骤被确认（不是全新开始）
    pub fn has_progress(&self) -> bool {
        self.setup_done || self.position > 0 || self.next_step > 0
    }

    pub(crate) fn touch(&mut self) {
        self.updated_ms = unix_millis();
    }
}

/// 检查点存储
pub trait CheckpointStore: Send + Sync {
    fn load(&self, robot_id: &str) -> Result<Option<SequenceCheckpoint>, SequenceError>;

    fn save(&self, checkpoint: &SequenceCheckpoint) -> Result<(), SequenceError>;

    fn clear(&self, robot_id: &str) -> Result<(), SequenceError>;
}

/// 进程内存储（进程退出即丢失）
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    checkpoints: Mutex<HashMap<String, SequenceCheckpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn load(&self, robot_id: &str) -> Result<Option<SequenceCheckpoint>, SequenceError> {
        Ok(self.checkpoints.lock().get(robot_id).cloned())
    }

    fn save(&self, checkpoint: &SequenceCheckpoint) -> Result<(), SequenceError> {
        self.checkpoints
            .lock()
            .insert(checkpoint.robot_id.clone(), checkpoint.clone());
        Ok(())
    }

    fn clear(&self, robot_id: &str) -> Result<(), SequenceError> {
        self.checkpoints.lock().remove(robot_id);
        Ok(())
    }
}

/// JSON 文件存储：每台机械臂一个 `<dir>/<robot_id>.json`
///
/// 先写临时文件再改名，进程在写入中途退出时旧检查点保持完整。
#[derive(Debug, Clone)]
pub struct JsonFileCheckpointStore {
    dir: PathBuf,
}

impl JsonFileCheckpointStore {
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self, SequenceError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, robot_id: &str) -> Result<PathBuf, SequenceError> {
        if robot_id.is_empty()
            || !robot_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            || robot_id.starts_with('.')
        {
            return Err(SequenceError::CheckpointMismatch(format!(
                "robot id {robot_id:?} cannot be used as a file name"
            )));
        }
        Ok(self.dir.join(format!("{robot_id}.json")))
    }
}

impl CheckpointStore for JsonFileCheckpointStore {
    fn load(&self, robot_id: &str) -> Result<Option<SequenceCheckpoint>, SequenceError> {
        let path = self.path(robot_id)?;
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let checkpoint: SequenceCheckpoint = serde_json::from_str(&text)?;
        if checkpoint.robot_id != robot_id {
            return Err(SequenceError::CheckpointMismatch(format!(
                "{} holds a checkpoint for {}",
                path.display(),
                checkpoint.robot_id
            )));
        }
        Ok(Some(checkpoint))
    }

    fn save(&self, checkpoint: &SequenceCheckpoint) -> Result<(), SequenceError> {
        let path = self.path(&checkpoint.robot_id)?;
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(checkpoint)?;
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &path)?;
        debug!(
            robot_id = %checkpoint.robot_id,
            position = checkpoint.position,
            next_step = checkpoint.next_step,
            "Checkpoint saved to {}",
            path.display()
        );
        Ok(())
    }

    fn clear(&self, robot_id: &str) -> Result<(), SequenceError> {
        let path = self.path(robot_id)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
