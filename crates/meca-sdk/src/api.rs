//! 外层 API 入口
//!
//! [`RobotApi`] 把服务层与序列引擎的操作包装成统一的 [`ApiResult`] 信封
//! `{success, data, error}`，供 HTTP / WebSocket 等外层直接序列化。
//!
//! 调用方用持有者 ID 标识自己：先 [`acquire_lease`](RobotApi::acquire_lease)，
//! 之后的命令都带上同一个 `holder_id`。急停和状态查询不需要租约。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use meca_client::{
    ApiError, ClientError, Lease, LeaseSweeper, RECOVERY_SPEED_LIMIT, RobotRegistry, RobotService,
    StatusBroadcaster, StatusSnapshot, Subscription,
};
use meca_control::{
    AuditSink, BatchResult, CheckpointStore, EngineParts, EngineSettings, MemoryCheckpointStore,
    SequenceCheckpoint, SequenceEngine, SequenceError, SequenceKind, SequencePhase,
    TracingAuditSink,
};
use meca_protocol::{JointSet, Pose};
use meca_tools::SystemConfig;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// 统一结果信封
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResult<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<ApiError>,
}

impl<T> ApiResult<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(error: ApiError) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
        }
    }

    /// 失败时的错误类别
    pub fn error_kind(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.kind.as_str())
    }

    pub fn into_result(self) -> Result<T, ApiError> {
        match (self.data, self.error) {
            (Some(data), None) if self.success => Ok(data),
            (_, Some(error)) => Err(error),
            _ => Err(ApiError::new("internal_error", "empty api result")),
        }
    }
}

impl<T> From<Result<T, ClientError>> for ApiResult<T> {
    fn from(result: Result<T, ClientError>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(e) => Self::err(ApiError::from(&e)),
        }
    }
}

impl<T> From<Result<T, SequenceError>> for ApiResult<T> {
    fn from(result: Result<T, SequenceError>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(e) => Self::err(ApiError::new(e.kind(), e.to_string())),
        }
    }
}

/// 租约信息（可序列化）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseInfo {
    pub robot_id: String,
    pub holder_id: String,
    pub token: u64,
    pub duration_ms: u64,
    pub remaining_ms: u64,
}

impl From<&Lease> for LeaseInfo {
    fn from(lease: &Lease) -> Self {
        Self {
            robot_id: lease.robot_id.clone(),
            holder_id: lease.holder_id.clone(),
            token: lease.token,
            duration_ms: lease.duration.as_millis() as u64,
            remaining_ms: lease
                .expires_at
                .saturating_duration_since(std::time::Instant::now())
                .as_millis() as u64,
        }
    }
}

/// 序列引擎状态
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceStatus {
    pub robot_id: String,
    pub phase: SequencePhase,
    pub checkpoint: Option<SequenceCheckpoint>,
    pub last_result: Option<BatchResult>,
}

/// 外层 API
pub struct RobotApi {
    config: SystemConfig,
    registry: Arc<RobotRegistry>,
    broadcaster: StatusBroadcaster,
    leases: Mutex<HashMap<String, Lease>>,
    engines: Mutex<HashMap<String, Arc<SequenceEngine>>>,
    store: Arc<dyn CheckpointStore>,
    audit: Arc<dyn AuditSink>,
    _sweeper: LeaseSweeper,
}

impl RobotApi {
    /// 按配置创建所有机械臂的服务并启动广播与租约清扫（不连接）
    pub fn from_config(config: SystemConfig) -> Result<Self, ClientError> {
        let broadcaster = StatusBroadcaster::new(config.broadcaster.clone());
        let registry = RobotRegistry::from_config(&config, Some(broadcaster.publisher()))?;
        Ok(Self::new(config, Arc::new(registry), broadcaster))
    }

    /// 使用已注册好服务的注册表
    ///
    /// 服务应当用 `broadcaster.publisher()` 发布命令结果。
    pub fn new(
        config: SystemConfig,
        registry: Arc<RobotRegistry>,
        broadcaster: StatusBroadcaster,
    ) -> Self {
        broadcaster.start(registry.clone());
        let sweeper = LeaseSweeper::start(registry.locks().clone(), config.lease.sweep_interval());
        Self {
            config,
            registry,
            broadcaster,
            leases: Mutex::new(HashMap::new()),
            engines: Mutex::new(HashMap::new()),
            store: Arc::new(MemoryCheckpointStore::new()),
            audit: Arc::new(TracingAuditSink),
            _sweeper: sweeper,
        }
    }

    /// 检查点存储（默认进程内）
    pub fn with_checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn config(&self) -> &SystemConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<RobotRegistry> {
        &self.registry
    }

    // ==================== 租约 ====================

    pub fn acquire_lease(
        &self,
        robot_id: &str,
        holder_id: &str,
        duration: Option<Duration>,
    ) -> ApiResult<LeaseInfo> {
        let result = self.service(robot_id).and_then(|service| {
            let lease = service.acquire_lease(holder_id, duration)?;
            let info = LeaseInfo::from(&lease);
            self.leases.lock().insert(robot_id.to_string(), lease);
            Ok(info)
        });
        self.respond("acquire_lease", robot_id, result)
    }

    pub fn heartbeat(&self, robot_id: &str, holder_id: &str) -> ApiResult<LeaseInfo> {
        let result = self.with_lease(robot_id, holder_id, |service, lease| {
            let renewed = service.heartbeat(lease)?;
            let info = LeaseInfo::from(&renewed);
            self.leases.lock().insert(robot_id.to_string(), renewed);
            Ok(info)
        });
        self.respond("heartbeat", robot_id, result)
    }

    /// 释放租约；返回租约是否仍然有效并被释放
    pub fn release_lease(&self, robot_id: &str, holder_id: &str) -> ApiResult<bool> {
        let result = self.with_lease(robot_id, holder_id, |service, lease| {
            let released = service.release_lease(lease);
            self.leases.lock().remove(robot_id);
            Ok(released)
        });
        self.respond("release_lease", robot_id, result)
    }

    // ==================== 连接与运动 ====================

    pub fn connect_safe(&self, robot_id: &str, holder_id: &str) -> ApiResult<()> {
        let result = self.with_lease(robot_id, holder_id, |service, lease| service.connect_safe(lease));
        self.respond("connect_safe", robot_id, result)
    }

    pub fn confirm_activation(&self, robot_id: &str, holder_id: &str) -> ApiResult<()> {
        let result =
            self.with_lease(robot_id, holder_id, |service, lease| service.confirm_activation(lease));
        self.respond("confirm_activation", robot_id, result)
    }

    pub fn disconnect(&self, robot_id: &str, holder_id: &str) -> ApiResult<()> {
        let result = self.with_lease(robot_id, holder_id, |service, lease| service.disconnect(lease));
        self.respond("disconnect", robot_id, result)
    }

    /// 移动到位姿 `[x, y, z, rx, ry, rz]` 并等待完成
    pub fn move_pose(&self, robot_id: &str, holder_id: &str, pose: [f64; 6]) -> ApiResult<()> {
        let result = self.with_lease(robot_id, holder_id, |service, lease| {
            service.move_pose(lease, Pose::from_array(pose))
        });
        self.respond("move_pose", robot_id, result)
    }

    pub fn move_lin(&self, robot_id: &str, holder_id: &str, pose: [f64; 6]) -> ApiResult<()> {
        let result = self.with_lease(robot_id, holder_id, |service, lease| {
            service.move_lin(lease, Pose::from_array(pose))
        });
        self.respond("move_lin", robot_id, result)
    }

    pub fn move_joints(&self, robot_id: &str, holder_id: &str, joints: [f64; 6]) -> ApiResult<()> {
        let result = self.with_lease(robot_id, holder_id, |service, lease| {
            service.move_joints(lease, JointSet(joints))
        });
        self.respond("move_joints", robot_id, result)
    }

    pub fn set_velocity(&self, robot_id: &str, holder_id: &str, percent: f64) -> ApiResult<()> {
        let result =
            self.with_lease(robot_id, holder_id, |service, lease| service.set_velocity(lease, percent));
        self.respond("set_velocity", robot_id, result)
    }

    pub fn pause_motion(&self, robot_id: &str, holder_id: &str) -> ApiResult<()> {
        let result = self.with_lease(robot_id, holder_id, |service, lease| service.pause(lease));
        self.respond("pause_motion", robot_id, result)
    }

    pub fn resume_motion(&self, robot_id: &str, holder_id: &str) -> ApiResult<()> {
        let result = self.with_lease(robot_id, holder_id, |service, lease| service.resume(lease));
        self.respond("resume_motion", robot_id, result)
    }

    pub fn clear_motion(&self, robot_id: &str, holder_id: &str) -> ApiResult<()> {
        let result = self.with_lease(robot_id, holder_id, |service, lease| service.clear_motion(lease));
        self.respond("clear_motion", robot_id, result)
    }

    pub fn reset_error(&self, robot_id: &str, holder_id: &str) -> ApiResult<()> {
        let result = self.with_lease(robot_id, holder_id, |service, lease| service.reset_error(lease));
        self.respond("reset_error", robot_id, result)
    }

    // ==================== 恢复 ====================

    pub fn set_recovery_mode(&self, robot_id: &str, holder_id: &str, enabled: bool) -> ApiResult<()> {
        let result = self.with_lease(robot_id, holder_id, |service, lease| {
            service.set_recovery_mode(lease, enabled)
        });
        self.respond("set_recovery_mode", robot_id, result)
    }

    /// 复位错误并恢复运动与默认速度（批次进行中拒绝）
    pub fn quick_recovery(&self, robot_id: &str, holder_id: &str) -> ApiResult<()> {
        let result = self.check_no_batch(robot_id, "quick recovery").and_then(|()| {
            self.with_lease(robot_id, holder_id, |service, lease| service.quick_recovery(lease))
                .map_err(SequenceError::from)
        });
        self.respond_sequence("quick_recovery", robot_id, result)
    }

    /// 安全回零，`speed` 缺省为恢复模式上限 20%（批次进行中拒绝）
    pub fn safe_home(&self, robot_id: &str, holder_id: &str, speed: Option<f64>) -> ApiResult<()> {
        let speed = speed.unwrap_or(RECOVERY_SPEED_LIMIT);
        let result = self.check_no_batch(robot_id, "safe homing").and_then(|()| {
            self.with_lease(robot_id, holder_id, |service, lease| service.safe_home(lease, speed))
                .map_err(SequenceError::from)
        });
        self.respond_sequence("safe_home", robot_id, result)
    }

    // ==================== 急停 ====================

    /// 急停（不检查租约，任何调用方都可以触发）
    pub fn emergency_stop(&self, robot_id: &str) -> ApiResult<()> {
        let result = self.service(robot_id).and_then(|service| service.emergency_stop());
        self.respond("emergency_stop", robot_id, result)
    }

    /// 急停所有机械臂，返回无法送达控制器的 ID
    pub fn emergency_stop_all(&self) -> ApiResult<Vec<String>> {
        let unreachable = self.registry.emergency_stop_all();
        if !unreachable.is_empty() {
            warn!(?unreachable, "Emergency stop did not reach every controller");
        }
        ApiResult::ok(unreachable)
    }

    /// 解除急停（操作员显式动作）
    pub fn clear_emergency_stop(&self, robot_id: &str, holder_id: &str) -> ApiResult<()> {
        let result = self.with_lease(robot_id, holder_id, |service, lease| {
            service.clear_emergency_stop(lease)
        });
        self.respond("clear_emergency_stop", robot_id, result)
    }

    // ==================== 状态 ====================

    pub fn get_status(&self, robot_id: &str) -> ApiResult<StatusSnapshot> {
        self.service(robot_id).map(|service| service.snapshot()).into()
    }

    pub fn list_status(&self) -> ApiResult<Vec<StatusSnapshot>> {
        let snapshots = self
            .registry
            .ids()
            .iter()
            .filter_map(|id| self.registry.get(id).ok())
            .map(|service| service.snapshot())
            .collect();
        ApiResult::ok(snapshots)
    }

    /// 订阅状态流（`robot_id` 为 `None` 时订阅全部）
    pub fn subscribe(&self, robot_id: Option<&str>) -> Subscription {
        match robot_id {
            Some(robot_id) => self.broadcaster.subscribe_to(robot_id),
            None => self.broadcaster.subscribe(),
        }
    }

    pub fn unsubscribe(&self, subscription_id: u64) -> bool {
        self.broadcaster.unsubscribe(subscription_id)
    }

    // ==================== 序列 ====================

    /// 开始批次（`start` 从 0 开始），返回序列 ID
    pub fn start_sequence(
        &self,
        robot_id: &str,
        holder_id: &str,
        kind: SequenceKind,
        start: usize,
        count: usize,
    ) -> ApiResult<String> {
        let result = self
            .engine_for_start(robot_id, holder_id)
            .and_then(|engine| engine.start_sequence(kind, start, count));
        self.respond_sequence("start_sequence", robot_id, result)
    }

    pub fn pause_sequence(&self, robot_id: &str, holder_id: &str) -> ApiResult<()> {
        let result = self
            .engine(robot_id, holder_id)
            .and_then(|engine| engine.pause_sequence());
        self.respond_sequence("pause_sequence", robot_id, result)
    }

    /// 恢复暂停、失败或进程重启后残留的批次
    pub fn resume_sequence(&self, robot_id: &str, holder_id: &str) -> ApiResult<()> {
        let result = self
            .engine_for_start(robot_id, holder_id)
            .and_then(|engine| engine.resume_sequence());
        self.respond_sequence("resume_sequence", robot_id, result)
    }

    pub fn retry_failed_items(&self, robot_id: &str, holder_id: &str) -> ApiResult<String> {
        let result = self
            .engine(robot_id, holder_id)
            .and_then(|engine| engine.retry_failed_items());
        self.respond_sequence("retry_failed_items", robot_id, result)
    }

    pub fn skip_to_next_batch(&self, robot_id: &str, holder_id: &str) -> ApiResult<String> {
        let result = self
            .engine(robot_id, holder_id)
            .and_then(|engine| engine.skip_to_next_batch());
        self.respond_sequence("skip_to_next_batch", robot_id, result)
    }

    pub fn abandon_sequence(&self, robot_id: &str, holder_id: &str) -> ApiResult<()> {
        let result = self
            .engine_for_start(robot_id, holder_id)
            .and_then(|engine| engine.abandon_sequence());
        self.respond_sequence("abandon_sequence", robot_id, result)
    }

    /// 操作员确认夹爪已空，解除夹持中放弃批次留下的阻断
    pub fn confirm_gripper_empty(&self, robot_id: &str, holder_id: &str) -> ApiResult<()> {
        let result = self
            .engine_for_start(robot_id, holder_id)
            .and_then(|engine| engine.confirm_gripper_empty());
        self.respond_sequence("confirm_gripper_empty", robot_id, result)
    }

    pub fn sequence_status(&self, robot_id: &str) -> ApiResult<SequenceStatus> {
        let result = self.service(robot_id).map(|_| {
            let engine = self.engines.lock().get(robot_id).cloned();
            match engine {
                Some(engine) => SequenceStatus {
                    robot_id: robot_id.to_string(),
                    phase: engine.phase(),
                    checkpoint: engine.checkpoint(),
                    last_result: engine.last_result(),
                },
                None => SequenceStatus {
                    robot_id: robot_id.to_string(),
                    phase: SequencePhase::Idle,
                    checkpoint: self.store.load(robot_id).ok().flatten(),
                    last_result: None,
                },
            }
        });
        result.into()
    }

    /// 等待批次结束（供 CLI 与测试使用）
    pub fn wait_for_batch(&self, robot_id: &str, timeout: Duration) -> Option<BatchResult> {
        let engine = self.engines.lock().get(robot_id).cloned()?;
        engine.wait_for_result(timeout)
    }

    // ==================== 内部 ====================

    fn service(&self, robot_id: &str) -> Result<Arc<RobotService>, ClientError> {
        self.registry.get(robot_id)
    }

    fn lease(&self, robot_id: &str, holder_id: &str) -> Result<Lease, ClientError> {
        match self.leases.lock().get(robot_id) {
            Some(lease) if lease.holder_id == holder_id => Ok(lease.clone()),
            _ => Err(ClientError::NotLeaseHolder {
                robot_id: robot_id.to_string(),
                holder: holder_id.to_string(),
            }),
        }
    }

    fn with_lease<T>(
        &self,
        robot_id: &str,
        holder_id: &str,
        op: impl FnOnce(&RobotService, &Lease) -> Result<T, ClientError>,
    ) -> Result<T, ClientError> {
        let service = self.service(robot_id)?;
        let lease = self.lease(robot_id, holder_id)?;
        op(&service, &lease)
    }

    /// 当前引擎（必须属于同一持有者）
    fn engine(&self, robot_id: &str, holder_id: &str) -> Result<Arc<SequenceEngine>, SequenceError> {
        self.service(robot_id)?;
        let engine = self
            .engines
            .lock()
            .get(robot_id)
            .cloned()
            .ok_or(SequenceError::InvalidPhase {
                action: "control sequence",
                actual: SequencePhase::Idle,
            })?;
        if engine.lease().holder_id != holder_id {
            return Err(ClientError::NotLeaseHolder {
                robot_id: robot_id.to_string(),
                holder: holder_id.to_string(),
            }
            .into());
        }
        Ok(engine)
    }

    /// 批次运行、暂停或失败时拒绝会移动机械臂的恢复操作
    fn check_no_batch(&self, robot_id: &str, action: &'static str) -> Result<(), SequenceError> {
        let phase = self.engines.lock().get(robot_id).map(|engine| engine.phase());
        match phase {
            Some(actual @ (SequencePhase::Running | SequencePhase::Paused | SequencePhase::Failed)) => {
                Err(SequenceError::InvalidPhase { action, actual })
            },
            _ => Ok(()),
        }
    }

    /// 可以开始新批次的引擎；持有者变化且旧引擎空闲时换新
    fn engine_for_start(
        &self,
        robot_id: &str,
        holder_id: &str,
    ) -> Result<Arc<SequenceEngine>, SequenceError> {
        let service = self.service(robot_id)?;
        let lease = self.lease(robot_id, holder_id)?;

        let mut engines = self.engines.lock();
        if let Some(engine) = engines.get(robot_id) {
            let current = engine.lease();
            if current.holder_id == holder_id && current.token == lease.token {
                return Ok(engine.clone());
            }
            let phase = engine.phase();
            if !matches!(
                phase,
                SequencePhase::Idle | SequencePhase::Completed | SequencePhase::Abandoned
            ) {
                return Err(ClientError::NotLeaseHolder {
                    robot_id: robot_id.to_string(),
                    holder: holder_id.to_string(),
                }
                .into());
            }
        }

        let mut parts = EngineParts::new(self.store.clone());
        parts.positions = self.config.positions.clone();
        parts.offsets = self.config.offsets.clone();
        parts.movement = self.config.movement.clone();
        parts.settings = EngineSettings::from_config(service.config(), &self.config.movement);
        parts.audit = self.audit.clone();
        parts.events = Some(self.broadcaster.publisher());

        let engine = Arc::new(SequenceEngine::new(service, lease, parts)?);
        info!(robot_id, holder_id, "Sequence engine ready");
        engines.insert(robot_id.to_string(), engine.clone());
        Ok(engine)
    }

    fn respond<T>(&self, op: &str, robot_id: &str, result: Result<T, ClientError>) -> ApiResult<T> {
        if let Err(e) = &result {
            warn!(robot_id, op, kind = e.kind(), "{}", e);
        }
        result.into()
    }

    fn respond_sequence<T>(
        &self,
        op: &str,
        robot_id: &str,
        result: Result<T, SequenceError>,
    ) -> ApiResult<T> {
        if let Err(e) = &result {
            warn!(robot_id, op, kind = e.kind(), "{}", e);
        }
        result.into()
    }
}

impl Drop for RobotApi {
    fn drop(&mut self) {
        // 先停引擎（放弃进行中的批次），再断开连接
        self.engines.lock().clear();
        self.broadcaster.stop();
        self.registry.shutdown();
    }
}
