//! 机械臂注册表
//!
//! 显式持有每台机械臂的 [`RobotService`]，按 ID 查找后传给序列引擎和 API 层。
//! 所有服务共享同一个租约管理器和状态管理器。

use std::collections::HashMap;
use std::sync::Arc;

use meca_tools::SystemConfig;
use parking_lot::RwLock;
use tracing::info;

use crate::broadcaster::{EventPublisher, StatusSource};
use crate::events::StatusSnapshot;
use crate::{AtomicStateManager, ClientError, ResourceLockManager, RobotService};

/// 机械臂注册表
pub struct RobotRegistry {
    services: RwLock<HashMap<String, Arc<RobotService>>>,
    locks: Arc<ResourceLockManager>,
    states: Arc<AtomicStateManager>,
}

impl Default for RobotRegistry {
    fn default() -> Self {
        Self::new(
            Arc::new(ResourceLockManager::new()),
            Arc::new(AtomicStateManager::new()),
        )
    }
}

impl RobotRegistry {
    pub fn new(locks: Arc<ResourceLockManager>, states: Arc<AtomicStateManager>) -> Self {
        Self {
            services: RwLock::new(HashMap::new()),
            locks,
            states,
        }
    }

    /// 为配置中的每台机械臂创建服务（不连接）
    pub fn from_config(config: &SystemConfig, events: Option<EventPublisher>) -> Result<Self, ClientError> {
        config.validate()?;
        let registry = Self::default();
        for robot in &config.robots {
            let mut service = RobotService::new(
                robot.clone(),
                &config.breaker,
                registry.locks.clone(),
                registry.states.clone(),
            )?
            .with_default_speed(config.movement.speed);
            if let Some(events) = &events {
                service = service.with_events(events.clone());
            }
            registry.register(service)?;
        }
        Ok(registry)
    }

    pub fn locks(&self) -> &Arc<ResourceLockManager> {
        &self.locks
    }

    pub fn states(&self) -> &Arc<AtomicStateManager> {
        &self.states
    }

    /// 注册服务；ID 已存在时返回 `InvalidInput`
    pub fn register(&self, service: RobotService) -> Result<Arc<RobotService>, ClientError> {
        let mut services = self.services.write();
        let robot_id = service.robot_id().to_string();
        if services.contains_key(&robot_id) {
            return Err(ClientError::InvalidInput(format!(
                "robot {robot_id} already registered"
            )));
        }
        self.states.register(&robot_id);
        let service = Arc::new(service);
        services.insert(robot_id.clone(), service.clone());
        info!(robot_id = %robot_id, "Robot registered");
        Ok(service)
    }

    pub fn get(&self, robot_id: &str) -> Result<Arc<RobotService>, ClientError> {
        self.services
            .read()
            .get(robot_id)
            .cloned()
            .ok_or_else(|| ClientError::UnknownRobot(robot_id.to_string()))
    }

    /// 移除并断开
    pub fn remove(&self, robot_id: &str) -> Option<Arc<RobotService>> {
        let removed = self.services.write().remove(robot_id);
        if let Some(service) = &removed {
            service.shutdown();
        }
        removed
    }

    /// 所有机械臂 ID（排序）
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.services.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.services.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.read().is_empty()
    }

    /// 急停所有机械臂，返回无法送达控制器的 ID
    pub fn emergency_stop_all(&self) -> Vec<String> {
        let services: Vec<_> = self.services.read().values().cloned().collect();
        services
            .into_iter()
            .filter(|service| service.emergency_stop().is_err())
            .map(|service| service.robot_id().to_string())
            .collect()
    }

    /// 断开所有连接
    pub fn shutdown(&self) {
        let services: Vec<_> = self.services.read().values().cloned().collect();
        for service in services {
            service.shutdown();
        }
    }
}

impl StatusSource for RobotRegistry {
    fn status_snapshots(&self) -> Vec<StatusSnapshot> {
        let services: Vec<_> = {
            let map = self.services.read();
            let mut services: Vec<_> = map.values().cloned().collect();
            services.sort_by(|a, b| a.robot_id().cmp(b.robot_id()));
            services
        };
        services.iter().map(|service| service.snapshot()).collect()
    }
}
