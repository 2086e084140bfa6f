//! 独占租约
//!
//! 一台机械臂同一时刻只能安全接受一路命令流。控制权以**租约**形式发放：
//!
//! - `acquire`：机械臂上没有有效租约时发放，否则 `LockHeld`（同一持有者重入则续期）
//! - `heartbeat`：续期；过期后调用返回 `LeaseExpired`，必须重新获取
//! - `release`：提前释放
//! - 后台清扫线程（[`LeaseSweeper`]）回收过期租约，限制崩溃持有者的影响
//!
//! 过期租约即使还没被清扫，也会在下一次 `acquire` 时被回收。
//!
//! 所有时间相关方法都有 `_at(now)` 变体，便于测试注入时钟。

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::ClientError;

/// 租约（调用方持有的凭据）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub robot_id: String,
    pub holder_id: String,
    /// 每次发放唯一，用于识别过期后被他人重新获取的情况
    pub token: u64,
    pub acquired_at: Instant,
    pub duration: Duration,
    /// 心跳截止时间
    pub expires_at: Instant,
}

impl Lease {
    pub fn is_valid_at(&self, now: Instant) -> bool {
        now < self.expires_at
    }

    pub fn remaining_at(&self, now: Instant) -> Duration {
        self.expires_at.saturating_duration_since(now)
    }
}

/// 租约管理器
#[derive(Debug, Default)]
pub struct ResourceLockManager {
    leases: Mutex<HashMap<String, Lease>>,
    next_token: AtomicU64,
}

impl ResourceLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, robot_id: &str, holder_id: &str, duration: Duration) -> Result<Lease, ClientError> {
        self.acquire_at(robot_id, holder_id, duration, Instant::now())
    }

    pub fn acquire_at(
        &self,
        robot_id: &str,
        holder_id: &str,
        duration: Duration,
        now: Instant,
    ) -> Result<Lease, ClientError> {
        if duration.is_zero() {
            return Err(ClientError::InvalidInput("lease duration must be non-zero".to_string()));
        }
        if holder_id.trim().is_empty() {
            return Err(ClientError::InvalidInput("holder id must not be empty".to_string()));
        }
        let expires_at = now
            .checked_add(duration)
            .ok_or_else(|| ClientError::InvalidInput(format!("lease duration {duration:?} is too long")))?;

        let mut leases = self.leases.lock();
        if let Some(current) = leases.get_mut(robot_id)
            && current.is_valid_at(now)
        {
            if current.holder_id != holder_id {
                return Err(ClientError::LockHeld {
                    robot_id: robot_id.to_string(),
                    holder: current.holder_id.clone(),
                    remaining: current.remaining_at(now),
                });
            }
            // 同一持有者重入：续期并沿用原凭据
            current.duration = duration;
            current.expires_at = expires_at;
            debug!(robot_id, holder_id, "Lease re-acquired");
            return Ok(current.clone());
        }

        if let Some(stale) = leases.get(robot_id) {
            info!(robot_id, "Reclaiming expired lease of {}", stale.holder_id);
        }

        let lease = Lease {
            robot_id: robot_id.to_string(),
            holder_id: holder_id.to_string(),
            token: self.next_token.fetch_add(1, Ordering::Relaxed) + 1,
            acquired_at: now,
            duration,
            expires_at,
        };
        leases.insert(robot_id.to_string(), lease.clone());
        info!(robot_id, holder_id, "Lease acquired for {:?}", duration);
        Ok(lease)
    }

    pub fn heartbeat(&self, lease: &Lease) -> Result<Lease, ClientError> {
        self.heartbeat_at(lease, Instant::now())
    }

    /// 续期；返回新的截止时间
    pub fn heartbeat_at(&self, lease: &Lease, now: Instant) -> Result<Lease, ClientError> {
        let mut leases = self.leases.lock();
        match leases.get_mut(&lease.robot_id) {
            Some(current) if current.token == lease.token => {
                if !current.is_valid_at(now) {
                    leases.remove(&lease.robot_id);
                    return Err(expired(lease));
                }
                current.expires_at = now.checked_add(current.duration).ok_or_else(|| {
                    ClientError::InvalidInput(format!("lease duration {:?} is too long", current.duration))
                })?;
                Ok(current.clone())
            },
            _ => Err(expired(lease)),
        }
    }

    /// 提前释放；租约已失效时返回 `false`
    pub fn release(&self, lease: &Lease) -> bool {
        let mut leases = self.leases.lock();
        if leases
            .get(&lease.robot_id)
            .is_some_and(|current| current.token == lease.token)
        {
            leases.remove(&lease.robot_id);
            info!(robot_id = %lease.robot_id, holder_id = %lease.holder_id, "Lease released");
            true
        } else {
            false
        }
    }

    pub fn validate(&self, lease: &Lease) -> Result<(), ClientError> {
        self.validate_at(lease, Instant::now())
    }

    /// 校验调用方仍持有有效租约
    pub fn validate_at(&self, lease: &Lease, now: Instant) -> Result<(), ClientError> {
        let leases = self.leases.lock();
        match leases.get(&lease.robot_id) {
            Some(current) if current.token == lease.token => {
                if current.is_valid_at(now) {
                    Ok(())
                } else {
                    Err(expired(lease))
                }
            },
            Some(current) if current.is_valid_at(now) => Err(ClientError::NotLeaseHolder {
                robot_id: lease.robot_id.clone(),
                holder: lease.holder_id.clone(),
            }),
            _ => Err(expired(lease)),
        }
    }

    /// 当前有效租约
    pub fn current(&self, robot_id: &str) -> Option<Lease> {
        self.current_at(robot_id, Instant::now())
    }

    pub fn current_at(&self, robot_id: &str, now: Instant) -> Option<Lease> {
        self.leases
            .lock()
            .get(robot_id)
            .filter(|lease| lease.is_valid_at(now))
            .cloned()
    }

    /// 回收过期租约，返回被回收的租约
    pub fn sweep_at(&self, now: Instant) -> Vec<Lease> {
        let mut leases = self.leases.lock();
        let expired: Vec<String> = leases
            .iter()
            .filter(|(_, lease)| !lease.is_valid_at(now))
            .map(|(robot_id, _)| robot_id.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|robot_id| leases.remove(&robot_id))
            .inspect(|lease| {
                warn!(
                    robot_id = %lease.robot_id,
                    holder_id = %lease.holder_id,
                    "Lease expired without heartbeat, revoked"
                )
            })
            .collect()
    }
}

fn expired(lease: &Lease) -> ClientError {
    ClientError::LeaseExpired {
        robot_id: lease.robot_id.clone(),
        holder: lease.holder_id.clone(),
    }
}

/// 过期租约清扫线程
pub struct LeaseSweeper {
    handle: Option<thread::JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl LeaseSweeper {
    pub fn start(locks: Arc<ResourceLockManager>, interval: Duration) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_clone = shutdown.clone();

        let handle = thread::Builder::new()
            .name("meca-lease-sweeper".into())
            .spawn(move || Self::sweep_loop(locks, interval, shutdown_clone))
            .map_err(|e| warn!("Failed to spawn lease sweeper: {}", e))
            .ok();

        LeaseSweeper { handle, shutdown }
    }

    fn sweep_loop(locks: Arc<ResourceLockManager>, interval: Duration, shutdown: Arc<AtomicBool>) {
        // 分段睡眠，保证关闭及时
        let step = interval.min(Duration::from_millis(50));
        let mut next_sweep = Instant::now() + interval;

        while !shutdown.load(Ordering::Relaxed) {
            let now = Instant::now();
            if now >= next_sweep {
                locks.sweep_at(now);
                next_sweep = now + interval;
            }
            thread::sleep(step);
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some() && !self.shutdown.load(Ordering::Relaxed)
    }

    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for LeaseSweeper {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};
    use rand::rngs::StdRng;

    const SECOND: Duration = Duration::from_secs(1);

    #[test]
    fn test_acquire_and_lock_held() {
        let locks = ResourceLockManager::new();
        let t0 = Instant::now();

        let lease = locks.acquire_at("meca", "clientA", 5 * SECOND, t0).unwrap();
        assert_eq!(lease.holder_id, "clientA");

        let err = locks
            .acquire_at("meca", "clientB", 5 * SECOND, t0 + SECOND)
            .unwrap_err();
        match err {
            ClientError::LockHeld { holder, remaining, .. } => {
                assert_eq!(holder, "clientA");
                assert_eq!(remaining, 4 * SECOND);
            },
            other => panic!("unexpected {other}"),
        }
    }

    #[test]
    fn test_unbounded_duration_rejected() {
        let locks = ResourceLockManager::new();

        let err = locks.acquire("meca", "clientA", Duration::MAX).unwrap_err();
        assert!(matches!(err, ClientError::InvalidInput(_)));
        assert!(locks.current("meca").is_none());

        // 拒绝后仍可正常获取
        locks.acquire("meca", "clientA", 5 * SECOND).unwrap();
    }

    #[test]
    fn test_expired_lease_reclaimable() {
        let locks = ResourceLockManager::new();
        let t0 = Instant::now();

        let lease_a = locks.acquire_at("meca", "clientA", 5 * SECOND, t0).unwrap();
        // t=6s 时 clientA 未心跳，clientB 获取成功
        let lease_b = locks.acquire_at("meca", "clientB", 5 * SECOND, t0 + 6 * SECOND).unwrap();
        assert_eq!(lease_b.holder_id, "clientB");
        assert_ne!(lease_a.token, lease_b.token);

        // clientA 的旧凭据失效
        assert!(matches!(
            locks.heartbeat_at(&lease_a, t0 + 6 * SECOND),
            Err(ClientError::LeaseExpired { .. })
        ));
        assert!(matches!(
            locks.validate_at(&lease_a, t0 + 6 * SECOND),
            Err(ClientError::NotLeaseHolder { .. })
        ));
        assert!(!locks.release(&lease_a));
        assert_eq!(locks.current_at("meca", t0 + 6 * SECOND).unwrap().holder_id, "clientB");
    }

    #[test]
    fn test_heartbeat_extends() {
        let locks = ResourceLockManager::new();
        let t0 = Instant::now();

        let lease = locks.acquire_at("meca", "clientA", 5 * SECOND, t0).unwrap();
        let renewed = locks.heartbeat_at(&lease, t0 + 4 * SECOND).unwrap();
        assert_eq!(renewed.expires_at, t0 + 9 * SECOND);
        assert_eq!(renewed.token, lease.token);

        // 旧凭据（同 token）仍可用
        locks.validate_at(&lease, t0 + 8 * SECOND).unwrap();
        assert!(locks.acquire_at("meca", "clientB", SECOND, t0 + 8 * SECOND).is_err());
    }

    #[test]
    fn test_heartbeat_after_expiry_fails() {
        let locks = ResourceLockManager::new();
        let t0 = Instant::now();

        let lease = locks.acquire_at("meca", "clientA", 5 * SECOND, t0).unwrap();
        assert!(matches!(
            locks.heartbeat_at(&lease, t0 + 5 * SECOND),
            Err(ClientError::LeaseExpired { .. })
        ));
        assert!(locks.current_at("meca", t0).is_none());
    }

    #[test]
    fn test_reentrant_acquire_keeps_token() {
        let locks = ResourceLockManager::new();
        let t0 = Instant::now();

        let first = locks.acquire_at("meca", "clientA", 5 * SECOND, t0).unwrap();
        let second = locks.acquire_at("meca", "clientA", 10 * SECOND, t0 + SECOND).unwrap();
        assert_eq!(first.token, second.token);
        assert_eq!(second.expires_at, t0 + 11 * SECOND);
    }

    #[test]
    fn test_release() {
        let locks = ResourceLockManager::new();
        let t0 = Instant::now();

        let lease = locks.acquire_at("meca", "clientA", 5 * SECOND, t0).unwrap();
        assert!(locks.release(&lease));
        assert!(!locks.release(&lease));
        locks.acquire_at("meca", "clientB", 5 * SECOND, t0).unwrap();
    }

    #[test]
    fn test_sweep_revokes_expired() {
        let locks = ResourceLockManager::new();
        let t0 = Instant::now();

        locks.acquire_at("a", "clientA", 2 * SECOND, t0).unwrap();
        locks.acquire_at("b", "clientB", 10 * SECOND, t0).unwrap();

        let revoked = locks.sweep_at(t0 + 3 * SECOND);
        assert_eq!(revoked.len(), 1);
        assert_eq!(revoked[0].robot_id, "a");
        assert!(locks.current_at("b", t0 + 3 * SECOND).is_some());
    }

    #[test]
    fn test_invalid_arguments() {
        let locks = ResourceLockManager::new();
        assert!(matches!(
            locks.acquire("meca", "clientA", Duration::ZERO),
            Err(ClientError::InvalidInput(_))
        ));
        assert!(matches!(
            locks.acquire("meca", " ", SECOND),
            Err(ClientError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_at_most_one_valid_lease_under_random_interleavings() {
        let holders = ["clientA", "clientB", "clientC"];

        for seed in 0..20u64 {
            let mut rng = StdRng::seed_from_u64(seed);
            let locks = ResourceLockManager::new();
            let t0 = Instant::now();
            let mut now = t0;
            let mut held: Vec<Option<Lease>> = vec![None; holders.len()];

            for _ in 0..500 {
                now += Duration::from_millis(rng.gen_range(0..400));
                let who = rng.gen_range(0..holders.len());

                match rng.gen_range(0..4) {
                    0 => {
                        let duration = Duration::from_millis(rng.gen_range(100..2_000));
                        if let Ok(lease) = locks.acquire_at("meca", holders[who], duration, now) {
                            held[who] = Some(lease);
                        }
                    },
                    1 => {
                        if let Some(lease) = &held[who]
                            && let Ok(renewed) = locks.heartbeat_at(lease, now)
                        {
                            held[who] = Some(renewed);
                        }
                    },
                    2 => {
                        if let Some(lease) = held[who].take() {
                            locks.release(&lease);
                        }
                    },
                    _ => {
                        locks.sweep_at(now);
                    },
                }

                let valid = held
                    .iter()
                    .flatten()
                    .filter(|lease| locks.validate_at(lease, now).is_ok())
                    .count();
                assert!(valid <= 1, "seed {seed}: {valid} valid leases at once");
            }
        }
    }

    #[test]
    fn test_sweeper_thread() {
        let locks = Arc::new(ResourceLockManager::new());
        locks
            .acquire("meca", "clientA", Duration::from_millis(30))
            .unwrap();

        let sweeper = LeaseSweeper::start(locks.clone(), Duration::from_millis(20));
        assert!(sweeper.is_running());

        let deadline = Instant::now() + Duration::from_secs(2);
        while locks.leases.lock().contains_key("meca") && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(!locks.leases.lock().contains_key("meca"));

        let started = Instant::now();
        sweeper.shutdown();
        assert!(started.elapsed() < Duration::from_millis(500));
    }
}
