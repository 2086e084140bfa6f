//! 检查点跟踪
//!
//! 运动队列中的命令成功时没有应答。确认物理完成的方法是在其后追加
//! `SetCheckpoint(n)`，等控制器执行到该位置时推送 `[3030][n]`。
//!
//! 控制连接的接收线程把 3030/3031/1xxx 帧投递到这里，等待方在条件变量上阻塞。
//! 任何一个等待都会因以下事件提前结束：
//!
//! - `[3031][n]`：检查点被丢弃（队列被清空，如急停）
//! - 1xxx 错误帧：运动失败
//! - 控制连接断开：结果未知

use std::collections::HashSet;
use std::time::{Duration, Instant};

use meca_protocol::Response;
use meca_protocol::command::CHECKPOINT_RANGE;
use parking_lot::{Condvar, Mutex};

use crate::DriverError;

/// 一次检查点等待的凭据
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointTicket {
    pub id: u32,
    faults: u64,
    generation: u64,
}

#[derive(Debug)]
struct TrackerState {
    next_id: u32,
    reached: HashSet<u32>,
    discarded: HashSet<u32>,
    faults: u64,
    last_fault: Option<Response>,
    generation: u64,
}

/// 检查点跟踪器
#[derive(Debug)]
pub struct CheckpointTracker {
    state: Mutex<TrackerState>,
    changed: Condvar,
}

impl Default for CheckpointTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl CheckpointTracker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TrackerState {
                next_id: *CHECKPOINT_RANGE.start(),
                reached: HashSet::new(),
                discarded: HashSet::new(),
                faults: 0,
                last_fault: None,
                generation: 0,
            }),
            changed: Condvar::new(),
        }
    }

    /// 分配下一个检查点编号（在 `CHECKPOINT_RANGE` 内循环）
    pub fn issue(&self) -> CheckpointTicket {
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id = if id >= *CHECKPOINT_RANGE.end() {
            *CHECKPOINT_RANGE.start()
        } else {
            id + 1
        };
        state.reached.remove(&id);
        state.discarded.remove(&id);

        CheckpointTicket {
            id,
            faults: state.faults,
            generation: state.generation,
        }
    }

    pub fn on_reached(&self, id: u32) {
        self.state.lock().reached.insert(id);
        self.changed.notify_all();
    }

    pub fn on_discarded(&self, id: u32) {
        self.state.lock().discarded.insert(id);
        self.changed.notify_all();
    }

    /// 控制器报告错误（1xxx）
    pub fn on_fault(&self, response: Response) {
        let mut state = self.state.lock();
        state.faults += 1;
        state.last_fault = Some(response);
        drop(state);
        self.changed.notify_all();
    }

    /// 控制连接断开（所有未完成的等待结果未知）
    pub fn on_disconnect(&self) {
        let mut state = self.state.lock();
        state.generation += 1;
        state.reached.clear();
        state.discarded.clear();
        drop(state);
        self.changed.notify_all();
    }

    /// 阻塞等待检查点到达
    pub fn wait(&self, ticket: CheckpointTicket, timeout: Duration) -> Result<(), DriverError> {
        let command = format!("SetCheckpoint({})", ticket.id);
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();

        loop {
            if state.generation != ticket.generation {
                return Err(DriverError::connection_lost(
                    &command,
                    "control connection closed while waiting for checkpoint",
                ));
            }
            if state.reached.remove(&ticket.id) {
                return Ok(());
            }
            // 运动失败时控制器先报错再丢弃后续检查点，错误优先
            if state.faults != ticket.faults {
                return Err(match &state.last_fault {
                    Some(fault) => DriverError::rejected(&command, fault.code, &fault.message),
                    None => DriverError::rejected(&command, 0, "controller fault"),
                });
            }
            if state.discarded.remove(&ticket.id) {
                return Err(DriverError::CheckpointDiscarded(ticket.id));
            }

            if self.changed.wait_until(&mut state, deadline).timed_out() {
                return Err(DriverError::Timeout { command, timeout });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meca_protocol::codes;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_issue_wraps_around_range() {
        let tracker = CheckpointTracker::new();
        assert_eq!(tracker.issue().id, 1);
        assert_eq!(tracker.issue().id, 2);

        tracker.state.lock().next_id = *CHECKPOINT_RANGE.end();
        assert_eq!(tracker.issue().id, 8000);
        assert_eq!(tracker.issue().id, 1);
    }

    #[test]
    fn test_wait_reached_from_other_thread() {
        let tracker = Arc::new(CheckpointTracker::new());
        let ticket = tracker.issue();

        let notifier = tracker.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            notifier.on_reached(ticket.id);
        });

        tracker.wait(ticket, Duration::from_secs(2)).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn test_reached_before_wait_is_not_lost() {
        let tracker = CheckpointTracker::new();
        let ticket = tracker.issue();
        tracker.on_reached(ticket.id);
        tracker.wait(ticket, Duration::from_millis(10)).unwrap();
    }

    #[test]
    fn test_discarded() {
        let tracker = CheckpointTracker::new();
        let ticket = tracker.issue();
        tracker.on_discarded(ticket.id);
        assert!(matches!(
            tracker.wait(ticket, Duration::from_millis(10)),
            Err(DriverError::CheckpointDiscarded(1))
        ));
    }

    #[test]
    fn test_fault_fails_wait() {
        let tracker = CheckpointTracker::new();
        let ticket = tracker.issue();
        tracker.on_fault(Response::new(codes::MOTION_FAILED, "Motion failed."));

        let err = tracker.wait(ticket, Duration::from_millis(10)).unwrap_err();
        assert_eq!(err.controller_code(), Some(codes::MOTION_FAILED));
    }

    #[test]
    fn test_fault_before_issue_is_ignored() {
        let tracker = CheckpointTracker::new();
        tracker.on_fault(Response::new(codes::MOTION_FAILED, "old"));
        let ticket = tracker.issue();
        tracker.on_reached(ticket.id);
        tracker.wait(ticket, Duration::from_millis(10)).unwrap();
    }

    #[test]
    fn test_disconnect_makes_outcome_unknown() {
        let tracker = CheckpointTracker::new();
        let ticket = tracker.issue();
        tracker.on_disconnect();

        let err = tracker.wait(ticket, Duration::from_millis(10)).unwrap_err();
        assert!(err.outcome_unknown(), "{err}");
    }

    #[test]
    fn test_fault_wins_over_discard() {
        let tracker = CheckpointTracker::new();
        let ticket = tracker.issue();
        tracker.on_fault(Response::new(codes::MOTION_FAILED, "Motion failed."));
        tracker.on_discarded(ticket.id);

        let err = tracker.wait(ticket, Duration::from_millis(10)).unwrap_err();
        assert_eq!(err.controller_code(), Some(codes::MOTION_FAILED));
    }

    #[test]
    fn test_timeout() {
        let tracker = CheckpointTracker::new();
        let ticket = tracker.issue();
        let err = tracker.wait(ticket, Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, DriverError::Timeout { .. }));
    }
}
