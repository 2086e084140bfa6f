//! RobotApi 端到端场景（FakeMecaServer）

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use meca_control::{CheckpointStore, SequenceCheckpoint};
use meca_driver::{FakeMecaServer, FakeServerConfig};
use meca_sdk::prelude::*;
use meca_tools::{BreakerSettings, BreakerThresholds};
use serial_test::serial;

const ROBOT: &str = "meca";
const TIMEOUT: Duration = Duration::from_secs(20);

fn api_for(server: &FakeMecaServer, breaker: BreakerSettings) -> RobotApi {
    let driver_config = server.driver_config();
    let robot = RobotConfig {
        robot_id: ROBOT.to_string(),
        ip: driver_config.host.clone(),
        control_port: driver_config.control_port,
        monitor_port: driver_config.monitor_port,
        ..Default::default()
    };
    let mut config = SystemConfig {
        robots: vec![robot.clone()],
        breaker,
        ..Default::default()
    };
    // 测试读取完整的事件序列
    config.broadcaster.buffer = 4096;

    let broadcaster = StatusBroadcaster::new(config.broadcaster.clone());
    let registry = RobotRegistry::default();
    let service = RobotService::new(
        robot,
        &config.breaker,
        registry.locks().clone(),
        registry.states().clone(),
    )
    .unwrap()
    .with_driver_config(driver_config)
    .with_events(broadcaster.publisher());
    registry.register(service).unwrap();

    RobotApi::new(config, Arc::new(registry), broadcaster)
}

fn activated(api: &RobotApi, holder: &str) {
    api.acquire_lease(ROBOT, holder, None).into_result().unwrap();
    api.connect_safe(ROBOT, holder).into_result().unwrap();
    api.confirm_activation(ROBOT, holder).into_result().unwrap();
}

#[test]
fn test_expired_lease_is_reclaimed() {
    let server = FakeMecaServer::start().unwrap();
    let api = api_for(&server, BreakerSettings::default());

    let lease = api
        .acquire_lease(ROBOT, "clientA", Some(Duration::from_millis(300)))
        .into_result()
        .unwrap();
    assert_eq!(lease.holder_id, "clientA");
    assert_eq!(
        api.acquire_lease(ROBOT, "clientB", None).error_kind(),
        Some("lock_held")
    );

    // A 停止心跳，超过租约时长后 B 可以接管
    thread::sleep(Duration::from_millis(450));
    let taken = api.acquire_lease(ROBOT, "clientB", None).into_result().unwrap();
    assert_eq!(taken.holder_id, "clientB");
    assert_ne!(taken.token, lease.token);

    assert_eq!(api.connect_safe(ROBOT, "clientA").error_kind(), Some("permission_denied"));
    assert!(api.heartbeat(ROBOT, "clientB").success);
    assert_eq!(
        api.get_status(ROBOT).into_result().unwrap().lease_holder.as_deref(),
        Some("clientB")
    );
}

#[test]
fn test_move_before_activation_is_rejected() {
    let server = FakeMecaServer::start().unwrap();
    let api = api_for(&server, BreakerSettings::default());

    api.acquire_lease(ROBOT, "operator", None).into_result().unwrap();
    api.connect_safe(ROBOT, "operator").into_result().unwrap();

    let result = api.move_pose(ROBOT, "operator", [135.0, -17.6, 160.0, 123.3, 40.9, -101.3]);
    assert!(!result.success);
    assert_eq!(result.error_kind(), Some("activation_error"));
    assert_eq!(server.count_of("ActivateRobot"), 0);
    assert_eq!(server.count_of("MovePose"), 0);
    assert_eq!(
        api.get_status(ROBOT).into_result().unwrap().state,
        OperationState::Idle
    );
}

#[test]
#[serial]
fn test_emergency_stop_from_any_caller_preempts_move() {
    let server = FakeMecaServer::start_with(FakeServerConfig {
        motion_duration: Duration::from_secs(3),
        ..Default::default()
    })
    .unwrap();
    let api = Arc::new(api_for(&server, BreakerSettings::default()));
    activated(&api, "operator");

    let mover = {
        let api = api.clone();
        thread::spawn(move || api.move_pose(ROBOT, "operator", [100.0, 0.0, 200.0, 0.0, 90.0, 0.0]))
    };
    thread::sleep(Duration::from_millis(200));

    let started = Instant::now();
    // 急停不需要租约
    assert!(api.emergency_stop(ROBOT).success);
    let moved = mover.join().unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(moved.error_kind(), Some("emergency_stopped"));

    let status = api.get_status(ROBOT).into_result().unwrap();
    assert_eq!(status.state, OperationState::EmergencyStopped);
    assert_eq!(
        api.set_velocity(ROBOT, "operator", 20.0).error_kind(),
        Some("emergency_stopped")
    );

    api.clear_emergency_stop(ROBOT, "operator").into_result().unwrap();
    assert_eq!(
        api.get_status(ROBOT).into_result().unwrap().state,
        OperationState::Idle
    );
}

#[test]
#[serial]
fn test_connect_breaker_admits_one_trial_after_cooldown() {
    let server = FakeMecaServer::start().unwrap();
    let breaker = BreakerSettings {
        connect: BreakerThresholds {
            failure_threshold: 2,
            cooldown_ms: 200,
            window_ms: 60_000,
        },
        ..Default::default()
    };
    let api = api_for(&server, breaker);
    server.shutdown();

    api.acquire_lease(ROBOT, "operator", None).into_result().unwrap();
    for _ in 0..2 {
        let result = api.connect_safe(ROBOT, "operator");
        assert_ne!(result.error_kind(), Some("circuit_open"));
        assert!(!result.success);
    }
    assert_eq!(api.connect_safe(ROBOT, "operator").error_kind(), Some("circuit_open"));

    thread::sleep(Duration::from_millis(300));
    // 冷却后的探测真正尝试连接，失败后重新断开
    let trial = api.connect_safe(ROBOT, "operator");
    assert!(!trial.success);
    assert_ne!(trial.error_kind(), Some("circuit_open"));
    assert_eq!(api.connect_safe(ROBOT, "operator").error_kind(), Some("circuit_open"));
}

#[test]
fn test_batch_with_failed_item_and_retry() {
    let server = FakeMecaServer::start().unwrap();
    server.reject_nth("GripperOpen", 2, meca_protocol::codes::MOTION_FAILED);
    let api = api_for(&server, BreakerSettings::default());
    let subscription = api.subscribe(Some(ROBOT));
    activated(&api, "operator");

    api.start_sequence(ROBOT, "operator", SequenceKind::Drop, 0, 3)
        .into_result()
        .unwrap();
    assert_eq!(
        api.start_sequence(ROBOT, "intruder", SequenceKind::Drop, 0, 3).error_kind(),
        Some("permission_denied")
    );

    let result = api.wait_for_batch(ROBOT, TIMEOUT).unwrap();
    assert_eq!(result.status, BatchStatus::PartialSuccess);
    assert_eq!(result.failed_items, vec![2]);

    api.retry_failed_items(ROBOT, "operator").into_result().unwrap();
    let retry = api.wait_for_batch(ROBOT, TIMEOUT).unwrap();
    assert_eq!(retry.completed_items, vec![2]);

    let status = api.sequence_status(ROBOT).into_result().unwrap();
    assert_eq!(status.phase, SequencePhase::Completed);
    assert!(status.checkpoint.is_none());

    // 序列进度经状态流送出
    thread::sleep(Duration::from_millis(300));
    let phases: Vec<String> = subscription
        .drain()
        .into_iter()
        .filter_map(|message| match message {
            BroadcastMessage::OperationUpdate(update) => Some(update.phase),
            _ => None,
        })
        .collect();
    assert!(phases.iter().any(|p| p == "item_failed"));
    assert!(phases.iter().any(|p| p == "partial_success"));
    assert!(phases.iter().any(|p| p == "completed"));
}

#[test]
#[serial]
fn test_resume_after_emergency_stop_is_idempotent() {
    let server = FakeMecaServer::start_with(FakeServerConfig {
        delay_scale: 0.1,
        ..Default::default()
    })
    .unwrap();
    let api = api_for(&server, BreakerSettings::default());
    activated(&api, "operator");

    api.start_sequence(ROBOT, "operator", SequenceKind::Drop, 0, 2)
        .into_result()
        .unwrap();
    let deadline = Instant::now() + TIMEOUT;
    while server.count_of("GripperClose") == 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(1));
    }
    assert!(api.emergency_stop(ROBOT).success);

    let deadline = Instant::now() + TIMEOUT;
    while api.sequence_status(ROBOT).into_result().unwrap().phase != SequencePhase::Paused
        && Instant::now() < deadline
    {
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(
        api.resume_sequence(ROBOT, "operator").error_kind(),
        Some("emergency_stopped")
    );

    api.clear_emergency_stop(ROBOT, "operator").into_result().unwrap();
    api.resume_sequence(ROBOT, "operator").into_result().unwrap();
    api.resume_sequence(ROBOT, "operator").into_result().unwrap();

    let result = api.wait_for_batch(ROBOT, TIMEOUT).unwrap();
    assert_eq!(result.status, BatchStatus::Completed);
    assert_eq!(result.completed_items, vec![1, 2]);
    // 每片只夹取一次
    assert!(server.count_of("GripperClose") <= 3);
    assert_eq!(server.count_of("GripperOpen"), 2);
}

#[test]
fn test_stored_checkpoint_blocks_new_batch_until_resumed() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(JsonFileCheckpointStore::new(dir.path()).unwrap());
    // 上一个进程留下的批次：第 4、5 片尚未开始
    store
        .save(&SequenceCheckpoint {
            sequence_id: "drop-previous".to_string(),
            robot_id: ROBOT.to_string(),
            kind: SequenceKind::Drop,
            start: 3,
            count: 2,
            items: vec![3, 4],
            position: 0,
            next_step: 0,
            setup_done: false,
            holding: false,
            completed: Vec::new(),
            failed: Vec::new(),
            retry: false,
            abandoned: false,
            updated_ms: 0,
        })
        .unwrap();

    let server = FakeMecaServer::start().unwrap();
    let api = api_for(&server, BreakerSettings::default()).with_checkpoint_store(store.clone());
    let status = api.sequence_status(ROBOT).into_result().unwrap();
    assert_eq!(status.phase, SequencePhase::Idle);
    assert_eq!(status.checkpoint.unwrap().sequence_id, "drop-previous");

    activated(&api, "operator");
    assert_eq!(
        api.start_sequence(ROBOT, "operator", SequenceKind::Drop, 0, 1).error_kind(),
        Some("invalid_phase")
    );

    api.resume_sequence(ROBOT, "operator").into_result().unwrap();
    let result = api.wait_for_batch(ROBOT, TIMEOUT).unwrap();
    assert_eq!(result.status, BatchStatus::Completed);
    assert_eq!(result.completed_items, vec![4, 5]);
    assert!(store.load(ROBOT).unwrap().is_none());
}

#[test]
fn test_safe_home_brings_unhomed_robot_into_service() {
    let server = FakeMecaServer::start().unwrap();
    let api = api_for(&server, BreakerSettings::default());
    api.acquire_lease(ROBOT, "operator", None).into_result().unwrap();
    api.connect_safe(ROBOT, "operator").into_result().unwrap();

    api.safe_home(ROBOT, "operator", Some(60.0)).into_result().unwrap();
    assert!(server.is_homed());
    assert!(!server.in_recovery_mode());
    assert_eq!(server.count_of("SetRecoveryMode"), 2);
    assert!(server
        .received_commands()
        .contains(&meca_protocol::Command::SetJointVel(20.0)));

    api.start_sequence(ROBOT, "operator", SequenceKind::Drop, 0, 1)
        .into_result()
        .unwrap();
    // 批次进行中不允许恢复操作
    assert_eq!(
        api.safe_home(ROBOT, "operator", None).error_kind(),
        Some("invalid_phase")
    );
    assert_eq!(
        api.quick_recovery(ROBOT, "operator").error_kind(),
        Some("invalid_phase")
    );

    let result = api.wait_for_batch(ROBOT, TIMEOUT).unwrap();
    assert_eq!(result.status, BatchStatus::Completed);
    api.quick_recovery(ROBOT, "operator").into_result().unwrap();
}

#[test]
fn test_abandoned_hold_requires_gripper_confirmation() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(JsonFileCheckpointStore::new(dir.path()).unwrap());
    store
        .save(&SequenceCheckpoint {
            sequence_id: "drop-held".to_string(),
            robot_id: ROBOT.to_string(),
            kind: SequenceKind::Drop,
            start: 0,
            count: 1,
            items: vec![0],
            position: 0,
            next_step: 9,
            setup_done: true,
            holding: true,
            completed: Vec::new(),
            failed: Vec::new(),
            retry: false,
            abandoned: true,
            updated_ms: 0,
        })
        .unwrap();

    let server = FakeMecaServer::start().unwrap();
    let api = api_for(&server, BreakerSettings::default()).with_checkpoint_store(store.clone());
    activated(&api, "operator");

    assert_eq!(
        api.start_sequence(ROBOT, "operator", SequenceKind::Drop, 0, 1).error_kind(),
        Some("unsafe_resume")
    );
    assert_eq!(
        api.resume_sequence(ROBOT, "operator").error_kind(),
        Some("unsafe_resume")
    );

    api.confirm_gripper_empty(ROBOT, "operator").into_result().unwrap();
    assert!(store.load(ROBOT).unwrap().is_none());
    api.start_sequence(ROBOT, "operator", SequenceKind::Drop, 0, 1)
        .into_result()
        .unwrap();
    let result = api.wait_for_batch(ROBOT, TIMEOUT).unwrap();
    assert_eq!(result.status, BatchStatus::Completed);
}
