//! RobotService 与 FakeMecaServer 的端到端测试

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use meca_client::{
    AtomicStateManager, BroadcastMessage, ClientError, OperationState, ResourceLockManager,
    RobotService, StatusBroadcaster,
};
use meca_driver::{FakeMecaServer, FakeServerConfig};
use meca_protocol::{Command, JointSet, Pose, codes};
use meca_tools::{BreakerSettings, BreakerThresholds, BroadcasterSettings, RobotConfig};
use serial_test::serial;

const TIMEOUT: Duration = Duration::from_secs(5);

fn service_for(server: &FakeMecaServer) -> RobotService {
    service_with(server, &BreakerSettings::default())
}

fn robot_config(server: &FakeMecaServer) -> RobotConfig {
    let driver_config = server.driver_config();
    RobotConfig {
        robot_id: "meca".to_string(),
        ip: driver_config.host.clone(),
        control_port: driver_config.control_port,
        monitor_port: driver_config.monitor_port,
        ..Default::default()
    }
}

fn service_with(server: &FakeMecaServer, breaker: &BreakerSettings) -> RobotService {
    service_from(server, robot_config(server), breaker)
}

fn service_from(server: &FakeMecaServer, config: RobotConfig, breaker: &BreakerSettings) -> RobotService {
    let driver_config = server.driver_config();
    RobotService::new(
        config,
        breaker,
        Arc::new(ResourceLockManager::new()),
        Arc::new(AtomicStateManager::new()),
    )
    .unwrap()
    .with_driver_config(driver_config)
}

fn slow_delays() -> FakeServerConfig {
    FakeServerConfig {
        delay_scale: 0.1,
        ..Default::default()
    }
}

#[test]
fn test_connect_safe_never_activates() {
    let server = FakeMecaServer::start().unwrap();
    let service = service_for(&server);
    let lease = service.acquire_lease("clientA", None).unwrap();

    service.connect_safe(&lease).unwrap();
    assert!(service.is_connected());
    assert!(!service.is_activated());
    assert_eq!(server.count_of("ActivateRobot"), 0);
    assert_eq!(server.count_of("Home"), 0);
}

#[test]
fn test_move_without_activation_is_activation_error() {
    let server = FakeMecaServer::start().unwrap();
    let service = service_for(&server);
    let lease = service.acquire_lease("clientA", None).unwrap();
    service.connect_safe(&lease).unwrap();

    let err = service.move_pose(&lease, Pose::new(100.0, 0.0, 200.0, 0.0, 90.0, 0.0)).unwrap_err();
    assert!(matches!(err, ClientError::Activation { code: None, .. }), "{err}");
    assert_eq!(server.count_of("MovePose"), 0);
    // 前置检查失败不急停
    assert_eq!(service.state(), OperationState::Idle);
}

#[test]
fn test_activation_then_move() {
    let server = FakeMecaServer::start().unwrap();
    let service = service_for(&server);
    let lease = service.acquire_lease("clientA", None).unwrap();
    service.connect_safe(&lease).unwrap();
    service.confirm_activation(&lease).unwrap();

    assert!(service.is_activated());
    assert!(server.is_activated() && server.is_homed());
    assert_eq!(server.count_of("ClearMotion"), 1);
    assert_eq!(service.speed_in_effect(), Some(meca_client::DEFAULT_SPEED));

    let target = Pose::new(135.0, -17.6177, 160.0, 123.2804, 40.9554, -101.3308);
    service.move_pose(&lease, target).unwrap();
    assert_eq!(server.pose(), target);
    assert_eq!(service.state(), OperationState::Idle);
}

#[test]
fn test_activation_rejected_by_hardware() {
    let server = FakeMecaServer::start().unwrap();
    server.set_reject_activation(true);
    let service = service_for(&server);
    let lease = service.acquire_lease("clientA", None).unwrap();
    service.connect_safe(&lease).unwrap();

    let err = service.confirm_activation(&lease).unwrap_err();
    assert!(
        matches!(err, ClientError::Activation { code: Some(codes::ACTIVATION_FAILED), .. }),
        "{err}"
    );
    assert!(!service.is_activated());
    assert_eq!(service.state(), OperationState::EmergencyStopped);
}

#[test]
fn test_other_holder_cannot_command() {
    let server = FakeMecaServer::start().unwrap();
    let service = service_for(&server);
    let lease_a = service
        .acquire_lease("clientA", Some(Duration::from_millis(300)))
        .unwrap();
    service.connect_safe(&lease_a).unwrap();

    assert!(matches!(
        service.acquire_lease("clientB", None),
        Err(ClientError::LockHeld { .. })
    ));

    // 过期后 B 获取，A 的凭据失效
    thread::sleep(Duration::from_millis(400));
    let lease_b = service.acquire_lease("clientB", None).unwrap();
    assert!(matches!(
        service.pause(&lease_a),
        Err(ClientError::NotLeaseHolder { .. })
    ));
    service.pause(&lease_b).unwrap();
    assert_eq!(service.state(), OperationState::Paused);
}

#[test]
fn test_hardware_error_in_sequence_path_is_contained() {
    let server = FakeMecaServer::start().unwrap();
    let service = service_for(&server);
    let lease = service.acquire_lease("clientA", None).unwrap();
    service.connect_safe(&lease).unwrap();
    service.confirm_activation(&lease).unwrap();

    server.reject_nth("MovePose", 1, codes::MOTION_FAILED);
    let err = service
        .execute_confirmed(&lease, Command::MovePose(Pose::default()), TIMEOUT)
        .unwrap_err();
    assert!(matches!(err, ClientError::Hardware { code: codes::MOTION_FAILED, .. }), "{err}");
    assert_eq!(service.state(), OperationState::Error);
    assert_eq!(server.count_of("PauseMotion"), 0);

    // 错误状态下不能直接下发运动
    assert!(matches!(
        service.execute_confirmed(&lease, Command::MovePose(Pose::default()), TIMEOUT),
        Err(ClientError::InvalidTransition { actual: Some(OperationState::Error), .. })
    ));

    service
        .execute_confirmed(&lease, Command::ResetError, TIMEOUT)
        .unwrap();
    assert_eq!(service.state(), OperationState::Idle);
    // 复位后控制器仍暂停
    assert!(server.is_paused());
    service.resume(&lease).unwrap();
    service
        .execute_confirmed(&lease, Command::MovePose(Pose::default()), TIMEOUT)
        .unwrap();
}

#[test]
fn test_operator_move_failure_stops_robot() {
    let server = FakeMecaServer::start().unwrap();
    let service = service_for(&server);
    let lease = service.acquire_lease("clientA", None).unwrap();
    service.connect_safe(&lease).unwrap();
    service.confirm_activation(&lease).unwrap();

    server.reject_nth("MovePose", 1, codes::MOTION_FAILED);
    let err = service.move_pose(&lease, Pose::default()).unwrap_err();
    assert!(matches!(err, ClientError::Hardware { .. }));
    assert_eq!(service.state(), OperationState::EmergencyStopped);

    // 急停粘滞：解除前一切命令被拒绝
    assert!(matches!(
        service.move_pose(&lease, Pose::default()),
        Err(ClientError::EmergencyStopped(_))
    ));
    service.clear_emergency_stop(&lease).unwrap();
    assert_eq!(service.state(), OperationState::Idle);
}

#[test]
#[serial]
fn test_emergency_stop_preempts_confirmed_move() {
    let server = FakeMecaServer::start_with(slow_delays()).unwrap();
    let service = Arc::new(service_for(&server));
    let lease = service.acquire_lease("clientA", None).unwrap();
    service.connect_safe(&lease).unwrap();
    service.confirm_activation(&lease).unwrap();

    let worker = {
        let service = service.clone();
        let lease = lease.clone();
        thread::spawn(move || service.execute_confirmed(&lease, Command::Delay(3.0), TIMEOUT))
    };

    thread::sleep(Duration::from_millis(50));
    let started = Instant::now();
    // 任何调用方都可以急停，不需要租约
    service.emergency_stop().unwrap();

    let result = worker.join().unwrap();
    assert!(matches!(result, Err(ClientError::EmergencyStopped(_))), "{result:?}");
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(service.state(), OperationState::EmergencyStopped);
    assert!(server.is_paused());
}

#[test]
#[serial]
fn test_pause_extends_confirmation_wait() {
    let server = FakeMecaServer::start_with(slow_delays()).unwrap();
    let service = Arc::new(service_for(&server));
    let lease = service.acquire_lease("clientA", None).unwrap();
    service.connect_safe(&lease).unwrap();
    service.confirm_activation(&lease).unwrap();

    let worker = {
        let service = service.clone();
        let lease = lease.clone();
        thread::spawn(move || {
            service.execute_confirmed(&lease, Command::Delay(1.0), Duration::from_millis(150))
        })
    };

    thread::sleep(Duration::from_millis(30));
    service.pause(&lease).unwrap();
    assert_eq!(service.state(), OperationState::Paused);

    // 暂停时间远超等待超时，命令不会被判定失败
    thread::sleep(Duration::from_millis(500));
    assert!(!worker.is_finished());

    service.resume(&lease).unwrap();
    worker.join().unwrap().unwrap();
    assert_eq!(service.state(), OperationState::Idle);

    // 重复恢复是幂等的
    service.resume(&lease).unwrap();
    assert_eq!(service.state(), OperationState::Idle);
}

#[test]
fn test_reconnect_requires_reactivation() {
    let server = FakeMecaServer::start().unwrap();
    let service = service_for(&server);
    let lease = service.acquire_lease("clientA", None).unwrap();
    service.connect_safe(&lease).unwrap();
    service.confirm_activation(&lease).unwrap();

    service.reconnect(&lease).unwrap();
    assert!(!service.is_activated());
    assert!(matches!(
        service.move_pose(&lease, Pose::default()),
        Err(ClientError::Activation { .. })
    ));

    service.confirm_activation(&lease).unwrap();
    service.move_pose(&lease, Pose::default()).unwrap();
}

#[test]
fn test_set_velocity_range() {
    let server = FakeMecaServer::start().unwrap();
    let service = service_for(&server);
    let lease = service.acquire_lease("clientA", None).unwrap();
    service.connect_safe(&lease).unwrap();

    assert!(matches!(
        service.set_velocity(&lease, 0.05),
        Err(ClientError::InvalidInput(_))
    ));
    assert_eq!(service.state(), OperationState::Idle);

    service.set_velocity(&lease, 20.0).unwrap();
    assert_eq!(service.speed_in_effect(), Some(20.0));
}

#[test]
fn test_connect_breaker_opens() {
    let server = FakeMecaServer::start().unwrap();
    let breaker = BreakerSettings {
        connect: BreakerThresholds {
            failure_threshold: 2,
            cooldown_ms: 60_000,
            window_ms: 60_000,
        },
        ..Default::default()
    };
    let service = service_with(&server, &breaker);
    server.shutdown();

    let lease = service.acquire_lease("clientA", None).unwrap();
    for _ in 0..2 {
        let err = service.connect_safe(&lease).unwrap_err();
        assert!(err.is_connection_failure(), "{err}");
    }
    assert!(matches!(
        service.connect_safe(&lease),
        Err(ClientError::CircuitOpen { .. })
    ));
}

#[test]
fn test_command_responses_published() {
    let server = FakeMecaServer::start().unwrap();
    let broadcaster = StatusBroadcaster::new(BroadcasterSettings::default());
    let subscription = broadcaster.subscribe();
    let service = service_for(&server).with_events(broadcaster.publisher());

    let lease = service.acquire_lease("clientA", None).unwrap();
    service.connect_safe(&lease).unwrap();
    let _ = service.move_pose(&lease, Pose::default());

    let registry = meca_client::RobotRegistry::default();
    broadcaster.tick(&registry);

    let responses: Vec<_> = subscription
        .drain()
        .into_iter()
        .filter_map(|message| match message {
            BroadcastMessage::CommandResponse(response) => Some(response),
            _ => None,
        })
        .collect();
    let commands: Vec<_> = responses.iter().map(|r| r.command.as_str()).collect();
    assert_eq!(commands, vec!["acquire_lease", "connect_safe", "move_pose"]);
    assert!(!responses[2].success);
    assert_eq!(responses[2].error.as_ref().unwrap().kind, "activation_error");
}

#[test]
fn test_pause_rejected_by_open_breaker_keeps_state() {
    let server = FakeMecaServer::start().unwrap();
    let breaker = BreakerSettings {
        command: BreakerThresholds {
            failure_threshold: 1,
            cooldown_ms: 60_000,
            window_ms: 60_000,
        },
        ..Default::default()
    };
    let service = service_with(&server, &breaker);
    let lease = service.acquire_lease("clientA", None).unwrap();
    service.connect_safe(&lease).unwrap();
    service.confirm_activation(&lease).unwrap();

    service.command_breaker().record_failure_at(Instant::now());
    let err = service.pause(&lease).unwrap_err();
    assert!(matches!(err, ClientError::CircuitOpen { .. }), "{err}");
    assert_eq!(service.state(), OperationState::Idle);
    assert_eq!(server.count_of("PauseMotion"), 0);
}

#[test]
fn test_safe_home_moves_to_safe_joints_in_recovery_mode() {
    let server = FakeMecaServer::start().unwrap();
    let safe = [0.0, -20.0, 20.0, 0.0, 30.0, 0.0];
    let config = RobotConfig {
        safe_joints: safe,
        ..robot_config(&server)
    };
    let service = service_from(&server, config, &BreakerSettings::default());
    let lease = service.acquire_lease("clientA", None).unwrap();
    service.connect_safe(&lease).unwrap();

    assert!(matches!(
        service.safe_home(&lease, 0.0),
        Err(ClientError::InvalidInput(_))
    ));
    assert_eq!(server.count_of("ActivateRobot"), 0);

    // 超过上限的速度被限制在 20%
    service.safe_home(&lease, 50.0).unwrap();
    assert_eq!(server.joints(), JointSet(safe));
    assert!(server.is_homed());
    assert!(!server.in_recovery_mode());
    assert!(!service.in_recovery_mode());
    assert!(service.is_activated());
    assert_eq!(service.state(), OperationState::Idle);
    assert_eq!(service.speed_in_effect(), Some(35.0));

    let log = server.received_commands();
    let at = |target: Command| log.iter().position(|c| *c == target).unwrap();
    let enabled = at(Command::SetRecoveryMode(true));
    let slow = at(Command::SetJointVel(20.0));
    let moved = at(Command::MoveJoints(JointSet(safe)));
    let disabled = at(Command::SetRecoveryMode(false));
    let homed = at(Command::Home);
    assert!(enabled < slow && slow < moved && moved < disabled && disabled < homed);

    service.move_pose(&lease, Pose::default()).unwrap();
}

#[test]
fn test_recovery_mode_clamps_velocity() {
    let server = FakeMecaServer::start().unwrap();
    let service = service_for(&server);
    let lease = service.acquire_lease("clientA", None).unwrap();
    service.connect_safe(&lease).unwrap();
    service.confirm_activation(&lease).unwrap();

    service.set_recovery_mode(&lease, true).unwrap();
    assert!(server.in_recovery_mode());
    service.set_velocity(&lease, 80.0).unwrap();
    assert_eq!(service.speed_in_effect(), Some(20.0));

    service.set_recovery_mode(&lease, false).unwrap();
    assert!(!server.in_recovery_mode());
    service.set_velocity(&lease, 80.0).unwrap();
    assert_eq!(service.speed_in_effect(), Some(80.0));

    service.set_recovery_mode(&lease, true).unwrap();
    service.reconnect(&lease).unwrap();
    assert!(!service.in_recovery_mode());
}

#[test]
fn test_quick_recovery_clears_error_and_resumes() {
    let server = FakeMecaServer::start().unwrap();
    let service = service_for(&server);
    let lease = service.acquire_lease("clientA", None).unwrap();
    service.connect_safe(&lease).unwrap();

    // 未激活时拒绝
    assert!(matches!(
        service.quick_recovery(&lease),
        Err(ClientError::Activation { .. })
    ));
    service.confirm_activation(&lease).unwrap();

    server.reject_nth("MovePose", 1, codes::MOTION_FAILED);
    let _ = service.execute_confirmed(&lease, Command::MovePose(Pose::default()), TIMEOUT);
    assert_eq!(service.state(), OperationState::Error);
    assert!(server.is_in_error() && server.is_paused());

    service.quick_recovery(&lease).unwrap();
    assert_eq!(service.state(), OperationState::Idle);
    assert!(!server.is_in_error());
    assert!(!server.is_paused());
    assert_eq!(service.speed_in_effect(), Some(35.0));
    assert_eq!(server.count_of("MovePose"), 1);

    service
        .execute_confirmed(&lease, Command::MovePose(Pose::default()), TIMEOUT)
        .unwrap();
}
