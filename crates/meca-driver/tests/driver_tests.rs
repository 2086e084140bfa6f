//! ProtocolDriver 与 FakeMecaServer 的端到端测试

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use meca_driver::{DriverError, FakeMecaServer, FakeServerConfig, ParameterSet, ProtocolDriver};
use meca_protocol::{Command, Pose, codes};
use serial_test::serial;

const CONFIRM_TIMEOUT: Duration = Duration::from_secs(5);

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

fn activated_driver(server: &FakeMecaServer) -> ProtocolDriver {
    let driver = ProtocolDriver::connect(server.driver_config()).unwrap();
    driver.activate().unwrap();
    driver.home().unwrap();
    driver
}

#[test]
fn test_connect_does_not_activate() {
    let server = FakeMecaServer::start().unwrap();
    let driver = ProtocolDriver::connect(server.driver_config()).unwrap();

    assert!(driver.is_connected());
    assert_eq!(driver.session_generation(), 1);
    assert!(!server.is_activated());
    assert_eq!(server.count_of("ActivateRobot"), 0);

    let flags = driver.get_status().unwrap();
    assert!(!flags.activated);
    assert!(flags.simulation);
}

#[test]
fn test_activate_home_and_confirmed_move() {
    let server = FakeMecaServer::start().unwrap();
    let driver = activated_driver(&server);
    assert!(wait_until(Duration::from_secs(1), || {
        let flags = driver.status().flags;
        flags.activated && flags.homed
    }));

    let target = Pose::new(135.0, -17.6177, 160.0, 123.2804, 40.9554, -101.3308);
    driver
        .execute_confirmed(Command::MovePose(target), CONFIRM_TIMEOUT)
        .unwrap();
    assert_eq!(server.pose(), target);

    // 监控连接把新位姿推送到快照
    assert!(wait_until(Duration::from_secs(2), || {
        driver.status().pose == target
    }));
    assert!(driver.is_monitor_healthy());
}

#[test]
fn test_second_client_refused() {
    let server = FakeMecaServer::start().unwrap();
    let _first = ProtocolDriver::connect(server.driver_config()).unwrap();

    match ProtocolDriver::connect(server.driver_config()) {
        Err(DriverError::ConnectionRefused(message)) => {
            assert!(message.contains("already connected"), "{message}");
        },
        Err(other) => panic!("Expected ConnectionRefused, got {other}"),
        Ok(_) => panic!("Second control client must be refused"),
    }
}

#[test]
fn test_invalid_parameters_never_reach_controller() {
    let server = FakeMecaServer::start().unwrap();
    let driver = ProtocolDriver::connect(server.driver_config()).unwrap();

    assert!(matches!(driver.set_velocity(150.0), Err(DriverError::InvalidInput(_))));
    assert!(matches!(driver.set_velocity(0.0), Err(DriverError::InvalidInput(_))));
    assert_eq!(server.count_of("SetJointVel"), 0);

    driver.set_velocity(0.1).unwrap();
    driver.set_velocity(100.0).unwrap();
    assert!(wait_until(Duration::from_secs(1), || server.count_of("SetJointVel") == 2));
}

#[test]
fn test_initialize_parameters() {
    let server = FakeMecaServer::start().unwrap();
    let driver = activated_driver(&server);

    driver.initialize_parameters(&ParameterSet::default()).unwrap();
    let ticket = driver.set_checkpoint().unwrap();
    driver.wait_checkpoint(ticket, CONFIRM_TIMEOUT).unwrap();

    let names: Vec<_> = server
        .received_commands()
        .iter()
        .map(|c| c.name())
        .collect();
    for expected in [
        "SetGripperForce",
        "SetJointAcc",
        "SetTorqueLimits",
        "SetTorqueLimitsCfg",
        "SetBlending",
        "SetConf",
    ] {
        assert!(names.contains(&expected), "{expected} missing from {names:?}");
    }
}

#[test]
fn test_motion_before_activation_is_rejected() {
    let server = FakeMecaServer::start().unwrap();
    let driver = ProtocolDriver::connect(server.driver_config()).unwrap();

    let err = driver
        .execute_confirmed(Command::MovePose(Pose::default()), CONFIRM_TIMEOUT)
        .unwrap_err();
    assert_eq!(err.controller_code(), Some(codes::NOT_ACTIVATED), "{err}");
}

#[test]
fn test_activation_rejected() {
    let server = FakeMecaServer::start().unwrap();
    server.set_reject_activation(true);
    let driver = ProtocolDriver::connect(server.driver_config()).unwrap();

    let err = driver.activate().unwrap_err();
    assert_eq!(err.controller_code(), Some(codes::ACTIVATION_FAILED));
    assert!(!err.is_connection_failure());
    assert!(driver.is_connected());
}

#[test]
fn test_queued_motion_failure_reported() {
    let server = FakeMecaServer::start().unwrap();
    let driver = activated_driver(&server);
    server.reject_nth("MovePose", 2, codes::MOTION_FAILED);

    driver
        .execute_confirmed(Command::MovePose(Pose::default()), CONFIRM_TIMEOUT)
        .unwrap();
    let err = driver
        .execute_confirmed(
            Command::MovePose(Pose::new(10.0, 0.0, 0.0, 0.0, 0.0, 0.0)),
            CONFIRM_TIMEOUT,
        )
        .unwrap_err();
    assert_eq!(err.controller_code(), Some(codes::MOTION_FAILED), "{err}");
    assert!(server.is_in_error());

    driver.reset_error().unwrap();
    driver.resume_motion().unwrap();
    driver
        .execute_confirmed(Command::MovePose(Pose::default()), CONFIRM_TIMEOUT)
        .unwrap();
}

#[test]
fn test_connection_lost_mid_command_requires_reactivation() {
    let server = FakeMecaServer::start().unwrap();
    let driver = activated_driver(&server);
    let generation = driver.session_generation();
    server.drop_control_on("GetPose", 1);

    let err = driver.get_pose().unwrap_err();
    assert!(matches!(err, DriverError::ConnectionLost { .. }), "{err}");
    assert!(err.outcome_unknown());

    // 驱动已自动重建控制连接，但控制器失去了使能状态
    assert!(driver.is_connected());
    assert_eq!(driver.session_generation(), generation + 1);
    assert!(!server.is_activated());

    // 查询在新会话上正常工作
    let flags = driver.get_status().unwrap();
    assert!(!flags.activated);
}

#[test]
#[serial]
fn test_emergency_stop_preempts_pending_confirmation() {
    let server = FakeMecaServer::start_with(FakeServerConfig {
        delay_scale: 0.01,
        ..Default::default()
    })
    .unwrap();
    let driver = Arc::new(activated_driver(&server));

    let waiter = {
        let driver = driver.clone();
        // Delay(100) 在模拟器中约 1 秒
        thread::spawn(move || driver.execute_confirmed(Command::Delay(100.0), CONFIRM_TIMEOUT))
    };

    thread::sleep(Duration::from_millis(100));
    let started = Instant::now();
    driver.emergency_stop().unwrap();

    let result = waiter.join().unwrap();
    assert!(
        matches!(result, Err(DriverError::CheckpointDiscarded(_))),
        "{result:?}"
    );
    assert!(started.elapsed() < Duration::from_millis(900));
    assert!(wait_until(Duration::from_secs(1), || server.is_paused()));
    assert_eq!(server.queue_len(), 0);

    // 迟到的 [2042]/[2044] 不会被当成下一条命令的应答
    let flags = driver.get_status().unwrap();
    assert!(flags.paused);
}

#[test]
#[serial]
fn test_monitor_silence_reconnects_monitor_only() {
    let server = FakeMecaServer::start().unwrap();
    let driver = activated_driver(&server);
    let generation = driver.session_generation();
    assert!(wait_until(Duration::from_secs(1), || driver.is_monitor_healthy()));

    server.set_monitor_silent(true);
    assert!(wait_until(Duration::from_secs(3), || {
        driver.context().monitor_reconnects() > 0
    }));

    server.set_monitor_silent(false);
    assert!(wait_until(Duration::from_secs(3), || driver.is_monitor_healthy()));

    // 控制会话没有被触碰
    assert_eq!(driver.session_generation(), generation);
    assert!(server.is_activated());
    assert!(driver.get_status().unwrap().activated);
}

#[test]
fn test_explicit_reconnect_and_disconnect() {
    let server = FakeMecaServer::start().unwrap();
    let driver = activated_driver(&server);

    driver.reconnect().unwrap();
    assert_eq!(driver.session_generation(), 2);
    assert!(wait_until(Duration::from_secs(1), || !server.is_activated()));

    driver.disconnect();
    assert!(!driver.is_connected());
    assert!(matches!(driver.get_status(), Err(DriverError::NotConnected)));
    assert!(matches!(driver.emergency_stop(), Err(DriverError::NotConnected)));
    assert!(wait_until(Duration::from_secs(1), || !server.has_control_client()));
}
