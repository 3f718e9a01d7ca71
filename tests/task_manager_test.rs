//! End-to-end tests for the task engine over simulated instruments.

use rf_bench::adapters::MockTransport;
use rf_bench::device_set::DeviceSet;
use rf_bench::devices::{
    Device, Generator, KeysightGen, KeysightM9807A, MeasurementConfig, MeasurementType, NetworkAnalyzer, Positioner,
    SweepTarget, TesartRbd,
};
use rf_bench::error::{BenchError, TaskError};
use rf_bench::link::{InstrumentLink, LinkConfig};
use rf_bench::range::SweepRange;
use rf_bench::registry::{DeviceId, DeviceRegistry};
use rf_bench::tasks::{StepDirection, TaskKind, TaskManager, TaskState};
use std::time::Duration;
use tracing_test::traced_test;

fn link(name: &str, mock: &MockTransport) -> InstrumentLink {
    let config = LinkConfig {
        opc_poll_interval: Duration::from_millis(2),
        opc_timeout: Duration::from_millis(60),
        ..LinkConfig::default()
    };
    InstrumentLink::new(name, Box::new(mock.clone()), config)
}

fn positioner(registry: &DeviceRegistry, name: &str, mock: &MockTransport) -> DeviceId {
    let driver = TesartRbd::new().with_init_delay(Duration::ZERO);
    registry.insert(Device::Positioner(Positioner::new(
        name,
        vec![link(name, mock)],
        Box::new(driver),
    )))
}

fn two_axis_positioner(registry: &DeviceRegistry, name: &str, axis0: &MockTransport, axis1: &MockTransport) -> DeviceId {
    let driver = TesartRbd::new().with_init_delay(Duration::ZERO);
    registry.insert(Device::Positioner(Positioner::new(
        name,
        vec![link(name, axis0), link(name, axis1)],
        Box::new(driver),
    )))
}

fn generator(registry: &DeviceRegistry, name: &str, mock: &MockTransport) -> DeviceId {
    registry.insert(Device::Generator(Generator::new(
        name,
        link(name, mock),
        Box::new(KeysightGen),
    )))
}

fn analyzer(registry: &DeviceRegistry, name: &str, mock: &MockTransport) -> DeviceId {
    registry.insert(Device::Analyzer(NetworkAnalyzer::new(
        name,
        link(name, mock),
        Box::new(KeysightM9807A),
    )))
}

fn register(manager: &TaskManager, registry: &DeviceRegistry, name: &str, members: Vec<DeviceId>) {
    manager
        .register_set(DeviceSet::new(name, members, registry.clone()).unwrap())
        .unwrap();
}

fn orders(mock: &MockTransport) -> Vec<String> {
    mock.commands()
        .into_iter()
        .filter(|c| c.starts_with("ORDER"))
        .collect()
}

#[tokio::test]
#[traced_test]
async fn test_angle_range_on_two_positioners() {
    let registry = DeviceRegistry::new();
    let mock_a = MockTransport::new("rbd_a");
    let mock_b = MockTransport::new("rbd_b");
    let a = positioner(&registry, "rbd_a", &mock_a);
    let b = positioner(&registry, "rbd_b", &mock_b);
    let manager = TaskManager::new(1000);
    register(&manager, &registry, "chamber", vec![a, b]);

    let id = manager
        .set_angle_range_task("chamber", 0, SweepRange::new(0.0, 10.0, 5.0))
        .unwrap();
    let snapshot = manager.wait(id).await.unwrap();

    assert_eq!(snapshot.state, TaskState::Completed);
    assert_eq!(snapshot.kind, TaskKind::Range);
    assert_eq!(snapshot.total_steps, 3);
    assert_eq!(snapshot.completed_steps, 3);
    assert_eq!(snapshot.last_value, Some(10.0));
    assert!(snapshot.failure.is_none());

    let expected = vec![
        "ORDER 0 0 50 8192 3 3 0 -1 0 0".to_string(),
        "ORDER 0 5000 50 8192 3 3 0 -1 0 0".to_string(),
        "ORDER 0 10000 50 8192 3 3 0 -1 0 0".to_string(),
    ];
    assert_eq!(orders(&mock_a), expected);
    assert_eq!(orders(&mock_b), expected);
    assert!(logs_contain("task submitted"));
    assert!(logs_contain("task completed"));
}

#[tokio::test]
async fn test_fan_out_follows_member_order() {
    // One simulator behind both devices gives a single shared command log.
    let registry = DeviceRegistry::new();
    let shared = MockTransport::new("bus");
    let a = generator(&registry, "gen_a", &shared);
    let b = generator(&registry, "gen_b", &shared);
    let manager = TaskManager::new(100);
    register(&manager, &registry, "sources", vec![b, a]);

    let id = manager
        .set_power_range_task("sources", SweepRange::new(-10.0, -5.0, 5.0))
        .unwrap();
    assert_eq!(manager.wait(id).await.unwrap().state, TaskState::Completed);
    assert_eq!(
        shared.setting_commands(),
        vec![
            ":SOURCE:POWER -10".to_string(),
            ":SOURCE:POWER -10".to_string(),
            ":SOURCE:POWER -5".to_string(),
            ":SOURCE:POWER -5".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_device_error_fails_task_without_rollback() {
    let registry = DeviceRegistry::new();
    let mock_a = MockTransport::new("gen_a");
    let mock_b = MockTransport::new("gen_b").fail_on(":FREQ", "-222,\"Data out of range\"");
    let mock_c = MockTransport::new("gen_c");
    let members = vec![
        generator(&registry, "gen_a", &mock_a),
        generator(&registry, "gen_b", &mock_b),
        generator(&registry, "gen_c", &mock_c),
    ];
    let manager = TaskManager::new(100);
    register(&manager, &registry, "sources", members);

    let id = manager.set_freq_task("sources", 2.4e9).unwrap();
    let snapshot = manager.wait(id).await.unwrap();

    assert_eq!(snapshot.state, TaskState::Failed);
    assert_eq!(snapshot.completed_steps, 0);
    let failure = snapshot.failure.unwrap();
    assert_eq!(failure.step, 0);
    assert_eq!(failure.value, Some(2.4e9));
    assert_eq!(failure.kind, "protocol");
    assert!(failure.message.contains("Data out of range"));
    assert_eq!(failure.members.len(), 1);
    assert_eq!(failure.members[0].device, "gen_b");

    // The members around the failure still took the setting.
    assert_eq!(mock_a.setting_commands(), vec![":FREQ 2400000000".to_string()]);
    assert_eq!(mock_c.setting_commands(), vec![":FREQ 2400000000".to_string()]);
}

#[tokio::test]
async fn test_failing_step_halts_remaining_steps() {
    let registry = DeviceRegistry::new();
    let mock = MockTransport::new("gen_a").fail_on(":FREQ 2000000000", "-222,\"Data out of range\"");
    let id = generator(&registry, "gen_a", &mock);
    let manager = TaskManager::new(100);
    register(&manager, &registry, "sources", vec![id]);

    let task = manager
        .set_freq_range_task("sources", SweepRange::new(1.0e9, 3.0e9, 1.0e9))
        .unwrap();
    let snapshot = manager.wait(task).await.unwrap();

    assert_eq!(snapshot.state, TaskState::Failed);
    assert_eq!(snapshot.completed_steps, 1);
    assert_eq!(snapshot.last_value, Some(1.0e9));
    assert_eq!(snapshot.failure.unwrap().step, 1);
    assert_eq!(
        mock.setting_commands(),
        vec![":FREQ 1000000000".to_string(), ":FREQ 2000000000".to_string()]
    );
}

#[tokio::test]
async fn test_wrong_direction_rejected_before_any_io() {
    let registry = DeviceRegistry::new();
    let mock = MockTransport::new("gen_a");
    let id = generator(&registry, "gen_a", &mock);
    let manager = TaskManager::new(100);
    register(&manager, &registry, "sources", vec![id]);

    let err = manager
        .set_power_range_task("sources", SweepRange::new(0.0, -5.0, 1.0))
        .unwrap_err();
    assert!(matches!(err, BenchError::Range(_)));
    assert_eq!(err.kind(), "configuration");
    assert!(manager.tasks().is_empty());
    assert!(mock.commands().is_empty());
}

#[tokio::test]
async fn test_opc_timeout_fails_task() {
    let registry = DeviceRegistry::new();
    let mock = MockTransport::new("gen_a").never_complete();
    let id = generator(&registry, "gen_a", &mock);
    let manager = TaskManager::new(100);
    register(&manager, &registry, "sources", vec![id]);

    let task = manager.set_freq_task("sources", 1.0e9).unwrap();
    let snapshot = manager.wait(task).await.unwrap();

    assert_eq!(snapshot.state, TaskState::Failed);
    let failure = snapshot.failure.unwrap();
    assert_eq!(failure.kind, "protocol");
    assert!(failure.message.contains("did not complete"));
    // No error query after an exhausted OPC wait.
    assert!(!mock.commands().iter().any(|c| c == "SYSTEM:ERROR?"));
}

#[tokio::test]
async fn test_stop_ends_range_task_and_halts_positioner() {
    let registry = DeviceRegistry::new();
    let mock = MockTransport::new("rbd").with_latency(5);
    let id = positioner(&registry, "rbd", &mock);
    let manager = TaskManager::new(1000);
    register(&manager, &registry, "chamber", vec![id]);

    let task = manager
        .set_angle_range_task("chamber", 0, SweepRange::new(0.0, 90.0, 1.0))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;

    let state = manager.stop(task).unwrap();
    assert!(!state.is_terminal());
    let snapshot = manager.wait(task).await.unwrap();

    assert_eq!(snapshot.state, TaskState::Stopped);
    assert!(snapshot.completed_steps < 91);
    assert!(snapshot.finished_at.is_some());
    assert_eq!(mock.commands().last().map(String::as_str), Some("STOP"));
    assert_eq!(orders(&mock).len(), snapshot.completed_steps);

    assert_eq!(
        manager.stop(task).unwrap_err(),
        BenchError::Task(TaskError::AlreadyFinished {
            id: task,
            state: TaskState::Stopped
        })
    );
}

#[tokio::test]
async fn test_busy_device_rejected() {
    let registry = DeviceRegistry::new();
    let slow = MockTransport::new("gen_a").with_latency(5);
    let other = MockTransport::new("gen_b");
    let a = generator(&registry, "gen_a", &slow);
    let b = generator(&registry, "gen_b", &other);
    let manager = TaskManager::new(1000);
    register(&manager, &registry, "first", vec![a]);
    register(&manager, &registry, "both", vec![b, a]);
    register(&manager, &registry, "second", vec![b]);

    let running = manager
        .set_freq_range_task("first", SweepRange::new(1.0e9, 2.0e9, 1.0e7))
        .unwrap();

    let err = manager.set_freq_task("both", 1.0e9).unwrap_err();
    assert_eq!(
        err,
        BenchError::Task(TaskError::DeviceBusy {
            device: "gen_a".into(),
            task: running
        })
    );
    assert_eq!(err.kind(), "busy");

    // Disjoint devices run concurrently.
    let parallel = manager.set_freq_task("second", 1.0e9).unwrap();
    assert_eq!(manager.wait(parallel).await.unwrap().state, TaskState::Completed);

    manager.stop(running).unwrap();
    assert_eq!(manager.wait(running).await.unwrap().state, TaskState::Stopped);

    // Once the first task is finished its device is free again.
    let next = manager.set_freq_task("both", 1.0e9).unwrap();
    assert_eq!(manager.wait(next).await.unwrap().state, TaskState::Completed);
}

#[tokio::test]
async fn test_path_task_skips_members_without_switches() {
    let registry = DeviceRegistry::new();
    let vna_mock = MockTransport::new("vna");
    let gen_mock = MockTransport::new("gen");
    let vna = analyzer(&registry, "vna", &vna_mock);
    let gen = generator(&registry, "gen", &gen_mock);
    let manager = TaskManager::new(100);
    register(&manager, &registry, "rig", vec![gen, vna]);

    let task = manager
        .set_path_task("rig", vec![Some(2), None, Some(3)])
        .unwrap();
    assert_eq!(manager.wait(task).await.unwrap().state, TaskState::Completed);
    assert_eq!(
        vna_mock.setting_commands(),
        vec![
            "SENS:SWIT:M9157:MOD1:SWIT:PATH STAT2".to_string(),
            "SENS:SWIT:M9157:MOD3:SWIT:PATH STAT3".to_string(),
            "INIT".to_string(),
        ]
    );
    assert!(gen_mock.commands().is_empty());
}

#[tokio::test]
async fn test_stop_all_waits_for_every_task() {
    let registry = DeviceRegistry::new();
    let mock_a = MockTransport::new("rbd_a").with_latency(5);
    let mock_b = MockTransport::new("rbd_b").with_latency(5);
    let a = positioner(&registry, "rbd_a", &mock_a);
    let b = positioner(&registry, "rbd_b", &mock_b);
    let manager = TaskManager::new(1000);
    register(&manager, &registry, "left", vec![a]);
    register(&manager, &registry, "right", vec![b]);

    manager
        .set_angle_range_task("left", 0, SweepRange::new(0.0, 180.0, 1.0))
        .unwrap();
    manager
        .set_angle_range_task("right", 0, SweepRange::new(0.0, 180.0, 1.0))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let stopped = manager.stop_all().await;
    assert_eq!(stopped.len(), 2);
    assert!(stopped.iter().all(|s| s.state == TaskState::Stopped));
    assert_eq!(manager.purge_finished(), 2);
    assert!(manager.tasks().is_empty());
}

#[tokio::test]
#[traced_test]
async fn test_stop_during_last_step_ends_stopped() {
    let registry = DeviceRegistry::new();
    let mock = MockTransport::new("rbd").with_settle_polls(8);
    let id = positioner(&registry, "rbd", &mock);
    let manager = TaskManager::new(100);
    register(&manager, &registry, "chamber", vec![id]);

    let task = manager.set_angle_task("chamber", 0, 45.0).unwrap();
    for _ in 0..200 {
        if !orders(&mock).is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    assert_eq!(orders(&mock).len(), 1);

    // The only step is still settling when the stop lands.
    assert_eq!(manager.stop(task).unwrap(), TaskState::Running);
    let snapshot = manager.wait(task).await.unwrap();

    assert_eq!(snapshot.state, TaskState::Stopped);
    assert_eq!(snapshot.completed_steps, 1);
    assert_eq!(snapshot.last_value, Some(45.0));
    assert_eq!(mock.commands().last().map(String::as_str), Some("STOP"));
    assert!(logs_contain("task stopped"));
    assert!(!logs_contain("task completed"));
}

#[tokio::test]
async fn test_axis_missing_on_one_member_rejected_at_submit() {
    let registry = DeviceRegistry::new();
    let axis0 = MockTransport::new("rbd_a0");
    let axis1 = MockTransport::new("rbd_a1");
    let single = MockTransport::new("rbd_b");
    let a = two_axis_positioner(&registry, "rbd_a", &axis0, &axis1);
    let b = positioner(&registry, "rbd_b", &single);
    let manager = TaskManager::new(100);
    register(&manager, &registry, "chamber", vec![a, b]);

    let err = manager
        .set_angle_range_task("chamber", 1, SweepRange::new(0.0, 10.0, 5.0))
        .unwrap_err();
    assert_eq!(err.kind(), "configuration");
    assert!(err.to_string().contains("axis 1 out of range (rbd_b has 1)"));
    assert!(manager.tasks().is_empty());
    assert!(axis0.commands().is_empty());
    assert!(axis1.commands().is_empty());
    assert!(single.commands().is_empty());

    // Axis 0 exists everywhere.
    let id = manager.set_angle_task("chamber", 0, 5.0).unwrap();
    assert_eq!(manager.wait(id).await.unwrap().state, TaskState::Completed);
    assert!(axis1.commands().is_empty());
}

#[tokio::test]
async fn test_configure_task_sets_up_analyzers() {
    let registry = DeviceRegistry::new();
    let vna_mock = MockTransport::new("vna");
    let gen_mock = MockTransport::new("gen");
    let vna = analyzer(&registry, "vna", &vna_mock);
    let gen = generator(&registry, "gen", &gen_mock);
    let manager = TaskManager::new(100);
    register(&manager, &registry, "rig", vec![gen, vna]);

    let mut measurement = MeasurementConfig {
        kind: MeasurementType::Transmission,
        rbw: 10.0e3,
        source_port: 9,
        external_generator: true,
    };
    let err = manager.configure_task("rig", measurement.clone()).unwrap_err();
    assert_eq!(err.kind(), "configuration");
    assert!(vna_mock.commands().is_empty());

    measurement.source_port = 3;
    let task = manager.configure_task("rig", measurement).unwrap();
    assert_eq!(manager.wait(task).await.unwrap().state, TaskState::Completed);
    assert_eq!(
        vna_mock.setting_commands().last().map(String::as_str),
        Some(":SENSe:BANDwidth:RESolution 10000")
    );
    assert!(gen_mock.commands().is_empty());
}

#[tokio::test]
async fn test_angle_cursor_steps_through_last_sweep() {
    let registry = DeviceRegistry::new();
    let mock = MockTransport::new("rbd");
    let id = positioner(&registry, "rbd", &mock);
    let manager = TaskManager::new(100);
    register(&manager, &registry, "chamber", vec![id]);
    let sweep = SweepTarget::Angle { axis: 0 };

    let range = manager
        .set_angle_range_task("chamber", 0, SweepRange::new(0.0, 20.0, 10.0))
        .unwrap();
    manager.wait(range).await.unwrap();

    for (direction, expected) in [
        (StepDirection::Start, 0.0),
        (StepDirection::Next, 10.0),
        (StepDirection::Next, 20.0),
        (StepDirection::Prev, 10.0),
    ] {
        let task = manager.step_task("chamber", sweep, direction).unwrap();
        let snapshot = manager.wait(task).await.unwrap();
        assert_eq!(snapshot.state, TaskState::Completed);
        assert_eq!(snapshot.last_value, Some(expected));
    }
    assert_eq!(manager.cursor("chamber", sweep).unwrap().index(), 1);
    assert_eq!(
        orders(&mock).last().map(String::as_str),
        Some("ORDER 0 10000 50 8192 3 3 0 -1 0 0")
    );

    // Another axis has no sweep of its own.
    let err = manager
        .step_task("chamber", SweepTarget::Angle { axis: 1 }, StepDirection::Next)
        .unwrap_err();
    assert_eq!(err.kind(), "configuration");
}
