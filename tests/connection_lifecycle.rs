// Connection manager and supervisor behaviour across plug and unplug.

use std::sync::Arc;
use std::time::Duration;

use padawan_force_lib::device::{
    ConnectionManager, ConnectionStatus, HealthOutcome, ManagerOptions, Supervisor, TickAction, Timings,
};
use padawan_force_lib::serial::sim::{SimBackend, SimulatedDevice};
use padawan_force_lib::serial::{DisplayMode, ProtocolTimeouts, SerialDeviceInfo, PADAWAN_PID, PADAWAN_VID};

fn options() -> ManagerOptions {
    ManagerOptions {
        timings: Timings {
            stabilize: Duration::from_millis(1),
            reconnect_settle: Duration::from_millis(1),
            health_recheck: Duration::from_millis(5),
            tick: Duration::from_millis(10),
            health_every: 3,
            time_sync: Duration::from_millis(50),
        },
        protocol: ProtocolTimeouts {
            poll_interval: Duration::from_millis(1),
            ping: Duration::from_millis(100),
            command: Duration::from_millis(100),
            version: Duration::from_millis(100),
            battery: Duration::from_millis(100),
            ..ProtocolTimeouts::default()
        },
        ..ManagerOptions::default()
    }
}

fn padawan(port: &str) -> SerialDeviceInfo {
    SerialDeviceInfo::usb(port, PADAWAN_VID, PADAWAN_PID)
}

fn setup(options: ManagerOptions) -> (SimBackend, SimulatedDevice, Arc<ConnectionManager>) {
    let backend = SimBackend::new();
    let device = SimulatedDevice::new();
    backend.attach(padawan("COM3"), device.clone());
    let manager = Arc::new(ConnectionManager::new(Arc::new(backend.clone()), options));
    (backend, device, manager)
}

#[tokio::test]
async fn test_unplug_is_detected_and_replug_reconnects() {
    let (backend, device, manager) = setup(options());
    let mut events = manager.subscribe_events();

    manager.try_connect().await.unwrap();
    assert_eq!(manager.health_check().await, HealthOutcome::Healthy);

    backend.detach("COM3");
    assert_eq!(manager.health_check().await, HealthOutcome::Disconnected);
    let state = manager.state();
    assert_eq!(state.status, ConnectionStatus::Disconnected);
    assert!(state.active_port.is_none());
    assert!(state.last_error.is_some());

    backend.attach(padawan("COM4"), device);
    assert_eq!(manager.try_connect().await.unwrap(), "COM4");

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event.current.status);
    }
    assert_eq!(
        seen,
        vec![
            ConnectionStatus::Probing,
            ConnectionStatus::Connected,
            ConnectionStatus::Degraded,
            ConnectionStatus::Disconnected,
            ConnectionStatus::Probing,
            ConnectionStatus::Connected,
        ]
    );
}

#[tokio::test]
async fn test_no_device_leaves_disconnected_with_reason() {
    let backend = SimBackend::new();
    backend.attach_port(SerialDeviceInfo::bare("COM1"));
    let manager = ConnectionManager::new(Arc::new(backend), options());

    assert!(manager.try_connect().await.is_err());
    let state = manager.state();
    assert_eq!(state.status, ConnectionStatus::Disconnected);
    assert!(state.last_error.is_some());
}

#[tokio::test]
async fn test_supervisor_reconnects_refreshes_and_syncs_clock() {
    let (_backend, device, manager) = setup(ManagerOptions {
        display_mode: DisplayMode::Time,
        ..options()
    });
    let supervisor = Supervisor::new(Arc::clone(&manager));

    assert_eq!(supervisor.tick().await, TickAction::Reconnected);
    assert!(device.clock().is_some(), "clock is synced right after connecting in time mode");

    assert_eq!(supervisor.tick().await, TickAction::Refreshed);
    let info = manager.device_info().await;
    assert_eq!(info.battery_percent, Some(87));
    assert!(info.last_connected.is_some());
    assert!(info.bytes_transferred > 0);

    assert_eq!(supervisor.tick().await, TickAction::Checked(HealthOutcome::Healthy));
}

#[tokio::test]
async fn test_supervisor_stands_down_during_update() {
    let (_backend, _device, manager) = setup(options());
    manager.begin_firmware_update().unwrap();
    let handle = Supervisor::new(Arc::clone(&manager)).start();

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(manager.state().status, ConnectionStatus::UpdatingFirmware);

    manager.end_firmware_update();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(manager.is_connected());

    handle.stop().await;
}
