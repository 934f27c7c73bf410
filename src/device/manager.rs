use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{broadcast, watch, Mutex, RwLock};

use crate::serial::{DeviceProtocolClient, DisplayMode, PortScanner, SerialBackend, SerialError};
use super::{
    ConnectionState, ConnectionStatus, DeviceError, DeviceInfo, HealthOutcome, ManagerOptions, Result, StatusEvent,
};

const EVENT_CAPACITY: usize = 64;

/// Owns the single serial session to the macropad.
///
/// Discovery, handshake and health supervision all go through here. The
/// protocol client sits behind one async mutex so at most one logical operation
/// uses the channel at a time, and every status change goes through
/// [`ConnectionManager::set_state`].
pub struct ConnectionManager {
    scanner: PortScanner,
    backend: Arc<dyn SerialBackend>,
    options: ManagerOptions,
    client: Mutex<Option<DeviceProtocolClient>>,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<StatusEvent>,
    info: RwLock<DeviceInfo>,
    display: RwLock<(DisplayMode, bool)>,
    updating: AtomicBool,
}

impl ConnectionManager {
    pub fn new(backend: Arc<dyn SerialBackend>, options: ManagerOptions) -> Self {
        let (state, _) = watch::channel(ConnectionState::default());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let display = (options.display_mode, options.display_enabled);
        Self {
            scanner: PortScanner::new(Arc::clone(&backend), options.filter),
            backend,
            options,
            client: Mutex::new(None),
            state,
            events,
            info: RwLock::new(DeviceInfo::default()),
            display: RwLock::new(display),
            updating: AtomicBool::new(false),
        }
    }

    pub fn scanner(&self) -> &PortScanner {
        &self.scanner
    }

    pub fn options(&self) -> &ManagerOptions {
        &self.options
    }

    /// Current status snapshot
    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn active_port(&self) -> Option<String> {
        self.state.borrow().active_port.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state.borrow().is_connected()
    }

    /// Latest-value subscription to the connection state
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// One event per status transition
    pub fn subscribe_events(&self) -> broadcast::Receiver<StatusEvent> {
        self.events.subscribe()
    }

    /// Telemetry snapshot, with uptime measured from the last successful connect.
    pub async fn device_info(&self) -> DeviceInfo {
        let mut info = self.info.read().await.clone();
        if self.is_connected() {
            info.uptime_secs = info
                .last_connected
                .map(|at| (Utc::now() - at).num_seconds().max(0) as u64);
        }
        info
    }

    pub async fn display_settings(&self) -> (DisplayMode, bool) {
        *self.display.read().await
    }

    pub fn is_updating(&self) -> bool {
        self.updating.load(Ordering::SeqCst)
    }

    /// Single critical section for status changes. Emits an event only when the
    /// state actually changed.
    fn set_state(&self, next: ConnectionState) {
        self.transition_if(next, |_| true);
    }

    /// Apply `next` only if `allowed` holds for the current state, checked under the
    /// same lock. Returns whether the guard passed.
    fn transition_if(&self, next: ConnectionState, allowed: impl FnOnce(&ConnectionState) -> bool) -> bool {
        let mut passed = false;
        let mut previous = None;
        self.state.send_if_modified(|current| {
            if !allowed(current) {
                return false;
            }
            passed = true;
            if *current == next {
                return false;
            }
            previous = Some(std::mem::replace(current, next.clone()));
            true
        });

        if let Some(previous) = previous {
            log::info!("Connection status {:?} -> {:?}", previous.status, next.status);
            let _ = self.events.send(StatusEvent {
                previous,
                current: next,
                at: Utc::now(),
            });
        }
        passed
    }

    /// Find and handshake with the macropad, or confirm the existing session.
    pub async fn try_connect(&self) -> Result<String> {
        if self.is_updating() {
            log::debug!("Skipping connect attempt, firmware update in progress");
            return Err(DeviceError::UpdateInProgress);
        }

        let mut client_guard = self.client.lock().await;

        if let Some(client) = client_guard.as_mut() {
            if let Some(port) = client.port_name().map(str::to_string) {
                match client.ping().await {
                    Ok(()) => {
                        log::debug!("Existing connection on {} is alive", port);
                        self.set_state(ConnectionState::connected(port.clone()));
                        return Ok(port);
                    }
                    Err(e) => log::info!("Existing connection on {} did not answer: {}", port, e),
                }
            }
        }

        if let Some(mut stale) = client_guard.take() {
            stale.close();
            tokio::time::sleep(self.options.timings.reconnect_settle).await;
        }

        self.set_state(ConnectionState::probing());

        let candidates = match self.scanner.list_candidates() {
            Ok(ports) => self.order_candidates(ports),
            Err(e) => {
                log::warn!("Port discovery failed: {}", e);
                drop(client_guard);
                self.reset_session(Some(e.to_string())).await;
                return Err(DeviceError::SerialError(e));
            }
        };
        log::debug!("Probing candidates: {:?}", candidates);

        for port in candidates {
            match self.probe(&port).await {
                Ok(client) => {
                    {
                        let mut info = self.info.write().await;
                        *info = DeviceInfo {
                            last_connected: Some(Utc::now()),
                            bytes_transferred: client.bytes_transferred(),
                            ..DeviceInfo::default()
                        };
                    }
                    *client_guard = Some(client);
                    self.set_state(ConnectionState::connected(port.clone()));
                    log::info!("Connected to PadAwan Force on {}", port);
                    return Ok(port);
                }
                Err(e) => log::debug!("No handshake on {}: {}", port, e),
            }
        }

        drop(client_guard);
        self.reset_session(Some("No responding device found".to_string())).await;
        Err(DeviceError::NotFound)
    }

    fn order_candidates(&self, mut ports: Vec<String>) -> Vec<String> {
        if let Some(preferred) = &self.options.preferred_port {
            if let Some(idx) = ports.iter().position(|p| p == preferred) {
                let port = ports.remove(idx);
                ports.insert(0, port);
            }
        }
        ports
    }

    async fn probe(&self, port: &str) -> crate::serial::Result<DeviceProtocolClient> {
        let transport = self.backend.open(port, self.options.baud_rate)?;
        tokio::time::sleep(self.options.timings.stabilize).await;

        let mut client = DeviceProtocolClient::new(transport, self.options.protocol);
        // Dropping the client on failure closes the port again
        client.ping().await?;
        Ok(client)
    }

    /// Close the session. Idempotent and infallible.
    pub async fn disconnect(&self) {
        let had_client = {
            let mut client_guard = self.client.lock().await;
            match client_guard.take() {
                Some(mut client) => {
                    client.close();
                    true
                }
                None => false,
            }
        };

        if had_client {
            log::info!("Disconnected from device");
        }

        let idle = self.state().status == ConnectionStatus::Disconnected;
        if !had_client && idle && !self.is_updating() {
            return;
        }
        self.reset_session(None).await;
    }

    async fn reset_session(&self, error: Option<String>) {
        *self.info.write().await = DeviceInfo::default();
        if self.is_updating() {
            self.set_state(ConnectionState::updating_firmware());
        } else {
            self.set_state(ConnectionState::disconnected(error));
        }
    }

    async fn disconnect_with_error(&self, error: String) {
        {
            let mut client_guard = self.client.lock().await;
            if let Some(mut client) = client_guard.take() {
                client.close();
            }
        }
        self.reset_session(Some(error)).await;
    }

    /// Port presence in a fresh listing. An enumeration failure says nothing
    /// about the device, so it counts as present.
    fn port_listed(&self, port: &str) -> bool {
        match self.scanner.port_names() {
            Ok(names) => names.iter().any(|n| n == port),
            Err(e) => {
                log::debug!("Enumeration failed during health check: {}", e);
                true
            }
        }
    }

    /// Two-stage liveness check. Only a failed ping after the port went missing
    /// from two listings tears the session down.
    pub async fn health_check(&self) -> HealthOutcome {
        if self.is_updating() {
            return HealthOutcome::Skipped;
        }
        let Some(port) = self.active_port() else {
            return HealthOutcome::Skipped;
        };

        if self.port_listed(&port) {
            return HealthOutcome::Healthy;
        }

        log::debug!(
            "{} missing from port listing, re-checking in {:?}",
            port,
            self.options.timings.health_recheck
        );
        if !self.mark_degraded(&port, "Port missing from enumeration".to_string()) {
            return HealthOutcome::Skipped;
        }
        tokio::time::sleep(self.options.timings.health_recheck).await;

        if self.port_listed(&port) {
            log::debug!("{} is back in the port listing", port);
            self.restore_connected(&port);
            return HealthOutcome::Recovered;
        }

        match self.ping().await {
            Ok(()) => {
                log::info!("{} not listed but still answers ping, keeping connection", port);
                self.restore_connected(&port);
                HealthOutcome::Recovered
            }
            Err(e) => {
                log::warn!("Device on {} lost: {}", port, e);
                self.disconnect_with_error(format!("Device on {} stopped responding", port)).await;
                HealthOutcome::Disconnected
            }
        }
    }

    fn restore_connected(&self, port: &str) {
        self.transition_if(ConnectionState::connected(port.to_string()), |current| {
            current.status == ConnectionStatus::Degraded && current.active_port.as_deref() == Some(port)
        });
    }

    /// Degrade the session on `port`. A session that was closed or replaced meanwhile is left alone.
    fn mark_degraded(&self, port: &str, reason: String) -> bool {
        self.transition_if(ConnectionState::degraded(port.to_string(), reason), |current| {
            current.is_connected() && current.active_port.as_deref() == Some(port)
        })
    }

    /// Refresh version and battery telemetry.
    ///
    /// Commands the firmware refuses are ignored. A query that times out moves the
    /// connection to Degraded but never disconnects.
    pub async fn refresh_device_info(&self) -> Result<DeviceInfo> {
        let port = self.active_port().ok_or(DeviceError::NotConnected)?;
        let known_version = self.info.read().await.firmware_version.clone();

        let (version, battery, bytes) = self
            .execute_with_protocol(move |protocol| {
                Box::pin(async move {
                    let version = match known_version {
                        Some(v) => Ok(v),
                        None => protocol.firmware_version().await,
                    };
                    let battery = protocol.battery_status().await;
                    Ok::<_, DeviceError>((version, battery, protocol.bytes_transferred()))
                })
            })
            .await?;

        let mut timeout = None;
        {
            let mut info = self.info.write().await;
            if self.active_port().as_deref() != Some(port.as_str()) {
                log::debug!("Session on {} closed during telemetry refresh", port);
                return Err(DeviceError::NotConnected);
            }
            info.bytes_transferred = bytes;

            match version {
                Ok(v) => info.firmware_version = Some(v),
                Err(e) if e.is_timeout() => timeout = Some("GET_VERSION"),
                Err(e) => log::debug!("Firmware version unavailable: {}", e),
            }
            match battery {
                Ok(report) => {
                    info.battery_percent = Some(report.percent);
                    info.battery_voltage = report.voltage;
                }
                Err(e) if e.is_timeout() => timeout = Some("BATTERY_STATUS"),
                Err(e) => log::debug!("Battery status unavailable: {}", e),
            }
        }

        match timeout {
            Some(command) => {
                log::warn!("Telemetry refresh on {} timed out ({})", port, command);
                self.mark_degraded(&port, format!("{} timed out", command));
                Err(DeviceError::SerialError(SerialError::Timeout))
            }
            None => {
                self.restore_connected(&port);
                Ok(self.device_info().await)
            }
        }
    }

    /// Run `f` against the open protocol client while holding the channel.
    pub async fn execute_with_protocol<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut DeviceProtocolClient) -> Pin<Box<dyn Future<Output = Result<R>> + Send + '_>>,
        R: Send,
    {
        let mut client_guard = self.client.lock().await;

        match client_guard.as_mut() {
            Some(client) if client.is_open() => f(client).await,
            _ => Err(DeviceError::NotConnected),
        }
    }

    pub async fn ping(&self) -> Result<()> {
        self.execute_with_protocol(|protocol| Box::pin(async move { protocol.ping().await.map_err(DeviceError::SerialError) }))
            .await
    }

    pub async fn firmware_version(&self) -> Result<String> {
        let version = self
            .execute_with_protocol(|protocol| Box::pin(async move { protocol.firmware_version().await.map_err(DeviceError::SerialError) }))
            .await?;
        self.info.write().await.firmware_version = Some(version.clone());
        Ok(version)
    }

    pub async fn battery_status(&self) -> Result<crate::serial::BatteryReport> {
        let report = self
            .execute_with_protocol(|protocol| Box::pin(async move { protocol.battery_status().await.map_err(DeviceError::SerialError) }))
            .await?;
        let mut info = self.info.write().await;
        info.battery_percent = Some(report.percent);
        info.battery_voltage = report.voltage;
        Ok(report)
    }

    /// Send a layout document to the device.
    pub async fn upload_layout(&self, json: &str) -> Result<()> {
        let json = json.to_string();
        self.execute_with_protocol(move |protocol| {
            Box::pin(async move { protocol.upload_layer_config(&json).await.map_err(DeviceError::SerialError) })
        })
        .await
    }

    /// Layout the device is currently running.
    pub async fn current_layout(&self) -> Result<String> {
        self.execute_with_protocol(|protocol| Box::pin(async move { protocol.current_config().await.map_err(DeviceError::SerialError) }))
            .await
    }

    /// Layout via the single-line `DOWNLOAD_CONFIG` command of older firmware.
    pub async fn download_layout(&self) -> Result<String> {
        self.execute_with_protocol(|protocol| Box::pin(async move { protocol.download_config().await.map_err(DeviceError::SerialError) }))
            .await
    }

    /// Switch the display. Entering time mode pushes the host clock straight away.
    pub async fn set_display_mode(&self, mode: DisplayMode, enabled: bool) -> Result<()> {
        self.execute_with_protocol(move |protocol| {
            Box::pin(async move { protocol.set_display_mode(mode, enabled).await.map_err(DeviceError::SerialError) })
        })
        .await?;
        *self.display.write().await = (mode, enabled);

        if mode == DisplayMode::Time && enabled {
            if let Err(e) = self.sync_clock().await {
                log::warn!("Clock sync after switching to time mode failed: {}", e);
            }
        }
        Ok(())
    }

    pub async fn set_time(&self, time: chrono::NaiveTime) -> Result<()> {
        self.execute_with_protocol(move |protocol| Box::pin(async move { protocol.set_time(time).await.map_err(DeviceError::SerialError) }))
            .await
    }

    /// Push the host's local wall-clock time to the device.
    pub async fn sync_clock(&self) -> Result<()> {
        self.set_time(chrono::Local::now().time()).await
    }

    /// Drive the device into its ROM bootloader with the control lines.
    pub async fn enter_bootloader(&self) -> Result<()> {
        self.execute_with_protocol(|protocol| Box::pin(async move { protocol.enter_bootloader().await.map_err(DeviceError::SerialError) }))
            .await
    }

    /// Claim the update flag. Fails if another update already holds it.
    pub fn begin_firmware_update(&self) -> Result<()> {
        if self
            .updating
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(DeviceError::UpdateInProgress);
        }

        log::info!("Firmware update started, reconnection suspended");
        if !self.is_connected() {
            self.set_state(ConnectionState::updating_firmware());
        }
        Ok(())
    }

    /// Release the update flag so reconnection resumes.
    pub fn end_firmware_update(&self) {
        self.updating.store(false, Ordering::SeqCst);
        if self.state().status == ConnectionStatus::UpdatingFirmware {
            self.set_state(ConnectionState::disconnected(None));
        }
        log::info!("Firmware update finished, reconnection resumed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Timings;
    use crate::serial::sim::{SimBackend, SimulatedDevice};
    use crate::serial::{ProtocolTimeouts, SerialDeviceInfo};
    use std::time::Duration;

    fn fast_options() -> ManagerOptions {
        ManagerOptions {
            filter: None,
            timings: Timings {
                stabilize: Duration::from_millis(1),
                reconnect_settle: Duration::from_millis(1),
                health_recheck: Duration::from_millis(1),
                tick: Duration::from_millis(10),
                health_every: 1,
                time_sync: Duration::from_millis(50),
            },
            protocol: ProtocolTimeouts {
                poll_interval: Duration::from_millis(1),
                ping: Duration::from_millis(50),
                command: Duration::from_millis(50),
                version: Duration::from_millis(50),
                battery: Duration::from_millis(50),
                upload_ready: Duration::from_millis(50),
                upload_result: Duration::from_millis(100),
                config_read: Duration::from_millis(100),
                line_delay: Duration::ZERO,
            },
            ..ManagerOptions::default()
        }
    }

    fn manager_with(backend: &SimBackend) -> ConnectionManager {
        ConnectionManager::new(Arc::new(backend.clone()), fast_options())
    }

    #[tokio::test]
    async fn connect_with_no_ports_stays_disconnected() {
        let backend = SimBackend::new();
        let manager = manager_with(&backend);

        assert!(matches!(manager.try_connect().await, Err(DeviceError::NotFound)));
        let state = manager.state();
        assert_eq!(state.status, ConnectionStatus::Disconnected);
        assert!(state.active_port.is_none());
    }

    #[tokio::test]
    async fn connects_to_first_port_that_answers() {
        let backend = SimBackend::new();
        backend.attach_port(SerialDeviceInfo::bare("COM1"));
        backend.attach(SerialDeviceInfo::bare("COM5"), SimulatedDevice::new());
        let manager = manager_with(&backend);

        assert_eq!(manager.try_connect().await.unwrap(), "COM5");
        assert_eq!(manager.state(), ConnectionState::connected("COM5".into()));
        assert!(manager.device_info().await.last_connected.is_some());
    }

    #[tokio::test]
    async fn busy_port_is_skipped() {
        let backend = SimBackend::new();
        backend.attach(SerialDeviceInfo::bare("COM3"), SimulatedDevice::new());
        backend.attach(SerialDeviceInfo::bare("COM4"), SimulatedDevice::new());
        backend.set_busy("COM3", true);
        let manager = manager_with(&backend);

        assert_eq!(manager.try_connect().await.unwrap(), "COM4");
    }

    #[tokio::test]
    async fn connected_session_short_circuits_on_ping() {
        let backend = SimBackend::new();
        backend.attach(SerialDeviceInfo::bare("COM3"), SimulatedDevice::new());
        let manager = manager_with(&backend);
        manager.try_connect().await.unwrap();

        manager.try_connect().await.unwrap();
        assert_eq!(backend.open_log(), vec!["COM3".to_string()]);
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let backend = SimBackend::new();
        backend.attach(SerialDeviceInfo::bare("COM3"), SimulatedDevice::new());
        let manager = manager_with(&backend);
        let mut events = manager.subscribe_events();

        manager.disconnect().await;
        assert_eq!(manager.state(), ConnectionState::default());

        manager.try_connect().await.unwrap();
        manager.disconnect().await;
        let after_first = manager.state();
        manager.disconnect().await;
        assert_eq!(manager.state(), after_first);
        assert_eq!(after_first.status, ConnectionStatus::Disconnected);

        let mut transitions = Vec::new();
        while let Ok(event) = events.try_recv() {
            transitions.push(event.current.status);
        }
        assert_eq!(
            transitions,
            vec![
                ConnectionStatus::Probing,
                ConnectionStatus::Connected,
                ConnectionStatus::Disconnected
            ]
        );
    }

    #[tokio::test]
    async fn operations_fail_fast_when_disconnected() {
        let manager = manager_with(&SimBackend::new());
        assert!(matches!(manager.ping().await, Err(DeviceError::NotConnected)));
        assert!(matches!(manager.current_layout().await, Err(DeviceError::NotConnected)));
        assert!(matches!(manager.refresh_device_info().await, Err(DeviceError::NotConnected)));
    }

    #[tokio::test]
    async fn transient_enumeration_miss_does_not_disconnect() {
        let backend = SimBackend::new();
        backend.attach(SerialDeviceInfo::bare("COM3"), SimulatedDevice::new());
        let manager = manager_with(&backend);
        manager.try_connect().await.unwrap();

        backend.queue_listing(Vec::new());
        assert_eq!(manager.health_check().await, HealthOutcome::Recovered);
        assert_eq!(manager.state().status, ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn unlisted_but_answering_device_is_kept() {
        let backend = SimBackend::new();
        backend.attach(SerialDeviceInfo::bare("COM3"), SimulatedDevice::new());
        let manager = manager_with(&backend);
        manager.try_connect().await.unwrap();

        backend.queue_listing(Vec::new());
        backend.queue_listing(Vec::new());
        assert_eq!(manager.health_check().await, HealthOutcome::Recovered);
        assert_eq!(manager.active_port().as_deref(), Some("COM3"));
    }

    #[tokio::test]
    async fn two_misses_and_failed_ping_disconnect() {
        let backend = SimBackend::new();
        let device = SimulatedDevice::new();
        backend.attach(SerialDeviceInfo::bare("COM3"), device.clone());
        let manager = manager_with(&backend);
        manager.try_connect().await.unwrap();

        device.set_responsive(false);
        backend.queue_listing(Vec::new());
        backend.queue_listing(Vec::new());

        assert_eq!(manager.health_check().await, HealthOutcome::Disconnected);
        let state = manager.state();
        assert_eq!(state.status, ConnectionStatus::Disconnected);
        assert!(state.active_port.is_none());
        assert!(state.last_error.is_some());
        assert_eq!(manager.device_info().await, DeviceInfo::default());
    }

    #[tokio::test]
    async fn silent_telemetry_degrades_without_disconnecting() {
        let backend = SimBackend::new();
        let device = SimulatedDevice::new();
        backend.attach(SerialDeviceInfo::bare("COM3"), device.clone());
        let manager = manager_with(&backend);
        manager.try_connect().await.unwrap();

        let info = manager.refresh_device_info().await.unwrap();
        assert_eq!(info.firmware_version.as_deref(), Some("1.0.0"));
        assert_eq!(info.battery_percent, Some(87));

        device.mute("BATTERY_STATUS");
        assert!(manager.refresh_device_info().await.is_err());
        assert_eq!(manager.state().status, ConnectionStatus::Degraded);
        assert_eq!(manager.active_port().as_deref(), Some("COM3"));
    }

    #[tokio::test]
    async fn telemetry_timeout_after_disconnect_leaves_state_alone() {
        let backend = SimBackend::new();
        let device = SimulatedDevice::new();
        backend.attach(SerialDeviceInfo::bare("COM3"), device.clone());
        let manager = Arc::new(manager_with(&backend));
        manager.try_connect().await.unwrap();
        manager.refresh_device_info().await.unwrap();

        device.mute("BATTERY_STATUS");
        let refresh = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move { manager.refresh_device_info().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        manager.disconnect().await;

        assert!(refresh.await.unwrap().is_err());
        let state = manager.state();
        assert_eq!(state.status, ConnectionStatus::Disconnected);
        assert!(state.active_port.is_none());
    }

    #[tokio::test]
    async fn degrade_only_applies_to_the_current_session() {
        let backend = SimBackend::new();
        backend.attach(SerialDeviceInfo::bare("COM3"), SimulatedDevice::new());
        let manager = manager_with(&backend);

        assert!(!manager.mark_degraded("COM3", "late timeout".to_string()));
        assert_eq!(manager.state().status, ConnectionStatus::Disconnected);

        manager.try_connect().await.unwrap();
        assert!(!manager.mark_degraded("COM9", "other port".to_string()));
        assert_eq!(manager.state().status, ConnectionStatus::Connected);

        assert!(manager.mark_degraded("COM3", "late timeout".to_string()));
        assert!(manager.mark_degraded("COM3", "late timeout".to_string()));
        assert_eq!(manager.state().status, ConnectionStatus::Degraded);
        assert_eq!(manager.active_port().as_deref(), Some("COM3"));
    }

    #[tokio::test]
    async fn update_flag_blocks_reconnect() {
        let backend = SimBackend::new();
        backend.attach(SerialDeviceInfo::bare("COM3"), SimulatedDevice::new());
        let manager = manager_with(&backend);

        manager.begin_firmware_update().unwrap();
        assert!(matches!(manager.begin_firmware_update(), Err(DeviceError::UpdateInProgress)));
        assert!(matches!(manager.try_connect().await, Err(DeviceError::UpdateInProgress)));
        assert_eq!(manager.state().status, ConnectionStatus::UpdatingFirmware);
        assert!(backend.open_log().is_empty());

        manager.end_firmware_update();
        assert!(!manager.is_updating());
        assert_eq!(manager.state().status, ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn time_mode_pushes_clock() {
        let backend = SimBackend::new();
        let device = SimulatedDevice::new();
        backend.attach(SerialDeviceInfo::bare("COM3"), device.clone());
        let manager = manager_with(&backend);
        manager.try_connect().await.unwrap();

        manager.set_display_mode(DisplayMode::Time, true).await.unwrap();
        assert_eq!(manager.display_settings().await, (DisplayMode::Time, true));
        assert!(device.clock().is_some());
    }
}
