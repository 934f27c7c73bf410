use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use chrono::NaiveTime;
use serde::Serialize;

use crate::config::{LayoutDocument, LayoutStore};
use crate::device::{ConnectionManager, ConnectionState, DeviceInfo};
use crate::serial::{DisplayMode, SerialDeviceInfo};
use crate::update::{FirmwareUpdateOrchestrator, Flasher, ProgressFn, UpdateReport, VersionCheckResult};

/// Snapshot printed by `status`
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub state: ConnectionState,
    pub info: DeviceInfo,
    pub display_mode: DisplayMode,
    pub display_enabled: bool,
}

/// Candidate ports with whatever USB metadata the OS reports.
pub fn list_ports(manager: &ConnectionManager) -> Result<Vec<SerialDeviceInfo>> {
    let scanner = manager.scanner();
    let candidates = scanner.list_candidates().context("Failed to enumerate serial ports")?;
    let known = scanner.enumerate().unwrap_or_default();

    Ok(candidates
        .into_iter()
        .map(|name| {
            known
                .iter()
                .find(|info| info.port_name == name)
                .cloned()
                .unwrap_or_else(|| SerialDeviceInfo::bare(name))
        })
        .collect())
}

/// Connect if needed and return the active port.
pub async fn ensure_connected(manager: &ConnectionManager) -> Result<String> {
    if let Some(port) = manager.active_port() {
        return Ok(port);
    }
    manager.try_connect().await.context("Failed to connect to device")
}

pub async fn device_status(manager: &ConnectionManager) -> Result<StatusReport> {
    ensure_connected(manager).await?;
    if let Err(e) = manager.refresh_device_info().await {
        log::warn!("Telemetry refresh incomplete: {}", e);
    }
    let (display_mode, display_enabled) = manager.display_settings().await;

    Ok(StatusReport {
        state: manager.state(),
        info: manager.device_info().await,
        display_mode,
        display_enabled,
    })
}

/// Round-trip time of one PING.
pub async fn ping_device(manager: &ConnectionManager) -> Result<Duration> {
    ensure_connected(manager).await?;
    let started = Instant::now();
    manager.ping().await.context("Device did not answer PING")?;
    Ok(started.elapsed())
}

/// Validate a layout file, send it to the device and keep a local copy.
pub async fn upload_layout_file(
    manager: &ConnectionManager,
    store: &LayoutStore,
    file: &Path,
) -> Result<LayoutDocument> {
    let json = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let mut document =
        LayoutDocument::parse(&json).with_context(|| format!("{} is not a valid layout", file.display()))?;
    document.touch();

    ensure_connected(manager).await?;
    manager
        .upload_layout(&document.to_json()?)
        .await
        .context("Device rejected the layout")?;

    if let Err(e) = store.save(&document).await {
        log::warn!("Uploaded, but the local copy was not saved: {}", e);
    }
    Ok(document)
}

/// Read the layout stored on the device and keep a local copy.
pub async fn download_layout(manager: &ConnectionManager, store: &LayoutStore, legacy: bool) -> Result<LayoutDocument> {
    ensure_connected(manager).await?;
    let json = if legacy {
        manager.download_layout().await
    } else {
        manager.current_layout().await
    }
    .context("Failed to read layout from device")?;

    let document = LayoutDocument::parse(&json).context("Device returned an invalid layout")?;
    store
        .save(&document)
        .await
        .with_context(|| format!("Failed to save layout to {}", store.path().display()))?;
    Ok(document)
}

pub async fn set_display(manager: &ConnectionManager, mode: DisplayMode, enabled: bool) -> Result<()> {
    ensure_connected(manager).await?;
    manager
        .set_display_mode(mode, enabled)
        .await
        .with_context(|| format!("Failed to set display mode to {}", mode))
}

/// Set the device clock to `time`, or to local time when not given.
pub async fn set_device_time(manager: &ConnectionManager, time: Option<NaiveTime>) -> Result<()> {
    ensure_connected(manager).await?;
    match time {
        Some(time) => manager.set_time(time).await,
        None => manager.sync_clock().await,
    }
    .context("Failed to set device time")
}

/// Connect for commands that still work without the device, logging why not.
async fn connect_best_effort(manager: &ConnectionManager) -> Option<String> {
    match ensure_connected(manager).await {
        Ok(port) => Some(port),
        Err(e) => {
            log::warn!("Continuing without a device connection: {:#}", e);
            None
        }
    }
}

/// Compare the device firmware with the latest release.
///
/// Without a device the version is unknown and an update counts as available.
pub async fn check_for_update<F: Flasher>(
    manager: &ConnectionManager,
    orchestrator: &FirmwareUpdateOrchestrator<F>,
) -> Result<VersionCheckResult> {
    connect_best_effort(manager).await;
    orchestrator
        .check_for_update()
        .await
        .context("Failed to check for firmware updates")
}

/// Run the full update unless the device is already current and `force` is not set.
pub async fn run_update<F: Flasher>(
    manager: &Arc<ConnectionManager>,
    orchestrator: &FirmwareUpdateOrchestrator<F>,
    force: bool,
    progress: ProgressFn<'_>,
) -> Result<Option<UpdateReport>> {
    if manager.is_updating() {
        bail!("A firmware update is already running");
    }

    if force {
        connect_best_effort(manager).await;
    } else {
        let check = check_for_update(manager, orchestrator).await?;
        if !check.update_available {
            log::info!("Firmware is up to date ({})", check.reason);
            return Ok(None);
        }
    }

    let report = orchestrator.run(progress).await.context("Firmware update failed")?;
    Ok(Some(report))
}
