use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::serial::{DisplayMode, ProtocolTimeouts, VendorProductFilter, BAUD_RATE};

/// Connection status as seen by observers
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Probing,
    Connected,
    Degraded,
    UpdatingFirmware,
}

impl ConnectionStatus {
    /// Statuses that own an active port.
    pub fn has_port(&self) -> bool {
        matches!(self, ConnectionStatus::Connected | ConnectionStatus::Degraded)
    }
}

/// Consistent snapshot of the connection.
///
/// `active_port` is set exactly when `status` is Connected or Degraded; the
/// constructors below are the only way the manager builds one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    pub active_port: Option<String>,
    pub last_error: Option<String>,
}

impl ConnectionState {
    pub fn disconnected(last_error: Option<String>) -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            active_port: None,
            last_error,
        }
    }

    pub fn probing() -> Self {
        Self {
            status: ConnectionStatus::Probing,
            active_port: None,
            last_error: None,
        }
    }

    pub fn connected(port: String) -> Self {
        Self {
            status: ConnectionStatus::Connected,
            active_port: Some(port),
            last_error: None,
        }
    }

    pub fn degraded(port: String, reason: String) -> Self {
        Self {
            status: ConnectionStatus::Degraded,
            active_port: Some(port),
            last_error: Some(reason),
        }
    }

    pub fn updating_firmware() -> Self {
        Self {
            status: ConnectionStatus::UpdatingFirmware,
            active_port: None,
            last_error: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.status.has_port()
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::disconnected(None)
    }
}

/// Best-effort device telemetry, refreshed while connected
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DeviceInfo {
    pub firmware_version: Option<String>,
    pub battery_percent: Option<u8>,
    pub battery_voltage: Option<f32>,
    pub uptime_secs: Option<u64>,
    pub last_connected: Option<DateTime<Utc>>,
    pub bytes_transferred: u64,
}

/// Emitted on every status transition
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusEvent {
    pub previous: ConnectionState,
    pub current: ConnectionState,
    pub at: DateTime<Utc>,
}

/// Result of one supervisory health check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthOutcome {
    /// Not connected, or an update owns the port.
    Skipped,
    Healthy,
    /// Port was missing from a listing but confirmed present or answering.
    Recovered,
    Disconnected,
}

/// Settle and polling intervals used by the connection manager and supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    /// Wait after opening a port before the handshake.
    pub stabilize: Duration,
    /// Wait after closing a stale channel before probing again.
    pub reconnect_settle: Duration,
    /// Wait before re-checking a port missing from the listing.
    pub health_recheck: Duration,
    pub tick: Duration,
    /// Health check runs on every Nth tick.
    pub health_every: u32,
    pub time_sync: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            stabilize: Duration::from_millis(150),
            reconnect_settle: Duration::from_millis(300),
            health_recheck: Duration::from_millis(500),
            tick: Duration::from_secs(2),
            health_every: 3,
            time_sync: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub filter: Option<VendorProductFilter>,
    pub baud_rate: u32,
    /// Tried first when probing, if present in the listing.
    pub preferred_port: Option<String>,
    pub timings: Timings,
    pub protocol: ProtocolTimeouts,
    /// Display settings assumed until the first explicit change.
    pub display_mode: DisplayMode,
    pub display_enabled: bool,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            filter: Some(VendorProductFilter::default()),
            baud_rate: BAUD_RATE,
            preferred_port: None,
            timings: Timings::default(),
            protocol: ProtocolTimeouts::default(),
            display_mode: DisplayMode::Layer,
            display_enabled: true,
        }
    }
}
