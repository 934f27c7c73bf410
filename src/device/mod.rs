pub mod manager;
pub mod models;
pub mod port_watcher;
pub mod supervisor;

pub use manager::ConnectionManager;
pub use models::*;
pub use port_watcher::{PortEvent, PortResolution, PortWatcher, ResolutionReason, WatchPolicy};
pub use supervisor::{Supervisor, SupervisorHandle, TickAction};

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("Device not found")]
    NotFound,

    #[error("Device not connected")]
    NotConnected,

    #[error("Firmware update in progress")]
    UpdateInProgress,

    #[error("Serial communication error: {0}")]
    SerialError(#[from] crate::serial::SerialError),
}

pub type Result<T> = std::result::Result<T, DeviceError>;
