use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FirmwareRelease {
    /// Raw release tag, e.g. `firmware-v1.2.0`.
    pub tag_version: String,
    /// Firmware version extracted from the tag or release notes.
    pub firmware_version: String,
    pub software_version: Option<String>,
    pub download_url: String,
    pub asset_name: String,
    pub size_bytes: u64,
    pub published_at: Option<chrono::DateTime<chrono::Utc>>,
    pub changelog: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VersionCheckResult {
    /// `None` when the device did not report a readable version.
    pub current_version: Option<String>,
    pub latest_version: String,
    pub update_available: bool,
    pub reason: String,
    pub release_info: Option<FirmwareRelease>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadProgress {
    pub downloaded_bytes: u64,
    pub total_bytes: u64,
    pub percentage: f64,
    pub speed_bps: u64,
}

/// One invocation of the external flashing tool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlashStep {
    Erase,
    Write,
    Verify,
}

impl fmt::Display for FlashStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlashStep::Erase => f.write_str("erase"),
            FlashStep::Write => f.write_str("write"),
            FlashStep::Verify => f.write_str("verify"),
        }
    }
}

/// Phase of a firmware update, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateStep {
    FetchRelease,
    Download,
    Bootloader,
    Disconnect,
    DetectPort,
    Flash(FlashStep),
    Cleanup,
    Complete,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateProgress {
    pub step: UpdateStep,
    pub percent: u8,
    pub message: String,
}

#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid release metadata: {0}")]
    InvalidRelease(String),

    #[error("Release has no downloadable firmware image")]
    NoArtifact,

    #[error("Download failed: {0}")]
    DownloadFailed(String),

    #[error("Flash step '{step}' failed on {port}: {detail}")]
    FlashStepFailed {
        step: FlashStep,
        port: String,
        detail: String,
    },

    #[error("Flashing tool not found: {0}")]
    FlasherNotFound(String),

    #[error("No serial port available for flashing")]
    NoFlashPort,

    #[error("Firmware update already in progress")]
    UpdateInProgress,

    #[error("Bootloader entry failed: {0}")]
    BootloaderEntryFailed(String),
}

pub type UpdateResult<T> = Result<T, UpdateError>;
