use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tempfile::TempDir;
use uuid::Uuid;

use super::models::UpdateResult;

/// Scratch state for one update attempt.
///
/// The downloaded image lives in a private temporary directory that is removed
/// when the session is dropped, whichever way the update ends.
#[derive(Debug)]
pub struct UpdateSession {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub original_port: Option<String>,
    pub resolved_port: Option<String>,
    pub artifact_path: Option<PathBuf>,
    progress: u8,
    workdir: TempDir,
}

impl UpdateSession {
    pub fn new() -> UpdateResult<Self> {
        let id = Uuid::new_v4();
        let workdir = tempfile::Builder::new().prefix("padawan-fw-").tempdir()?;
        log::debug!("Update session {} using {}", id, workdir.path().display());

        Ok(Self {
            id,
            started_at: Utc::now(),
            original_port: None,
            resolved_port: None,
            artifact_path: None,
            progress: 0,
            workdir,
        })
    }

    pub fn workdir(&self) -> &Path {
        self.workdir.path()
    }

    /// Where to store the downloaded image. Only the file name of `asset_name`
    /// is used so a hostile asset name cannot escape the session directory.
    pub fn artifact_target(&mut self, asset_name: &str) -> PathBuf {
        let file_name = Path::new(asset_name)
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "firmware.bin".into());
        let path = self.workdir.path().join(file_name);
        self.artifact_path = Some(path.clone());
        path
    }

    pub fn progress(&self) -> u8 {
        self.progress
    }

    /// Progress only moves forward.
    pub fn set_progress(&mut self, percent: u8) {
        self.progress = self.progress.max(percent.min(100));
    }

    /// Remove the temporary directory now and report failures.
    pub fn finish(self) {
        let id = self.id;
        if let Err(e) = self.workdir.close() {
            log::warn!("Could not remove update session {} files: {}", id, e);
        }
    }
}
