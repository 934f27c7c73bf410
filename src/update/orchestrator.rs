use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use uuid::Uuid;

use crate::device::{ConnectionManager, PortWatcher};
use super::flasher::Flasher;
use super::models::{
    FirmwareRelease, FlashStep, UpdateError, UpdateProgress, UpdateResult, UpdateStep, VersionCheckResult,
};
use super::service::ReleaseLocator;
use super::session::UpdateSession;
use super::version::check_update;

/// Progress sink for [`FirmwareUpdateOrchestrator::run`]
pub type ProgressFn<'a> = &'a (dyn Fn(UpdateProgress) + Send + Sync);

#[derive(Debug, Clone, Copy)]
pub struct UpdateOptions {
    /// Wait after closing the normal session so the OS releases the port.
    pub disconnect_settle: Duration,
    /// Wait before retrying a failed flash step on another port.
    pub retry_settle: Duration,
    /// Wait before clearing the update flag, success or failure.
    pub final_settle: Duration,
}

impl Default for UpdateOptions {
    fn default() -> Self {
        Self {
            disconnect_settle: Duration::from_millis(2000),
            retry_settle: Duration::from_millis(1000),
            final_settle: Duration::from_millis(2000),
        }
    }
}

/// Summary of a completed update
#[derive(Debug, Clone, Serialize)]
pub struct UpdateReport {
    pub session_id: Uuid,
    pub release: FirmwareRelease,
    pub original_port: Option<String>,
    pub flash_port: String,
    /// Where the image was downloaded. The file is deleted before the report is returned.
    pub artifact_path: PathBuf,
    pub bytes_downloaded: u64,
    pub bootloader_entered: bool,
    pub retries: u32,
}

/// Clears the update flag if the run is abandoned before its normal exit.
struct UpdateFlag<'a> {
    manager: &'a ConnectionManager,
}

impl Drop for UpdateFlag<'_> {
    fn drop(&mut self) {
        if self.manager.is_updating() {
            self.manager.end_firmware_update();
        }
    }
}

/// Runs the field firmware update sequence against the managed device.
pub struct FirmwareUpdateOrchestrator<F: Flasher> {
    manager: Arc<ConnectionManager>,
    locator: ReleaseLocator,
    flasher: F,
    watcher: PortWatcher,
    options: UpdateOptions,
}

impl<F: Flasher> FirmwareUpdateOrchestrator<F> {
    pub fn new(
        manager: Arc<ConnectionManager>,
        locator: ReleaseLocator,
        flasher: F,
        watcher: PortWatcher,
        options: UpdateOptions,
    ) -> Self {
        Self {
            manager,
            locator,
            flasher,
            watcher,
            options,
        }
    }

    /// Compare the device's firmware with the latest release.
    pub async fn check_for_update(&self) -> UpdateResult<VersionCheckResult> {
        let release = self.locator.latest_release().await?;
        let current = match self.manager.firmware_version().await {
            Ok(version) => Some(version),
            Err(e) => {
                log::info!("Device version unavailable ({}), treating as eligible", e);
                None
            }
        };
        Ok(check_update(current.as_deref(), &release))
    }

    /// Fetch, download, enter bootloader, resolve the port, then erase, write and
    /// verify. The update flag is held for the whole run and released after a
    /// settle delay on every exit path.
    pub async fn run(&self, progress: ProgressFn<'_>) -> UpdateResult<UpdateReport> {
        self.manager
            .begin_firmware_update()
            .map_err(|_| UpdateError::UpdateInProgress)?;
        let flag = UpdateFlag {
            manager: &self.manager,
        };

        let result = self.run_inner(progress).await;

        match &result {
            Ok(report) => {
                log::info!("Firmware {} flashed on {}", report.release.firmware_version, report.flash_port);
                progress(UpdateProgress {
                    step: UpdateStep::Complete,
                    percent: 100,
                    message: "Firmware update complete".to_string(),
                });
            }
            Err(e) => {
                log::error!("Firmware update failed: {}", e);
                progress(UpdateProgress {
                    step: UpdateStep::Failed,
                    percent: 0,
                    message: e.to_string(),
                });
            }
        }

        tokio::time::sleep(self.options.final_settle).await;
        drop(flag);
        result
    }

    async fn run_inner(&self, progress: ProgressFn<'_>) -> UpdateResult<UpdateReport> {
        let mut session = UpdateSession::new()?;
        let report_step = |session: &mut UpdateSession, step: UpdateStep, percent: u8, message: &str| {
            session.set_progress(percent);
            progress(UpdateProgress {
                step,
                percent: session.progress(),
                message: message.to_string(),
            });
        };

        report_step(&mut session, UpdateStep::FetchRelease, 10, "Fetching release information...");
        let release = self.locator.latest_release().await?;

        report_step(&mut session, UpdateStep::Download, 20, "Downloading firmware...");
        let artifact = session.artifact_target(&release.asset_name);
        let bytes_downloaded = self
            .locator
            .download_artifact(&release, &artifact, |p| {
                progress(UpdateProgress {
                    step: UpdateStep::Download,
                    percent: 20 + (p.percentage * 0.35) as u8,
                    message: format!("Downloaded {} of {} bytes", p.downloaded_bytes, p.total_bytes),
                })
            })
            .await?;

        session.original_port = self.manager.active_port();
        let mut bootloader_entered = false;
        if let Some(port) = session.original_port.clone() {
            report_step(&mut session, UpdateStep::Bootloader, 55, "Entering bootloader mode...");
            match self.manager.enter_bootloader().await {
                Ok(()) => bootloader_entered = true,
                Err(e) => {
                    let err = UpdateError::BootloaderEntryFailed(format!("{}: {}", port, e));
                    log::warn!("{} (continuing, device may already be in bootloader mode)", err);
                }
            }
        }
        session.set_progress(55);

        report_step(&mut session, UpdateStep::Disconnect, 57, "Closing device connection...");
        self.manager.disconnect().await;
        tokio::time::sleep(self.options.disconnect_settle).await;

        report_step(&mut session, UpdateStep::DetectPort, 58, "Detecting bootloader port...");
        let flash_port = match session.original_port.clone() {
            Some(original) => self.watcher.resolve(&original).await.port,
            None => self
                .manager
                .scanner()
                .list_candidates()
                .ok()
                .and_then(|ports| ports.into_iter().next())
                .ok_or(UpdateError::NoFlashPort)?,
        };
        session.resolved_port = Some(flash_port.clone());

        let mut port = flash_port;
        let mut retries = 0;
        for (step, percent, message) in [
            (FlashStep::Erase, 60, "Erasing flash..."),
            (FlashStep::Write, 70, "Writing firmware..."),
            (FlashStep::Verify, 90, "Verifying firmware..."),
        ] {
            report_step(&mut session, UpdateStep::Flash(step), percent, message);
            let (used, retried) = self.flash_with_retry(step, &port, &artifact).await?;
            if retried {
                retries += 1;
                session.resolved_port = Some(used.clone());
            }
            port = used;
        }

        report_step(&mut session, UpdateStep::Cleanup, 95, "Cleaning up...");
        let report = UpdateReport {
            session_id: session.id,
            release,
            original_port: session.original_port.clone(),
            flash_port: port,
            artifact_path: artifact,
            bytes_downloaded,
            bootloader_entered,
            retries,
        };
        session.finish();
        Ok(report)
    }

    /// Run one step, retrying exactly once on an alternate port. Returns the port
    /// that succeeded and whether a retry was needed.
    async fn flash_with_retry(&self, step: FlashStep, preferred: &str, image: &Path) -> UpdateResult<(String, bool)> {
        let port = self.watcher.available_port(preferred);

        let first = match self.flasher.run_step(&port, step, image).await {
            Ok(_) => return Ok((port, false)),
            Err(e @ UpdateError::FlasherNotFound(_)) => return Err(e),
            Err(e) => e,
        };

        log::warn!("{} failed on {}: {}; retrying on an alternate port", step, port, first);
        tokio::time::sleep(self.options.retry_settle).await;

        let alternate = self.watcher.alternative_port(&port);
        match self.flasher.run_step(&alternate, step, image).await {
            Ok(_) => {
                log::info!("{} succeeded on alternate port {}", step, alternate);
                Ok((alternate, true))
            }
            Err(e) => {
                log::error!("{} failed again on {}: {}", step, alternate, e);
                Err(match e {
                    failed @ UpdateError::FlashStepFailed { .. } => failed,
                    other => UpdateError::FlashStepFailed {
                        step,
                        port: alternate,
                        detail: other.to_string(),
                    },
                })
            }
        }
    }
}
