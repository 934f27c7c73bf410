use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::{timeout, Duration, MissedTickBehavior};

use crate::serial::DisplayMode;
use super::{ConnectionManager, HealthOutcome};

/// What one supervisory tick did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickAction {
    /// Update in progress, nothing touched.
    Suspended,
    Reconnected,
    ReconnectFailed,
    Checked(HealthOutcome),
    Refreshed,
}

/// Periodic reconnection, health and clock-sync driver for a [`ConnectionManager`].
pub struct Supervisor {
    manager: Arc<ConnectionManager>,
    ticks: AtomicU64,
}

/// Running supervisor tasks
pub struct SupervisorHandle {
    tasks: Vec<(tokio::task::JoinHandle<()>, mpsc::Sender<()>)>,
}

impl Supervisor {
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        Self {
            manager,
            ticks: AtomicU64::new(0),
        }
    }

    /// One pass of the supervisory timer.
    ///
    /// Reconnect attempts are suppressed while a firmware update holds the
    /// update flag; connected sessions get a health check every Nth tick and a
    /// telemetry refresh otherwise.
    pub async fn tick(&self) -> TickAction {
        if self.manager.is_updating() {
            return TickAction::Suspended;
        }

        let tick = self.ticks.fetch_add(1, Ordering::SeqCst) + 1;

        if !self.manager.is_connected() {
            return match self.manager.try_connect().await {
                Ok(port) => {
                    log::info!("Supervisor connected on {}", port);
                    self.sync_clock_if_needed().await;
                    TickAction::Reconnected
                }
                Err(e) => {
                    log::debug!("Reconnect attempt failed: {}", e);
                    TickAction::ReconnectFailed
                }
            };
        }

        let every = u64::from(self.manager.options().timings.health_every.max(1));
        if tick % every == 0 {
            return TickAction::Checked(self.manager.health_check().await);
        }

        if let Err(e) = self.manager.refresh_device_info().await {
            log::debug!("Telemetry refresh failed: {}", e);
        }
        TickAction::Refreshed
    }

    async fn sync_clock_if_needed(&self) {
        let (mode, enabled) = self.manager.display_settings().await;
        if mode != DisplayMode::Time || !enabled || !self.manager.is_connected() {
            return;
        }
        match self.manager.sync_clock().await {
            Ok(()) => log::debug!("Device clock synchronised"),
            Err(e) => log::warn!("Clock sync failed: {}", e),
        }
    }

    /// Spawn the supervisory timer and the clock-sync timer.
    pub fn start(self) -> SupervisorHandle {
        let timings = self.manager.options().timings;
        let supervisor = Arc::new(self);

        let (tick_tx, mut tick_rx) = mpsc::channel::<()>(1);
        let ticker = Arc::clone(&supervisor);
        let tick_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(timings.tick);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = tick_rx.recv() => {
                        log::debug!("Supervisor timer stopped");
                        break;
                    }
                    _ = interval.tick() => {
                        let action = ticker.tick().await;
                        log::trace!("Supervisor tick: {:?}", action);
                    }
                }
            }
        });

        let (sync_tx, mut sync_rx) = mpsc::channel::<()>(1);
        let syncer = Arc::clone(&supervisor);
        let sync_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(timings.time_sync);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick fires immediately; the connect path already syncs
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = sync_rx.recv() => break,
                    _ = interval.tick() => {
                        if !syncer.manager.is_updating() {
                            syncer.sync_clock_if_needed().await;
                        }
                    }
                }
            }
        });

        SupervisorHandle {
            tasks: vec![(tick_task, tick_tx), (sync_task, sync_tx)],
        }
    }
}

impl SupervisorHandle {
    /// Signal both timers and wait briefly for them to finish.
    pub async fn stop(self) {
        for (task, stop_tx) in self.tasks {
            let _ = stop_tx.send(()).await;
            let _ = timeout(Duration::from_secs(2), task).await;
        }
    }
}
