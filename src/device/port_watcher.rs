use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::serial::PortScanner;

/// Port appearance/disappearance seen between two polls
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PortEvent {
    /// A serial port was added
    PortAdded(String),
    /// A serial port was removed
    PortRemoved(String),
}

/// Tie-break policy for resolving the bootloader port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchPolicy {
    pub poll_interval: Duration,
    pub max_wait: Duration,
    /// Wait after picking a port so the OS finishes setting it up.
    pub settle: Duration,
    /// Accept the first remaining port as soon as the original disappears.
    pub fallback_when_original_vanishes: bool,
    /// When the original is still listed next to other ports, treat it as stale.
    pub prefer_non_original: bool,
}

impl Default for WatchPolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            max_wait: Duration::from_secs(15),
            settle: Duration::from_secs(1),
            fallback_when_original_vanishes: true,
            prefer_non_original: true,
        }
    }
}

/// Why a port was chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolutionReason {
    NewPortAppeared,
    OriginalVanished,
    PreferredNonOriginal,
    FirstRemaining,
    KeptOriginal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortResolution {
    pub port: String,
    pub changed: bool,
    pub reason: ResolutionReason,
    pub events: Vec<PortEvent>,
}

/// Watches the port listing while the device re-enumerates into its bootloader.
#[derive(Clone)]
pub struct PortWatcher {
    scanner: PortScanner,
    policy: WatchPolicy,
}

impl PortWatcher {
    pub fn new(scanner: PortScanner, policy: WatchPolicy) -> Self {
        Self { scanner, policy }
    }

    pub fn policy(&self) -> &WatchPolicy {
        &self.policy
    }

    fn listing(&self) -> Option<Vec<String>> {
        match self.scanner.port_names() {
            Ok(names) => Some(names),
            Err(e) => {
                log::debug!("Skipping poll, enumeration failed: {}", e);
                None
            }
        }
    }

    /// Resolve the port to flash after the device was told to reset.
    ///
    /// `original` is the port of the normal session; the result falls back to it
    /// when nothing better shows up.
    pub async fn resolve(&self, original: &str) -> PortResolution {
        let mut seen: Vec<String> = self.listing().unwrap_or_default();
        let mut last = seen.clone();
        let mut events = Vec::new();
        let mut chosen: Option<(String, ResolutionReason)> = None;
        let deadline = Instant::now() + self.policy.max_wait;

        log::info!("Waiting for bootloader port (original {}, visible {:?})", original, seen);

        while chosen.is_none() && Instant::now() < deadline {
            tokio::time::sleep(self.policy.poll_interval).await;

            let Some(current) = self.listing() else {
                continue;
            };
            record_changes(&last, &current, &mut events);
            last = current.clone();

            if let Some(new_port) = current.iter().find(|p| !seen.contains(p)) {
                log::info!("New port detected: {} (bootloader mode)", new_port);
                seen.push(new_port.clone());
                chosen = Some((new_port.clone(), ResolutionReason::NewPortAppeared));
            } else if self.policy.fallback_when_original_vanishes
                && !current.iter().any(|p| p == original)
                && !current.is_empty()
            {
                log::info!("Original port {} disappeared, using {}", original, current[0]);
                chosen = Some((current[0].clone(), ResolutionReason::OriginalVanished));
            }

            if chosen.is_some() {
                tokio::time::sleep(self.policy.settle).await;
            }
        }

        if chosen.is_none() {
            log::warn!("No port change seen within {:?}", self.policy.max_wait);
        }

        let final_ports = self.listing().unwrap_or_else(|| last.clone());
        record_changes(&last, &final_ports, &mut events);
        let (port, reason) = self.disambiguate(original, chosen, &final_ports);

        log::info!("Final port for flashing: {} (original {}, {:?})", port, original, reason);
        PortResolution {
            changed: port != original,
            port,
            reason,
            events,
        }
    }

    fn disambiguate(
        &self,
        original: &str,
        chosen: Option<(String, ResolutionReason)>,
        final_ports: &[String],
    ) -> (String, ResolutionReason) {
        let (port, reason) = chosen.unwrap_or_else(|| (original.to_string(), ResolutionReason::KeptOriginal));
        let original_listed = final_ports.iter().any(|p| p == original);

        if self.policy.prefer_non_original && original_listed && final_ports.len() > 1 {
            if port != original && final_ports.contains(&port) {
                return (port, reason);
            }
            if let Some(other) = final_ports.iter().find(|p| p.as_str() != original) {
                return (other.clone(), ResolutionReason::PreferredNonOriginal);
            }
        }

        if !final_ports.contains(&port) {
            if let Some(first) = final_ports.first() {
                return (first.clone(), ResolutionReason::FirstRemaining);
            }
        }

        (port, reason)
    }

    /// `preferred` if it is listed, otherwise the first listed port.
    pub fn available_port(&self, preferred: &str) -> String {
        match self.listing() {
            Some(ports) if ports.iter().any(|p| p == preferred) => preferred.to_string(),
            Some(ports) => ports.into_iter().next().unwrap_or_else(|| preferred.to_string()),
            None => preferred.to_string(),
        }
    }

    /// First listed port other than `failed`, or `failed` itself if it is alone.
    pub fn alternative_port(&self, failed: &str) -> String {
        self.listing()
            .and_then(|ports| ports.into_iter().find(|p| p != failed))
            .unwrap_or_else(|| failed.to_string())
    }
}

fn record_changes(before: &[String], after: &[String], events: &mut Vec<PortEvent>) {
    for port in after.iter().filter(|p| !before.contains(p)) {
        events.push(PortEvent::PortAdded(port.clone()));
    }
    for port in before.iter().filter(|p| !after.contains(p)) {
        events.push(PortEvent::PortRemoved(port.clone()));
    }
}
