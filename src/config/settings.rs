//! Application settings for the PadAwan Force tools.
//!
//! Settings are layered, later sources overriding earlier ones:
//! 1. Built-in defaults
//! 2. Global config file (`<config dir>/padawan-force/config.toml`)
//! 3. Local config file (`./padawan-force.toml`)
//! 4. A file named with `--config`
//!
//! Command-line flags are applied by the binary on top of the result.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use super::layout::{DisplaySettings, LayoutStore};
use super::Result;
use crate::device::{ManagerOptions, Timings, WatchPolicy};
use crate::serial::VendorProductFilter;
use crate::update::{EspTool, ReleaseLocator, UpdateOptions, UpdateResult, DEFAULT_REPO_NAME, DEFAULT_REPO_OWNER};

pub const LOCAL_CONFIG_FILE: &str = "padawan-force.toml";
pub const LAYOUT_FILE: &str = "macropad_config.json";

/// Polling and settle intervals, all in milliseconds unless named otherwise.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimingSettings {
    pub tick_ms: Option<u64>,
    pub health_every: Option<u32>,
    pub ping_timeout_ms: Option<u64>,
    pub poll_interval_ms: Option<u64>,
    pub stabilize_ms: Option<u64>,
    pub reconnect_settle_ms: Option<u64>,
    pub time_sync_secs: Option<u64>,
    /// How long to wait for the bootloader port to show up.
    pub bootloader_wait_secs: Option<u64>,
    pub bootloader_poll_ms: Option<u64>,
    pub port_settle_ms: Option<u64>,
    pub disconnect_settle_ms: Option<u64>,
    pub retry_settle_ms: Option<u64>,
    pub final_settle_ms: Option<u64>,
}

/// External flasher configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FlasherSettings {
    /// Explicit esptool executable.
    pub path: Option<PathBuf>,
    pub chip: Option<String>,
    pub baud: Option<u32>,
    pub step_timeout_secs: Option<u64>,
}

/// Where firmware releases are published.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReleaseSettings {
    pub owner: Option<String>,
    pub repo: Option<String>,
    pub api_base: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AppSettings {
    /// Port tried first when probing (e.g. "COM3" or "/dev/ttyACM0").
    pub preferred_port: Option<String>,
    pub layout_path: Option<PathBuf>,
    pub usb_filter: Option<VendorProductFilter>,
    #[serde(default)]
    pub timings: TimingSettings,
    #[serde(default)]
    pub flasher: FlasherSettings,
    #[serde(default)]
    pub releases: ReleaseSettings,
    pub display: Option<DisplaySettings>,
}

macro_rules! take_some {
    ($target:expr, $other:expr, [$($field:ident),+ $(,)?]) => {
        $(
            if $other.$field.is_some() {
                $target.$field = $other.$field;
            }
        )+
    };
}

impl AppSettings {
    /// Load settings from every source, with an optional explicit file on top.
    pub fn load(explicit: Option<&Path>) -> Self {
        Self::load_layers(
            Self::global_config_path().as_deref(),
            Path::new(LOCAL_CONFIG_FILE),
            explicit,
        )
    }

    fn load_layers(global: Option<&Path>, local: &Path, explicit: Option<&Path>) -> Self {
        let mut settings = Self::default();

        if let Some(global) = global {
            if let Some(found) = Self::load_from_file(global) {
                debug!("Loaded global settings from {}", global.display());
                settings.merge(found);
            }
        }

        if let Some(found) = Self::load_from_file(local) {
            debug!("Loaded local settings from {}", local.display());
            settings.merge(found);
        }

        if let Some(path) = explicit {
            settings.merge(Self::load_from_path(path));
        }

        settings
    }

    /// Load settings from a specific file (`--config`), falling back to defaults.
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(settings) = Self::load_from_file(path) {
            debug!("Loaded settings from {}", path.display());
            settings
        } else {
            warn!("Could not load settings from {}, using defaults", path.display());
            Self::default()
        }
    }

    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(settings) => Some(settings),
                Err(e) => {
                    warn!("Failed to parse settings file {}: {}", path.display(), e);
                    None
                }
            },
            Err(e) => {
                warn!("Failed to read settings file {}: {}", path.display(), e);
                None
            }
        }
    }

    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "padawan-force").map(|dirs| dirs.config_dir().to_path_buf())
    }

    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Overlay every field `other` sets.
    pub fn merge(&mut self, other: Self) {
        take_some!(self, other, [preferred_port, usb_filter, layout_path, display]);
        take_some!(
            self.timings,
            other.timings,
            [
                tick_ms,
                health_every,
                ping_timeout_ms,
                poll_interval_ms,
                stabilize_ms,
                reconnect_settle_ms,
                time_sync_secs,
                bootloader_wait_secs,
                bootloader_poll_ms,
                port_settle_ms,
                disconnect_settle_ms,
                retry_settle_ms,
                final_settle_ms,
            ]
        );
        take_some!(self.flasher, other.flasher, [path, chip, baud, step_timeout_secs]);
        take_some!(self.releases, other.releases, [owner, repo, api_base]);
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        info!("Saved settings to {}", path.display());
        Ok(())
    }

    pub fn manager_options(&self) -> ManagerOptions {
        let display = self.display_settings();
        let mut options = ManagerOptions {
            filter: Some(self.usb_filter.unwrap_or_default()),
            preferred_port: self.preferred_port.clone(),
            display_mode: display.mode,
            display_enabled: display.enabled,
            ..ManagerOptions::default()
        };

        let t = &self.timings;
        let defaults = Timings::default();
        options.timings = Timings {
            tick: t.tick_ms.map(Duration::from_millis).unwrap_or(defaults.tick),
            health_every: t.health_every.filter(|n| *n > 0).unwrap_or(defaults.health_every),
            stabilize: t.stabilize_ms.map(Duration::from_millis).unwrap_or(defaults.stabilize),
            reconnect_settle: t
                .reconnect_settle_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.reconnect_settle),
            time_sync: t.time_sync_secs.map(Duration::from_secs).unwrap_or(defaults.time_sync),
            ..defaults
        };
        if let Some(ms) = t.ping_timeout_ms {
            options.protocol.ping = Duration::from_millis(ms);
        }
        if let Some(ms) = t.poll_interval_ms {
            options.protocol.poll_interval = Duration::from_millis(ms.max(1));
        }
        options
    }

    /// Bootloader port search used during updates.
    pub fn watch_policy(&self) -> WatchPolicy {
        let t = &self.timings;
        let defaults = WatchPolicy::default();
        WatchPolicy {
            poll_interval: t
                .bootloader_poll_ms
                .map(|ms| Duration::from_millis(ms.max(1)))
                .unwrap_or(defaults.poll_interval),
            max_wait: t.bootloader_wait_secs.map(Duration::from_secs).unwrap_or(defaults.max_wait),
            settle: t.port_settle_ms.map(Duration::from_millis).unwrap_or(defaults.settle),
            ..defaults
        }
    }

    pub fn update_options(&self) -> UpdateOptions {
        let t = &self.timings;
        let defaults = UpdateOptions::default();
        UpdateOptions {
            disconnect_settle: t
                .disconnect_settle_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.disconnect_settle),
            retry_settle: t.retry_settle_ms.map(Duration::from_millis).unwrap_or(defaults.retry_settle),
            final_settle: t.final_settle_ms.map(Duration::from_millis).unwrap_or(defaults.final_settle),
        }
    }

    pub fn release_locator(&self) -> ReleaseLocator {
        let r = &self.releases;
        let locator = ReleaseLocator::new(
            r.owner.as_deref().unwrap_or(DEFAULT_REPO_OWNER),
            r.repo.as_deref().unwrap_or(DEFAULT_REPO_NAME),
        );
        match &r.api_base {
            Some(base) => locator.with_api_base(base.as_str()),
            None => locator,
        }
    }

    /// Locate esptool and apply the configured chip, baud and timeout.
    pub fn flasher(&self) -> UpdateResult<EspTool> {
        let f = &self.flasher;
        let mut tool = EspTool::discover(f.path.as_deref())?;
        if let Some(chip) = &f.chip {
            tool = tool.with_chip(chip.as_str());
        }
        if let Some(baud) = f.baud {
            tool = tool.with_baud(baud);
        }
        if let Some(secs) = f.step_timeout_secs {
            tool = tool.with_step_timeout(Duration::from_secs(secs));
        }
        Ok(tool)
    }

    pub fn layout_store(&self) -> LayoutStore {
        let path = self
            .layout_path
            .clone()
            .or_else(|| Self::global_config_dir().map(|dir| dir.join(LAYOUT_FILE)))
            .unwrap_or_else(|| PathBuf::from(LAYOUT_FILE));
        LayoutStore::new(path)
    }

    pub fn display_settings(&self) -> DisplaySettings {
        self.display.clone().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::{DisplayMode, PADAWAN_PID, PADAWAN_VID};

    #[test]
    fn defaults_target_the_padawan() {
        let options = AppSettings::default().manager_options();
        let filter = options.filter.unwrap();
        assert_eq!((filter.vid, filter.pid), (PADAWAN_VID, PADAWAN_PID));
        assert_eq!(options.baud_rate, 115200);
        assert_eq!(options.timings, Timings::default());
        assert!(options.preferred_port.is_none());
    }

    #[test]
    fn parses_full_toml() {
        let settings: AppSettings = toml::from_str(
            r#"
preferred_port = "COM3"
layout_path = "/tmp/pad.json"

[usb_filter]
vid = 4292
pid = 60000

[timings]
tick_ms = 500
health_every = 5
ping_timeout_ms = 800

[flasher]
chip = "esp32"
baud = 460800

[releases]
owner = "someone"
repo = "fork"

[display]
mode = "battery"
enabled = false
"#,
        )
        .unwrap();

        let options = settings.manager_options();
        assert_eq!(options.preferred_port.as_deref(), Some("COM3"));
        assert_eq!(options.filter.unwrap().vid, 4292);
        assert_eq!(options.timings.tick, Duration::from_millis(500));
        assert_eq!(options.timings.health_every, 5);
        assert_eq!(options.protocol.ping, Duration::from_millis(800));
        assert_eq!(settings.flasher.baud, Some(460800));
        assert_eq!(settings.display_settings().mode, DisplayMode::Battery);
        assert_eq!(options.display_mode, DisplayMode::Battery);
        assert!(!options.display_enabled);
        assert_eq!(settings.layout_store().path(), Path::new("/tmp/pad.json"));
    }

    #[test]
    fn update_timings_come_from_settings() {
        let defaults = AppSettings::default();
        assert_eq!(defaults.watch_policy(), WatchPolicy::default());
        assert_eq!(defaults.update_options().final_settle, UpdateOptions::default().final_settle);

        let settings: AppSettings = toml::from_str(
            r#"
[timings]
bootloader_wait_secs = 30
port_settle_ms = 250
retry_settle_ms = 500
final_settle_ms = 0
"#,
        )
        .unwrap();

        let policy = settings.watch_policy();
        assert_eq!(policy.max_wait, Duration::from_secs(30));
        assert_eq!(policy.settle, Duration::from_millis(250));
        assert_eq!(policy.poll_interval, WatchPolicy::default().poll_interval);
        assert!(policy.prefer_non_original);

        let options = settings.update_options();
        assert_eq!(options.retry_settle, Duration::from_millis(500));
        assert_eq!(options.final_settle, Duration::ZERO);
        assert_eq!(options.disconnect_settle, UpdateOptions::default().disconnect_settle);
    }

    #[test]
    fn merge_keeps_values_the_overlay_leaves_unset() {
        let mut base = AppSettings {
            preferred_port: Some("COM3".into()),
            ..Default::default()
        };
        base.flasher.chip = Some("esp32s3".into());

        let mut overlay = AppSettings::default();
        overlay.flasher.baud = Some(460800);
        overlay.releases.repo = Some("fork".into());
        base.merge(overlay);

        assert_eq!(base.preferred_port.as_deref(), Some("COM3"));
        assert_eq!(base.flasher.chip.as_deref(), Some("esp32s3"));
        assert_eq!(base.flasher.baud, Some(460800));
        assert_eq!(base.releases.repo.as_deref(), Some("fork"));
    }

    #[test]
    fn later_files_override_earlier_ones() {
        let dir = tempfile::tempdir().unwrap();
        let global = dir.path().join("global.toml");
        let local = dir.path().join("local.toml");
        let explicit = dir.path().join("explicit.toml");

        fs::write(&global, "preferred_port = \"COM1\"\n[flasher]\nchip = \"esp32\"\n").unwrap();
        fs::write(&local, "preferred_port = \"COM2\"\n").unwrap();
        fs::write(&explicit, "[timings]\ntick_ms = 250\n").unwrap();

        let settings = AppSettings::load_layers(Some(&global), &local, Some(&explicit));
        assert_eq!(settings.preferred_port.as_deref(), Some("COM2"));
        assert_eq!(settings.flasher.chip.as_deref(), Some("esp32"));
        assert_eq!(settings.timings.tick_ms, Some(250));
    }

    #[test]
    fn unreadable_files_fall_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let broken = dir.path().join("broken.toml");
        fs::write(&broken, "preferred_port = [").unwrap();

        let settings = AppSettings::load_layers(None, &dir.path().join("missing.toml"), Some(&broken));
        assert_eq!(settings, AppSettings::default());
    }

    #[test]
    fn save_then_load_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut settings = AppSettings::default();
        settings.releases.api_base = Some("http://127.0.0.1:9000".into());
        settings.flasher.step_timeout_secs = Some(30);
        settings.save(&path).unwrap();

        assert_eq!(AppSettings::load_from_path(&path), settings);
    }

    #[test]
    fn global_config_path_names_the_app() {
        if let Some(path) = AppSettings::global_config_path() {
            let text = path.to_string_lossy();
            assert!(text.contains("padawan-force"));
            assert!(text.ends_with("config.toml"));
        }
    }
}
