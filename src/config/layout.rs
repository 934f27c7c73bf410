use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Local;
use serde::{Deserialize, Serialize};

use super::{ConfigError, Result};
use crate::serial::DisplayMode;

pub const MAX_BUTTONS: usize = 6;
pub const MAX_KNOBS: usize = 2;
pub const KNOB_IDS: [&str; MAX_KNOBS] = ["A", "B"];
pub const NO_ACTION: &str = "None";

const SAVE_ATTEMPTS: u32 = 3;
const SAVE_BACKOFF: Duration = Duration::from_millis(100);

fn default_true() -> bool {
    true
}

fn no_action() -> String {
    NO_ACTION.to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ButtonConfig {
    #[serde(default = "no_action")]
    pub action: String,
    #[serde(default)]
    pub key: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for ButtonConfig {
    fn default() -> Self {
        Self {
            action: no_action(),
            key: String::new(),
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnobConfig {
    #[serde(default = "no_action")]
    pub ccw_action: String,
    #[serde(default = "no_action")]
    pub cw_action: String,
    #[serde(default = "no_action")]
    pub press_action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ccw_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cw_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub press_key: Option<String>,
}

impl Default for KnobConfig {
    fn default() -> Self {
        Self {
            ccw_action: no_action(),
            cw_action: no_action(),
            press_action: no_action(),
            ccw_key: None,
            cw_key: None,
            press_key: None,
        }
    }
}

/// One layer of key and knob bindings. Buttons are keyed `"1"`..`"6"`, knobs `"A"` and `"B"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerConfiguration {
    pub id: u32,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub buttons: BTreeMap<String, ButtonConfig>,
    #[serde(default)]
    pub knobs: BTreeMap<String, KnobConfig>,
}

impl LayerConfiguration {
    /// A layer with every button and knob bound to nothing.
    pub fn empty(id: u32) -> Self {
        Self {
            id,
            name: format!("Layer {}", id),
            buttons: (1..=MAX_BUTTONS)
                .map(|n| (n.to_string(), ButtonConfig::default()))
                .collect(),
            knobs: KNOB_IDS
                .iter()
                .map(|k| (k.to_string(), KnobConfig::default()))
                .collect(),
        }
    }

    fn validate(&self) -> Result<()> {
        for key in self.buttons.keys() {
            let in_range = key.parse::<usize>().map(|n| (1..=MAX_BUTTONS).contains(&n)).unwrap_or(false);
            if !in_range {
                return Err(ConfigError::InvalidLayout(format!(
                    "layer {} has unknown button \"{}\"",
                    self.id, key
                )));
            }
        }
        if let Some(key) = self.knobs.keys().find(|k| !KNOB_IDS.contains(&k.as_str())) {
            return Err(ConfigError::InvalidLayout(format!(
                "layer {} has unknown knob \"{}\"",
                self.id, key
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplaySettings {
    pub mode: DisplayMode,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for DisplaySettings {
    fn default() -> Self {
        Self {
            mode: DisplayMode::Layer,
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigLimits {
    pub max_layers: usize,
    pub max_buttons: usize,
    pub max_knobs: usize,
}

impl Default for ConfigLimits {
    fn default() -> Self {
        Self {
            max_layers: 3,
            max_buttons: MAX_BUTTONS,
            max_knobs: MAX_KNOBS,
        }
    }
}

/// The configuration payload exchanged with the device and stored on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayoutDocument {
    #[serde(default = "LayoutDocument::default_version")]
    pub version: String,
    #[serde(default)]
    pub created: String,
    #[serde(default = "LayoutDocument::default_device")]
    pub device: String,
    #[serde(default)]
    pub display: DisplaySettings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_time: Option<String>,
    #[serde(default = "LayoutDocument::default_current_layer")]
    pub current_layer: u32,
    #[serde(default)]
    pub layers: Vec<LayerConfiguration>,
    #[serde(default)]
    pub limits: ConfigLimits,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
}

impl Default for LayoutDocument {
    fn default() -> Self {
        Self::from_layers(vec![LayerConfiguration::empty(1)], DisplaySettings::default(), 1)
    }
}

impl LayoutDocument {
    fn default_version() -> String {
        "1.0".to_string()
    }

    fn default_device() -> String {
        "FeatherS3".to_string()
    }

    fn default_current_layer() -> u32 {
        1
    }

    /// Build a fresh document stamped with the current local time.
    pub fn from_layers(layers: Vec<LayerConfiguration>, display: DisplaySettings, current_layer: u32) -> Self {
        let now = Local::now();
        Self {
            version: Self::default_version(),
            created: now.format("%Y-%m-%d %H:%M:%S").to_string(),
            device: Self::default_device(),
            display,
            system_time: None,
            current_layer,
            limits: ConfigLimits {
                max_layers: layers.len(),
                ..ConfigLimits::default()
            },
            layers,
            last_modified: Some(now.to_rfc3339()),
        }
    }

    /// Parse and check a document received from the device or a file.
    pub fn parse(json: &str) -> Result<Self> {
        let document: Self = serde_json::from_str(json)?;
        document.validate()?;
        Ok(document)
    }

    pub fn validate(&self) -> Result<()> {
        if self.layers.is_empty() {
            return Err(ConfigError::InvalidLayout("no layers defined".to_string()));
        }
        if !self.layers.iter().any(|l| l.id == self.current_layer) {
            return Err(ConfigError::InvalidLayout(format!(
                "current layer {} does not exist",
                self.current_layer
            )));
        }
        self.layers.iter().try_for_each(LayerConfiguration::validate)
    }

    /// Indented JSON, the form the device and the store both expect.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Keep limits and the modification stamp in step with the layer list.
    pub fn touch(&mut self) {
        self.limits.max_layers = self.layers.len();
        self.last_modified = Some(Local::now().to_rfc3339());
    }
}

/// Local copy of the layout kept between sessions.
#[derive(Debug, Clone)]
pub struct LayoutStore {
    path: PathBuf,
}

impl LayoutStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stored document, or the default single layer when the file is missing or unreadable.
    pub async fn load(&self) -> LayoutDocument {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("No layout at {}, using default", self.path.display());
                return LayoutDocument::default();
            }
            Err(e) => {
                log::warn!("Failed to read layout {}: {}", self.path.display(), e);
                return LayoutDocument::default();
            }
        };

        match LayoutDocument::parse(&content) {
            Ok(document) => document,
            Err(e) => {
                log::warn!("Ignoring invalid layout {}: {}", self.path.display(), e);
                LayoutDocument::default()
            }
        }
    }

    /// Write through a `.tmp` sibling and rename it into place, retrying with a linear backoff.
    pub async fn save(&self, document: &LayoutDocument) -> Result<()> {
        let json = document.to_json()?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        let mut attempt = 0;
        loop {
            let result = async {
                tokio::fs::write(&tmp, &json).await?;
                tokio::fs::rename(&tmp, &self.path).await
            }
            .await;

            match result {
                Ok(()) => {
                    log::debug!("Saved layout to {}", self.path.display());
                    return Ok(());
                }
                Err(e) if attempt + 1 < SAVE_ATTEMPTS => {
                    log::warn!("Saving layout failed (attempt {}): {}", attempt + 1, e);
                    attempt += 1;
                    tokio::time::sleep(SAVE_BACKOFF * attempt).await;
                }
                Err(e) => {
                    log::error!("Giving up saving layout to {}: {}", self.path.display(), e);
                    let _ = tokio::fs::remove_file(&tmp).await;
                    return Err(e.into());
                }
            }
        }
    }
}
