pub mod layout;
pub mod settings;

pub use layout::{
    ButtonConfig, ConfigLimits, DisplaySettings, KnobConfig, LayerConfiguration, LayoutDocument, LayoutStore,
};
pub use settings::{AppSettings, FlasherSettings, ReleaseSettings, TimingSettings};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML encode error: {0}")]
    TomlEncode(#[from] toml::ser::Error),

    #[error("Invalid layout: {0}")]
    InvalidLayout(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;
