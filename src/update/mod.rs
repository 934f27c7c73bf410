pub mod flasher;
pub mod models;
pub mod orchestrator;
pub mod service;
pub mod session;
pub mod version;

pub use flasher::{DryRunFlasher, EspTool, FlashOutput, Flasher};
pub use models::*;
pub use orchestrator::{FirmwareUpdateOrchestrator, ProgressFn, UpdateOptions, UpdateReport};
pub use service::ReleaseLocator;
pub use session::UpdateSession;
pub use version::{check_update, compare_versions, parse_version};

pub const DEFAULT_REPO_OWNER: &str = "Ghost3379";
pub const DEFAULT_REPO_NAME: &str = "PadAwan";
