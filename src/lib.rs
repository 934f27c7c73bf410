pub mod commands;
pub mod config;
pub mod device;
pub mod serial;
pub mod update;
