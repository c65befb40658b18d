/// Control-plane client settings
pub mod client;
/// Monitor configuration files
pub mod monitor;

pub use client::ClientConfig;
pub use monitor::{
    load_from_path, validate_exclusive_condition_types, DefaultCondition, LogMonitorConfig,
    PluginConfig, PluginMonitorConfig,
};
