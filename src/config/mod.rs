pub mod monitor_config;

pub use monitor_config::{CONFIG_FILE_NAME, MonitorConfig};
