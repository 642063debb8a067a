use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::core::bluetooth::{DEFAULT_SIGNAL_STRENGTH_INTERVAL_MS, DeviceSelector};
use crate::utils::ensure_directory_exists;

pub const CONFIG_FILE_NAME: &str = "gatt_monitor.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Which devices the watcher enumerates.
    pub device_selector: DeviceSelector,

    /// Exact device names to accept. `None` accepts every device.
    pub name_filters: Option<Vec<String>>,

    /// Service to open, by attribute name (e.g. `HeartRate`).
    pub service_name: String,

    /// Characteristic to subscribe to, by attribute name.
    pub characteristic_name: String,

    /// Pair after subscribing when the device allows it.
    pub try_pair: bool,

    /// Period of the signal strength snapshot, in milliseconds.
    pub signal_strength_interval_ms: u64,

    /// How long the runner waits for a connect before giving up.
    pub connect_timeout_secs: u64,

    /// Device to connect to. The first discovered device is used when unset.
    pub device_id: Option<String>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig {
            device_selector: DeviceSelector::BluetoothLe,
            name_filters: None,
            service_name: "HeartRate".to_string(),
            characteristic_name: "HeartRateMeasurement".to_string(),
            try_pair: false,
            signal_strength_interval_ms: DEFAULT_SIGNAL_STRENGTH_INTERVAL_MS,
            connect_timeout_secs: 10,
            device_id: None,
        }
    }
}

impl MonitorConfig {
    pub fn signal_strength_interval(&self) -> Duration {
        Duration::from_millis(self.signal_strength_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Loads the config from a configuration file.
    pub async fn load_config(file_path: &Path) -> Result<Self> {
        if !file_path.exists() {
            warn!("Config file not found at {:?}, using default.", file_path);
            return Ok(Self::default());
        }

        let config_json = fs::read_to_string(file_path).await?;
        let config: Self = serde_json::from_str(&config_json)?;

        info!("Config loaded from {:?}", file_path);
        Ok(config)
    }

    /// Saves the current config to a configuration file.
    pub async fn save_config(&self, file_path: &Path) -> Result<()> {
        if let Some(config_dir) = file_path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            ensure_directory_exists(config_dir).await?;
        }

        let config_json = match serde_json::to_string_pretty(&self) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize monitor config to JSON: {}", e);
                return Err(e.into());
            }
        };

        fs::write(file_path, config_json).await?;

        info!("Monitor config saved to {:?}.", file_path);
        Ok(())
    }
}
