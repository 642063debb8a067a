//! Application state management
//! This module bundles the platform, the session manager and the watcher.

use std::sync::Arc;

use anyhow::Result;
use log::info;

use crate::config::MonitorConfig;
use crate::core::bluetooth::{BlePlatform, DeviceWatcher, PairingHelper, SessionManager};

/// Global application state
pub struct AppState {
    pub platform: Arc<dyn BlePlatform>,
    pub session: SessionManager,
    pub watcher: DeviceWatcher,
    pub pairing: PairingHelper,
}

impl AppState {
    /// Creates the state over an already opened platform.
    pub fn with_platform(platform: Arc<dyn BlePlatform>, config: &MonitorConfig) -> Self {
        let watcher = DeviceWatcher::new(
            platform.clone(),
            config.device_selector,
            config.name_filters.clone(),
            config.signal_strength_interval(),
        );
        Self {
            session: SessionManager::new(platform.clone()),
            pairing: PairingHelper::new(platform.clone()),
            watcher,
            platform,
        }
    }

    /// Opens the system adapter and creates the state over it.
    #[cfg(feature = "bluetooth")]
    pub async fn new(config: &MonitorConfig) -> Result<Self> {
        info!("Opening Bluetooth adapter...");
        let platform = crate::core::bluetooth::BluestPlatform::new().await?;
        Ok(Self::with_platform(Arc::new(platform), config))
    }

    /// Stops discovery and releases the session.
    pub async fn shutdown(&self) -> Result<()> {
        self.watcher.dispose();
        if self.session.device_id().is_some() && !self.session.disconnect(false).await {
            self.session.dispose().await;
        }
        info!("Application state shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bluetooth::mock::MockPlatform;

    #[tokio::test]
    async fn shutdown_without_session_disposes_watcher() {
        let platform = MockPlatform::new();
        let state = AppState::with_platform(platform.clone(), &MonitorConfig::default());
        state.watcher.start().await.unwrap();

        state.shutdown().await.unwrap();
        assert!(!state.watcher.is_running());
        assert_eq!(platform.scanners()[0].stop_calls(), 1);
    }
}
