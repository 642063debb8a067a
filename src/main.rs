use std::path::PathBuf;

use anyhow::{Result, anyhow, bail};
use log::{error, info, warn};
use tokio::sync::broadcast::error::RecvError;

use gatt_monitor::config::{CONFIG_FILE_NAME, MonitorConfig};
use gatt_monitor::core::bluetooth::{WatcherEvent, format_device_address};
use gatt_monitor::logging;
use gatt_monitor::state::AppState;

fn main() -> Result<()> {
    // Fall back to env_logger only if the event logger cannot be installed
    if logging::EventLogger::init(log::Level::Info).is_err() {
        let _ = env_logger::builder().filter_level(log::LevelFilter::Info).try_init();
    }

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME));

    let rt = tokio::runtime::Runtime::new().map_err(|e| anyhow!("Failed to create Tokio runtime: {}", e))?;
    rt.block_on(run(config_path))
}

async fn run(config_path: PathBuf) -> Result<()> {
    let config = MonitorConfig::load_config(&config_path).await?;
    let state = AppState::new(&config).await?;

    let device_id = match config.device_id.clone() {
        Some(device_id) => device_id,
        None => match discover(&state).await? {
            Some(device_id) => device_id,
            None => {
                state.shutdown().await?;
                return Ok(());
            }
        },
    };

    let result = tokio::time::timeout(
        config.connect_timeout(),
        state.session.connect(
            &device_id,
            &config.service_name,
            &config.characteristic_name,
            config.try_pair,
        ),
    )
    .await;
    let result = match result {
        Ok(result) => result,
        Err(_) => {
            state.shutdown().await?;
            bail!("Connecting to {} timed out after {:?}", device_id, config.connect_timeout());
        }
    };
    if result.has_error {
        state.shutdown().await?;
        bail!(
            "Connecting to {} failed: {}",
            device_id,
            result.error_message.unwrap_or_default()
        );
    }
    info!(
        "Connected to {} ({}), paired: {:?}",
        result.name, result.device_id, result.is_paired
    );
    if let Some(message) = &result.error_message {
        warn!("{}", message);
    }
    match state.session.device_name().await {
        Ok(name) => info!("Device reports name {:?}", name),
        Err(e) => warn!("Could not read device name: {}", e),
    }

    monitor(&state).await;
    state.shutdown().await
}

/// Watches until the first device is added. Returns `None` on Ctrl-C.
async fn discover(state: &AppState) -> Result<Option<String>> {
    let mut events = state.watcher.subscribe();
    state.watcher.start().await?;
    info!("Waiting for devices, press Ctrl-C to quit");

    let found = loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(WatcherEvent::DeviceAdded(device)) => {
                    info!(
                        "Found {:?} at {} ({} dBm)",
                        device.name,
                        format_device_address(device.address),
                        device.signal_strength
                    );
                    break Some(device.id);
                }
                Ok(WatcherEvent::EnumerationCompleted) => info!("Initial enumeration completed"),
                Ok(WatcherEvent::SignalStrengthUpdated(table)) => info!("{} devices in range", table.len()),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => warn!("Skipped {} watcher events", skipped),
                Err(RecvError::Closed) => bail!("Device watcher closed"),
            },
            _ = tokio::signal::ctrl_c() => break None,
        }
    };
    state.watcher.stop();
    Ok(found)
}

/// Logs framed notifications and link changes until Ctrl-C.
async fn monitor(state: &AppState) {
    let mut data = state.session.subscribe_data();
    let mut status = state.session.subscribe_connection_status();
    info!("Streaming notifications, press Ctrl-C to quit");

    loop {
        tokio::select! {
            frame = data.recv() => match frame {
                Ok(frame) => info!("Notification: {:02X?}", frame),
                Err(RecvError::Lagged(skipped)) => warn!("Skipped {} notifications", skipped),
                Err(RecvError::Closed) => break,
            },
            change = status.recv() => match change {
                Ok(change) if !change.is_connected => {
                    warn!("Peripheral disconnected");
                    break;
                }
                Ok(_) => info!("Peripheral reconnected"),
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!("Failed to listen for Ctrl-C: {}", e);
                }
                break;
            }
        }
    }
}
