//! Defines shared data structures for the Bluetooth module.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::core::bluetooth::constants::{AEP_IS_CONNECTED, UNKNOWN_SIGNAL_STRENGTH};
use crate::core::bluetooth::error::{ErrorKind, GattError};
use crate::core::bluetooth::platform::{DeviceInformation, DeviceInformationUpdate, PairingStatus};

static TRAILING_MAC: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([0-9A-Fa-f]{2}[:_-]){5}[0-9A-Fa-f]{2}$").expect("MAC pattern is valid")
});

/// Parses the 48-bit address from the MAC-formatted suffix of a platform
/// device id, e.g. `BluetoothLE#BluetoothLE11:22:33:44:55:66-aa:bb:cc:dd:ee:ff`
/// yields `0xAABBCCDDEEFF`. Returns `None` when the id does not end in a MAC.
pub fn parse_device_address(device_id: &str) -> Option<u64> {
    let mac = TRAILING_MAC.find(device_id)?.as_str();
    let hex: String = mac.chars().filter(char::is_ascii_hexdigit).collect();
    u64::from_str_radix(&hex, 16).ok()
}

/// Formats an address as `AA:BB:CC:DD:EE:FF`.
pub fn format_device_address(address: u64) -> String {
    let bytes = address.to_be_bytes();
    bytes[2..]
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}

/// Reads the connected flag out of an enumeration property bag.
pub fn is_connected_property(properties: &HashMap<String, serde_json::Value>) -> bool {
    properties
        .get(AEP_IS_CONNECTED)
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false)
}

/// Represents a discovered Bluetooth device
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiscoveredDevice {
    /// Platform-specific unique identifier for the device
    pub id: String,
    /// 48-bit address parsed from the id
    pub address: u64,
    pub is_enabled: bool,
    pub is_default: bool,
    /// The name of the device, empty when unknown
    pub name: String,
    /// Whether the device is paired
    pub is_paired: bool,
    /// Whether the device is connected
    pub is_connected: bool,
    pub kind: String,
    /// Opaque enumeration properties
    pub properties: HashMap<String, serde_json::Value>,
    /// Last sampled signal strength, `UNKNOWN_SIGNAL_STRENGTH` if never seen
    pub signal_strength: i16,
}

impl DiscoveredDevice {
    /// Builds the snapshot for a freshly enumerated device.
    pub fn from_information(info: &DeviceInformation, address: u64, signal_strength: i16) -> Self {
        Self {
            id: info.id.clone(),
            address,
            is_enabled: info.is_enabled,
            is_default: info.is_default,
            name: info.name.clone(),
            is_paired: info.is_paired,
            is_connected: is_connected_property(&info.properties),
            kind: info.kind.clone(),
            properties: info.properties.clone(),
            signal_strength,
        }
    }

    /// Builds the partial snapshot carried by update and removal events.
    pub fn from_update(update: &DeviceInformationUpdate) -> Self {
        Self {
            id: update.id.clone(),
            address: 0,
            is_enabled: false,
            is_default: false,
            name: String::new(),
            is_paired: false,
            is_connected: is_connected_property(&update.properties),
            kind: update.kind.clone(),
            properties: update.properties.clone(),
            signal_strength: UNKNOWN_SIGNAL_STRENGTH,
        }
    }
}

/// Events published by the device watcher
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum WatcherEvent {
    DeviceAdded(DiscoveredDevice),
    DeviceUpdated(DiscoveredDevice),
    DeviceRemoved(DiscoveredDevice),
    EnumerationCompleted,
    EnumerationStopped,
    /// Snapshot of the whole signal strength table
    SignalStrengthUpdated(HashMap<u64, i16>),
}

/// Outcome of a connect attempt
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConnectionResult {
    pub device_id: String,
    pub name: String,
    pub is_connected: bool,
    pub is_paired: Option<bool>,
    pub has_error: bool,
    pub error_message: Option<String>,
    pub error_kind: Option<ErrorKind>,
}

impl ConnectionResult {
    pub fn failure(device_id: &str, error: &GattError) -> Self {
        Self {
            device_id: device_id.to_string(),
            has_error: true,
            error_message: Some(error.to_string()),
            error_kind: Some(error.kind()),
            ..Default::default()
        }
    }
}

/// Published whenever the platform reports a connection status change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConnectionStatusChanged {
    pub is_connected: bool,
}

/// Outcome of a pairing helper call
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PairingResult {
    pub status: String,
}

impl From<PairingStatus> for PairingResult {
    fn from(status: PairingStatus) -> Self {
        Self { status: status.to_string() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_trailing_mac() {
        let id = "BluetoothLE#BluetoothLE11:22:33:44:55:66-aa:bb:cc:dd:ee:ff";
        assert_eq!(parse_device_address(id), Some(0xAABBCCDDEEFF));
    }

    #[test]
    fn parses_bluez_style_path() {
        assert_eq!(parse_device_address("hci0/dev_01_23_45_67_89_AB"), Some(0x0123456789AB));
    }

    #[test]
    fn rejects_ids_without_mac_suffix() {
        assert_eq!(parse_device_address("BluetoothLE#BluetoothLE"), None);
        assert_eq!(parse_device_address("aa:bb:cc:dd:ee:ff-extra"), None);
        assert_eq!(parse_device_address(""), None);
    }

    #[test]
    fn formats_address() {
        assert_eq!(format_device_address(0xAABBCCDDEEFF), "AA:BB:CC:DD:EE:FF");
        assert_eq!(format_device_address(0x1), "00:00:00:00:00:01");
    }

    #[test]
    fn failure_result_carries_kind_and_message() {
        let result = ConnectionResult::failure("dev", &GattError::ServiceNotFound("HeartRate".into()));
        assert!(result.has_error);
        assert!(!result.is_connected);
        assert_eq!(result.error_kind, Some(ErrorKind::ServiceNotFound));
        assert_eq!(result.error_message.as_deref(), Some("Cannot find HeartRate service"));
    }
}
