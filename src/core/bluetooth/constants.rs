//! Constants used throughout the crate
//! This module contains the well-known UUIDs, signal-strength policy values
//! and other fixed configuration of the session manager and device watcher.

use std::time::Duration;
use uuid::Uuid;

/// Standard Bluetooth Service UUIDs
pub const UUID_GENERIC_ACCESS_SERVICE: Uuid = Uuid::from_u128(0x00001800_0000_1000_8000_00805f9b34fb);
pub const UUID_GENERIC_ATTRIBUTE_SERVICE: Uuid = Uuid::from_u128(0x00001801_0000_1000_8000_00805f9b34fb);
pub const UUID_DEVICE_INFORMATION_SERVICE: Uuid = Uuid::from_u128(0x0000180a_0000_1000_8000_00805f9b34fb);
pub const UUID_HEART_RATE_SERVICE: Uuid = Uuid::from_u128(0x0000180d_0000_1000_8000_00805f9b34fb);
pub const UUID_BATTERY_SERVICE: Uuid = Uuid::from_u128(0x0000180f_0000_1000_8000_00805f9b34fb);
pub const UUID_CYCLING_POWER_SERVICE: Uuid = Uuid::from_u128(0x00001818_0000_1000_8000_00805f9b34fb);
pub const UUID_CYCLING_SPEED_AND_CADENCE_SERVICE: Uuid = Uuid::from_u128(0x00001816_0000_1000_8000_00805f9b34fb);
pub const UUID_RUNNING_SPEED_AND_CADENCE_SERVICE: Uuid = Uuid::from_u128(0x00001814_0000_1000_8000_00805f9b34fb);

/// Standard Bluetooth Characteristic UUIDs
pub const UUID_DEVICE_NAME: Uuid = Uuid::from_u128(0x00002a00_0000_1000_8000_00805f9b34fb);
pub const UUID_APPEARANCE: Uuid = Uuid::from_u128(0x00002a01_0000_1000_8000_00805f9b34fb);
pub const UUID_SERVICE_CHANGED: Uuid = Uuid::from_u128(0x00002a05_0000_1000_8000_00805f9b34fb);
pub const UUID_BATTERY_LEVEL: Uuid = Uuid::from_u128(0x00002a19_0000_1000_8000_00805f9b34fb);
pub const UUID_MODEL_NUMBER: Uuid = Uuid::from_u128(0x00002a24_0000_1000_8000_00805f9b34fb);
pub const UUID_SERIAL_NUMBER: Uuid = Uuid::from_u128(0x00002a25_0000_1000_8000_00805f9b34fb);
pub const UUID_FIRMWARE_REVISION: Uuid = Uuid::from_u128(0x00002a26_0000_1000_8000_00805f9b34fb);
pub const UUID_HARDWARE_REVISION: Uuid = Uuid::from_u128(0x00002a27_0000_1000_8000_00805f9b34fb);
pub const UUID_SOFTWARE_REVISION: Uuid = Uuid::from_u128(0x00002a28_0000_1000_8000_00805f9b34fb);
pub const UUID_MANUFACTURER_NAME: Uuid = Uuid::from_u128(0x00002a29_0000_1000_8000_00805f9b34fb);
pub const UUID_HEART_RATE_MEASUREMENT: Uuid = Uuid::from_u128(0x00002a37_0000_1000_8000_00805f9b34fb);
pub const UUID_BODY_SENSOR_LOCATION: Uuid = Uuid::from_u128(0x00002a38_0000_1000_8000_00805f9b34fb);
pub const UUID_HEART_RATE_CONTROL_POINT: Uuid = Uuid::from_u128(0x00002a39_0000_1000_8000_00805f9b34fb);
pub const UUID_CYCLING_POWER_MEASUREMENT: Uuid = Uuid::from_u128(0x00002a63_0000_1000_8000_00805f9b34fb);
pub const UUID_CSC_MEASUREMENT: Uuid = Uuid::from_u128(0x00002a5b_0000_1000_8000_00805f9b34fb);
pub const UUID_RSC_MEASUREMENT: Uuid = Uuid::from_u128(0x00002a53_0000_1000_8000_00805f9b34fb);

/// Service and characteristic holding the peripheral's advertised name
pub const GENERIC_ACCESS_NAME: &str = "GenericAccess";
pub const DEVICE_NAME_CHARACTERISTIC: &str = "DeviceName";

/// Raw signal strength reported for a device that left the in-range window
pub const OUT_OF_RANGE_RSSI: i16 = -127;

/// Signal strength of a device that has not been sampled yet
pub const UNKNOWN_SIGNAL_STRENGTH: i16 = i16::MIN;

/// Number of tracked addresses at which the signal table is reset
pub const SIGNAL_TABLE_CAPACITY: usize = 1000;

/// Advertisement filter: a device must reach this strength to be reported
pub const IN_RANGE_THRESHOLD_DBM: i16 = -80;

/// Advertisement filter: below this strength a device starts leaving range
pub const OUT_OF_RANGE_THRESHOLD_DBM: i16 = -100;

/// Advertisement filter: how long a device may stay silent or weak before
/// it is reported out of range
pub const OUT_OF_RANGE_TIMEOUT: Duration = Duration::from_millis(2000);

/// Default interval of the signal strength broadcast in milliseconds
pub const DEFAULT_SIGNAL_STRENGTH_INTERVAL_MS: u64 = 1000;

/// Capacity of the broadcast channels used for event fan-out
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Additional enumeration properties requested from the device enumerator
pub const AEP_CAN_PAIR: &str = "System.Devices.Aep.CanPair";
pub const AEP_IS_CONNECTED: &str = "System.Devices.Aep.IsConnected";
pub const AEP_IS_PRESENT: &str = "System.Devices.Aep.IsPresent";
pub const AEP_IS_PAIRED: &str = "System.Devices.Aep.IsPaired";

pub const REQUESTED_PROPERTIES: [&str; 4] = [AEP_CAN_PAIR, AEP_IS_CONNECTED, AEP_IS_PRESENT, AEP_IS_PAIRED];

/// Kind reported for devices found by the BLE enumerator
pub const ASSOCIATION_ENDPOINT_KIND: &str = "AssociationEndpoint";
