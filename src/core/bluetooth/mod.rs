//! Bluetooth LE session and discovery
//! This module handles connecting to a peripheral, subscribing to one
//! notifying characteristic, and watching for nearby devices.

mod attributes;
#[cfg(feature = "bluetooth")]
mod bluest_backend;
mod cache;
mod constants;
mod error;
mod manager;
#[cfg(any(test, feature = "mock-bluetooth"))]
pub mod mock;
mod notification;
mod pairing;
mod platform;
mod resolver;
mod scanner;
mod signal;
mod types;

// Re-export types that should be publicly accessible
pub use attributes::{Attribute, AttributeCache, AttributeHandle, characteristic_name, service_name};
#[cfg(feature = "bluetooth")]
pub use bluest_backend::BluestPlatform;
pub use cache::DeviceCache;
pub use constants::*; // Re-export all constants
pub use error::{ErrorKind, GattError, GattResult};
pub use manager::{SessionManager, SessionState};
pub use notification::{NotificationHandler, Subscription, frame_notification};
pub use pairing::PairingHelper;
pub use platform::*;
pub use resolver::{CharacteristicResolver, ResolvedCharacteristic};
pub use scanner::DeviceWatcher;
pub use signal::{RangeTracker, SignalStrengthTable};
pub use types::{
    ConnectionResult, ConnectionStatusChanged, DiscoveredDevice, PairingResult, WatcherEvent, format_device_address,
    parse_device_address,
};
