//! Device handle cache shared by the native watchers.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use log::debug;

use crate::core::bluetooth::constants::SIGNAL_TABLE_CAPACITY;
use crate::core::bluetooth::types::parse_device_address;

/// Native device handles by device id.
///
/// Follows the signal strength table's bound: inserting a new id into a cache
/// of `SIGNAL_TABLE_CAPACITY` entries clears it first. Devices that go out of
/// range are dropped by address.
#[derive(Debug)]
pub struct DeviceCache<D> {
    entries: Mutex<HashMap<String, D>>,
}

impl<D> Default for DeviceCache<D> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<D: Clone> DeviceCache<D> {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, D>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn insert(&self, id: String, device: D) {
        let mut entries = self.entries();
        if !entries.contains_key(&id) && entries.len() >= SIGNAL_TABLE_CAPACITY {
            debug!("Device cache reached {} entries, clearing", entries.len());
            entries.clear();
        }
        entries.insert(id, device);
    }

    /// Drops every device whose id carries `address`.
    pub fn forget_address(&self, address: u64) {
        self.entries().retain(|id, _| parse_device_address(id) != Some(address));
    }

    pub fn find(&self, matches: impl Fn(&D) -> bool) -> Option<D> {
        self.entries().values().find(|d| matches(d)).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bluetooth::types::format_device_address;

    fn id(address: u64) -> String {
        format!("BluetoothLE#BluetoothLE00:11:22:33:44:55-{}", format_device_address(address).to_lowercase())
    }

    #[test]
    fn out_of_range_device_is_forgotten() {
        let cache = DeviceCache::new();
        cache.insert(id(0xAABBCCDDEEFF), "hrm");
        cache.insert(id(0x112233445566), "watch");

        cache.forget_address(0xAABBCCDDEEFF);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.find(|d| *d == "hrm"), None);
        assert_eq!(cache.find(|d| *d == "watch"), Some("watch"));
    }

    #[test]
    fn rotating_addresses_never_exceed_capacity() {
        let cache = DeviceCache::new();
        for address in 0..(SIGNAL_TABLE_CAPACITY as u64 * 3) {
            cache.insert(id(address), address);
            assert!(cache.len() <= SIGNAL_TABLE_CAPACITY);
        }
    }

    #[test]
    fn known_id_replaces_without_clearing() {
        let cache = DeviceCache::new();
        for address in 0..SIGNAL_TABLE_CAPACITY as u64 {
            cache.insert(id(address), address);
        }
        cache.insert(id(0), 42);
        assert_eq!(cache.len(), SIGNAL_TABLE_CAPACITY);
        assert_eq!(cache.find(|d| *d == 42), Some(42));

        cache.insert(id(SIGNAL_TABLE_CAPACITY as u64), 7);
        assert_eq!(cache.len(), 1);
    }
}
