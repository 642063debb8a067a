//! Signal strength tracking fed by the advertisement scanner.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use log::debug;

use crate::core::bluetooth::constants::{OUT_OF_RANGE_RSSI, SIGNAL_TABLE_CAPACITY, UNKNOWN_SIGNAL_STRENGTH};
use crate::core::bluetooth::platform::{AdvertisementSample, SignalStrengthFilter};

/// Last raw dBm per device address.
///
/// Bounded by a full reset: once it holds `SIGNAL_TABLE_CAPACITY` addresses
/// the next sample clears everything before it is applied.
#[derive(Debug, Default)]
pub struct SignalStrengthTable {
    entries: Mutex<HashMap<u64, i16>>,
}

impl SignalStrengthTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one advertisement sample. A `-127` sample removes a tracked
    /// address and is ignored for an untracked one.
    pub fn record(&self, sample: AdvertisementSample) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if entries.len() >= SIGNAL_TABLE_CAPACITY {
            debug!("Signal strength table reached {} entries, clearing", entries.len());
            entries.clear();
        }
        if sample.raw_signal_strength_dbm == OUT_OF_RANGE_RSSI {
            entries.remove(&sample.address);
        } else {
            entries.insert(sample.address, sample.raw_signal_strength_dbm);
        }
    }

    /// Last strength for `address`, or `UNKNOWN_SIGNAL_STRENGTH`.
    pub fn get(&self, address: u64) -> i16 {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&address)
            .copied()
            .unwrap_or(UNKNOWN_SIGNAL_STRENGTH)
    }

    pub fn snapshot(&self) -> HashMap<u64, i16> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy)]
struct RangeEntry {
    last_heard: Instant,
    last_reported: Instant,
    weak_since: Option<Instant>,
}

/// Applies a [`SignalStrengthFilter`] to raw advertisements for backends
/// whose scanner has no native filter.
///
/// A device is reported once it reaches the in-range threshold, then at most
/// once per sampling interval. When it stays below the out-of-range
/// threshold, or stays silent, for the out-of-range timeout, a single `-127`
/// sample is produced and the device is forgotten.
#[derive(Debug)]
pub struct RangeTracker {
    filter: SignalStrengthFilter,
    in_range: HashMap<u64, RangeEntry>,
}

impl RangeTracker {
    pub fn new(filter: SignalStrengthFilter) -> Self {
        Self {
            filter,
            in_range: HashMap::new(),
        }
    }

    /// Feeds one raw advertisement. Returns the sample to publish, if any.
    pub fn observe(&mut self, address: u64, rssi: i16, now: Instant) -> Option<AdvertisementSample> {
        let filter = self.filter;
        match self.in_range.get_mut(&address) {
            None => {
                if rssi < filter.in_range_threshold_dbm {
                    return None;
                }
                self.in_range.insert(
                    address,
                    RangeEntry {
                        last_heard: now,
                        last_reported: now,
                        weak_since: None,
                    },
                );
                Some(AdvertisementSample { address, raw_signal_strength_dbm: rssi })
            }
            Some(entry) => {
                entry.last_heard = now;
                if rssi < filter.out_of_range_threshold_dbm {
                    let weak_since = *entry.weak_since.get_or_insert(now);
                    if now.duration_since(weak_since) >= filter.out_of_range_timeout {
                        self.in_range.remove(&address);
                        return Some(AdvertisementSample {
                            address,
                            raw_signal_strength_dbm: OUT_OF_RANGE_RSSI,
                        });
                    }
                } else {
                    entry.weak_since = None;
                }
                if now.duration_since(entry.last_reported) < filter.sampling_interval {
                    return None;
                }
                entry.last_reported = now;
                Some(AdvertisementSample { address, raw_signal_strength_dbm: rssi })
            }
        }
    }

    /// Reports devices that went silent for longer than the timeout.
    pub fn expire(&mut self, now: Instant) -> Vec<AdvertisementSample> {
        let timeout = self.filter.out_of_range_timeout;
        let expired: Vec<u64> = self
            .in_range
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.last_heard) >= timeout)
            .map(|(address, _)| *address)
            .collect();
        expired
            .into_iter()
            .map(|address| {
                self.in_range.remove(&address);
                AdvertisementSample { address, raw_signal_strength_dbm: OUT_OF_RANGE_RSSI }
            })
            .collect()
    }
}
