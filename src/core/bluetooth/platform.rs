//! Platform seam for the Bluetooth stack.
//!
//! Everything the session manager and the device watcher need from the OS is
//! expressed here: device handle acquisition, GATT enumeration (always
//! uncached), client configuration writes, pairing, and the two native
//! watchers. Native events are delivered through `mpsc` receivers which the
//! callers drain on their own tasks, so they must be treated as concurrent
//! with everything else.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::core::bluetooth::constants::{
    IN_RANGE_THRESHOLD_DBM, OUT_OF_RANGE_THRESHOLD_DBM, OUT_OF_RANGE_TIMEOUT,
};

/// Outcome of a GATT round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GattStatus {
    Success,
    Unreachable,
    ProtocolError,
    AccessDenied,
}

impl fmt::Display for GattStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Success => "Success",
            Self::Unreachable => "Unreachable",
            Self::ProtocolError => "ProtocolError",
            Self::AccessDenied => "AccessDenied",
        };
        f.write_str(name)
    }
}

/// Result of asking for access to a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessStatus {
    Allowed,
    DeniedByUser,
    DeniedBySystem,
    Unspecified,
}

/// Value written to a characteristic's client configuration descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientConfiguration {
    None,
    Notify,
    Indicate,
}

/// Capabilities advertised by a characteristic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CharacteristicProperties {
    pub read: bool,
    pub write: bool,
    pub write_without_response: bool,
    pub notify: bool,
    pub indicate: bool,
}

/// Pairing state of a device as reported by the platform.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PairingState {
    pub can_pair: bool,
    pub is_paired: bool,
}

/// Outcome of a pairing or unpairing request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PairingStatus {
    Paired,
    AlreadyPaired,
    Unpaired,
    AlreadyUnpaired,
    NotReadyToPair,
    RejectedByHandler,
    Failed,
}

impl fmt::Display for PairingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Which devices the enumerator reports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, serde::Deserialize)]
pub enum DeviceSelector {
    #[default]
    BluetoothLe,
    BluetoothLePairedOnly,
    BluetoothLeUnpairedOnly,
}

/// Signal strength policy handed to the advertisement scanner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalStrengthFilter {
    pub sampling_interval: Duration,
    pub in_range_threshold_dbm: i16,
    pub out_of_range_threshold_dbm: i16,
    pub out_of_range_timeout: Duration,
}

impl SignalStrengthFilter {
    /// The watcher's fixed policy with a caller-chosen sampling interval.
    pub fn with_sampling_interval(sampling_interval: Duration) -> Self {
        Self {
            sampling_interval,
            in_range_threshold_dbm: IN_RANGE_THRESHOLD_DBM,
            out_of_range_threshold_dbm: OUT_OF_RANGE_THRESHOLD_DBM,
            out_of_range_timeout: OUT_OF_RANGE_TIMEOUT,
        }
    }
}

/// Identity of a native enumerator instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatcherId(u64);

impl WatcherId {
    /// Allocates an identity no other enumerator in this process holds.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Lifecycle of a native watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherStatus {
    Created,
    Started,
    EnumerationCompleted,
    Stopping,
    Stopped,
    Aborted,
}

impl WatcherStatus {
    pub fn is_stopped_or_stopping(self) -> bool {
        matches!(self, Self::Stopped | Self::Stopping)
    }
}

/// Full description of an enumerated device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceInformation {
    pub id: String,
    pub name: String,
    pub is_enabled: bool,
    pub is_default: bool,
    pub is_paired: bool,
    pub kind: String,
    pub properties: HashMap<String, serde_json::Value>,
}

/// Partial description delivered with update and removal notifications.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceInformationUpdate {
    pub id: String,
    pub kind: String,
    pub properties: HashMap<String, serde_json::Value>,
}

/// Notifications from the device enumerator.
#[derive(Debug, Clone, PartialEq)]
pub enum EnumerationEvent {
    Added(DeviceInformation),
    Updated(DeviceInformationUpdate),
    Removed(DeviceInformationUpdate),
    EnumerationCompleted,
    Stopped,
}

/// One received advertisement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdvertisementSample {
    pub address: u64,
    pub raw_signal_strength_dbm: i16,
}

/// A GATT service handle.
#[async_trait]
pub trait GattService: Send + Sync {
    fn uuid(&self) -> Uuid;

    async fn request_access(&self) -> AccessStatus;

    /// Child characteristics, bypassing any platform cache.
    async fn characteristics(&self) -> Result<Vec<Arc<dyn GattCharacteristic>>, GattStatus>;

    /// Releases the native handle. Further calls on it may fail.
    async fn close(&self);
}

/// A GATT characteristic handle.
#[async_trait]
pub trait GattCharacteristic: Send + Sync {
    fn uuid(&self) -> Uuid;

    /// The service this characteristic belongs to.
    fn service(&self) -> Arc<dyn GattService>;

    /// Free-form description from the user description descriptor, if any.
    fn user_description(&self) -> Option<String> {
        None
    }

    async fn properties(&self) -> CharacteristicProperties;

    /// Number of descriptors, bypassing any platform cache.
    async fn descriptors(&self) -> Result<usize, GattStatus>;

    async fn write_client_configuration(&self, value: ClientConfiguration) -> GattStatus;

    /// Opens the value-changed channel. Each call yields an independent
    /// receiver; dropping it unhooks the callback.
    async fn value_changed(&self) -> Result<mpsc::UnboundedReceiver<Vec<u8>>, GattStatus>;

    async fn read(&self) -> Result<Vec<u8>, GattStatus>;

    async fn write(&self, data: &[u8]) -> GattStatus;
}

/// A device handle.
#[async_trait]
pub trait BleDevice: Send + Sync {
    fn id(&self) -> String;

    fn name(&self) -> String;

    /// Point-in-time connection status.
    async fn is_connected(&self) -> bool;

    /// Connection status changes; `true` means connected.
    async fn connection_status_changed(&self) -> Result<mpsc::UnboundedReceiver<bool>, GattStatus>;

    /// All services, bypassing any platform cache.
    async fn services(&self) -> Result<Vec<Arc<dyn GattService>>, GattStatus>;

    async fn pairing_state(&self) -> PairingState;

    /// Pairing handshake that accepts the platform's confirmation prompt.
    async fn pair_confirm_only(&self) -> PairingStatus;

    async fn unpair(&self) -> PairingStatus;

    /// Releases the native handle.
    async fn close(&self);
}

/// The generic device enumerator.
#[async_trait]
pub trait DeviceEnumerator: Send + Sync {
    fn id(&self) -> WatcherId;

    fn status(&self) -> WatcherStatus;

    async fn start(&self) -> anyhow::Result<mpsc::UnboundedReceiver<EnumerationEvent>>;

    fn stop(&self);
}

/// The BLE advertisement scanner.
#[async_trait]
pub trait AdvertisementScanner: Send + Sync {
    fn status(&self) -> WatcherStatus;

    async fn start(&self) -> anyhow::Result<mpsc::UnboundedReceiver<AdvertisementSample>>;

    fn stop(&self);
}

/// Entry point to the platform's Bluetooth LE stack.
#[async_trait]
pub trait BlePlatform: Send + Sync {
    async fn device_from_id(&self, id: &str) -> Option<Arc<dyn BleDevice>>;

    async fn device_from_address(&self, address: u64) -> Option<Arc<dyn BleDevice>>;

    fn create_device_enumerator(&self, selector: DeviceSelector) -> Arc<dyn DeviceEnumerator>;

    fn create_advertisement_scanner(&self, filter: SignalStrengthFilter) -> Arc<dyn AdvertisementScanner>;
}

/// Pumps a native event stream into a seam channel. Returns when the stream
/// ends or the receiving side is dropped, whichever comes first.
pub async fn forward_until_closed<S, T>(stream: S, tx: mpsc::UnboundedSender<T>, map: impl Fn(S::Item) -> T)
where
    S: Stream,
{
    tokio::pin!(stream);
    loop {
        tokio::select! {
            item = stream.next() => {
                let Some(item) = item else { break };
                if tx.send(map(item)).is_err() {
                    break;
                }
            }
            _ = tx.closed() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn forwarder_exits_when_receiver_is_dropped() {
        let (tx, rx) = mpsc::unbounded_channel::<bool>();
        let forwarder = tokio::spawn(forward_until_closed(futures_util::stream::pending::<u8>(), tx, |_| true));

        drop(rx);
        tokio::time::timeout(Duration::from_secs(1), forwarder)
            .await
            .expect("forwarder still parked")
            .unwrap();
    }

    #[tokio::test]
    async fn forwarder_maps_until_stream_ends() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        forward_until_closed(futures_util::stream::iter([1u8, 0, 1]), tx, |v| v == 1).await;

        assert_eq!(rx.recv().await, Some(true));
        assert_eq!(rx.recv().await, Some(false));
        assert_eq!(rx.recv().await, Some(true));
        assert_eq!(rx.recv().await, None);
    }
}
