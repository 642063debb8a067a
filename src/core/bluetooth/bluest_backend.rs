//! `bluest` implementation of the platform seam
//! Wraps the system adapter. bluest streams borrow their owner, so every
//! native event source runs on its own task holding clones of the handles
//! and forwards into the channels the seam hands out.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use bluest::error::ErrorKind as BluestErrorKind;
use bluest::{Adapter, Characteristic, ConnectionEvent, Device, Service};
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::bluetooth::cache::DeviceCache;
use crate::core::bluetooth::constants::{
    AEP_CAN_PAIR, AEP_IS_CONNECTED, AEP_IS_PAIRED, AEP_IS_PRESENT, ASSOCIATION_ENDPOINT_KIND, OUT_OF_RANGE_RSSI,
};
use crate::core::bluetooth::platform::*;
use crate::core::bluetooth::signal::RangeTracker;
use crate::core::bluetooth::types::parse_device_address;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn gatt_status(error: &bluest::Error) -> GattStatus {
    match error.kind() {
        BluestErrorKind::NotConnected | BluestErrorKind::Timeout | BluestErrorKind::ConnectionFailed => {
            GattStatus::Unreachable
        }
        BluestErrorKind::NotAuthorized => GattStatus::AccessDenied,
        _ => GattStatus::ProtocolError,
    }
}

/// Devices seen by the enumerator, the scanner or the connected list, by id.
type SharedDevices = Arc<DeviceCache<Device>>;

/// The system Bluetooth adapter.
pub struct BluestPlatform {
    adapter: Adapter,
    devices: SharedDevices,
}

impl BluestPlatform {
    /// Opens the default adapter and waits until it is powered.
    pub async fn new() -> Result<Self> {
        let adapter = Adapter::default()
            .await
            .ok_or_else(|| anyhow!("No Bluetooth adapter found"))?;
        adapter.wait_available().await?;
        info!("Bluetooth adapter is available.");
        Ok(Self {
            adapter,
            devices: Arc::new(DeviceCache::new()),
        })
    }

    fn wrap(&self, device: Device) -> Arc<dyn BleDevice> {
        Arc::new(BluestDevice {
            adapter: self.adapter.clone(),
            device,
        })
    }

    async fn find_device(&self, matches: impl Fn(&Device) -> bool) -> Option<Device> {
        let cached = self.devices.find(&matches);
        if cached.is_some() {
            return cached;
        }
        match self.adapter.connected_devices().await {
            Ok(connected) => {
                let device = connected.into_iter().find(|d| matches(d))?;
                self.devices.insert(device.id().to_string(), device.clone());
                Some(device)
            }
            Err(e) => {
                error!("Failed to list connected devices: {}", e);
                None
            }
        }
    }
}

#[async_trait]
impl BlePlatform for BluestPlatform {
    async fn device_from_id(&self, id: &str) -> Option<Arc<dyn BleDevice>> {
        let device = self.find_device(|d| d.id().to_string() == id).await?;
        Some(self.wrap(device))
    }

    async fn device_from_address(&self, address: u64) -> Option<Arc<dyn BleDevice>> {
        let device = self
            .find_device(|d| parse_device_address(&d.id().to_string()) == Some(address))
            .await?;
        Some(self.wrap(device))
    }

    fn create_device_enumerator(&self, selector: DeviceSelector) -> Arc<dyn DeviceEnumerator> {
        Arc::new(BluestEnumerator {
            id: WatcherId::next(),
            adapter: self.adapter.clone(),
            devices: self.devices.clone(),
            selector,
            status: Arc::new(Mutex::new(WatcherStatus::Created)),
            cancel_token: CancellationToken::new(),
        })
    }

    fn create_advertisement_scanner(&self, filter: SignalStrengthFilter) -> Arc<dyn AdvertisementScanner> {
        Arc::new(BluestScanner {
            adapter: self.adapter.clone(),
            devices: self.devices.clone(),
            filter,
            status: Arc::new(Mutex::new(WatcherStatus::Created)),
            cancel_token: Mutex::new(CancellationToken::new()),
        })
    }
}

struct BluestDevice {
    adapter: Adapter,
    device: Device,
}

#[async_trait]
impl BleDevice for BluestDevice {
    fn id(&self) -> String {
        self.device.id().to_string()
    }

    fn name(&self) -> String {
        self.device.name().unwrap_or_default()
    }

    async fn is_connected(&self) -> bool {
        self.device.is_connected().await
    }

    async fn connection_status_changed(&self) -> Result<mpsc::UnboundedReceiver<bool>, GattStatus> {
        let (tx, rx) = mpsc::unbounded_channel();
        let adapter = self.adapter.clone();
        let device = self.device.clone();
        tokio::spawn(async move {
            let events = match adapter.device_connection_events(&device).await {
                Ok(events) => events,
                Err(e) => {
                    error!("Failed to watch connection events of {}: {}", device.id(), e);
                    return;
                }
            };
            forward_until_closed(events, tx, |event| matches!(event, ConnectionEvent::Connected)).await;
            debug!("Connection event forwarding for {} ended", device.id());
        });
        Ok(rx)
    }

    async fn services(&self) -> Result<Vec<Arc<dyn GattService>>, GattStatus> {
        if !self.device.is_connected().await {
            info!("Initiating connection to {}...", self.device.id());
            self.adapter.connect_device(&self.device).await.map_err(|e| {
                warn!("Connecting to {} failed: {}", self.device.id(), e);
                gatt_status(&e)
            })?;
        }
        let services = self.device.discover_services().await.map_err(|e| gatt_status(&e))?;
        Ok(services
            .into_iter()
            .map(|service| Arc::new(BluestService { service }) as Arc<dyn GattService>)
            .collect())
    }

    async fn pairing_state(&self) -> PairingState {
        PairingState {
            can_pair: true,
            is_paired: self.device.is_paired().await.unwrap_or(false),
        }
    }

    async fn pair_confirm_only(&self) -> PairingStatus {
        match self.device.pair().await {
            Ok(()) => PairingStatus::Paired,
            Err(e) => {
                warn!("Pairing {} failed: {}", self.device.id(), e);
                PairingStatus::Failed
            }
        }
    }

    async fn unpair(&self) -> PairingStatus {
        if !self.device.is_paired().await.unwrap_or(false) {
            return PairingStatus::AlreadyUnpaired;
        }
        match self.device.unpair().await {
            Ok(()) => PairingStatus::Unpaired,
            Err(e) => {
                warn!("Unpairing {} failed: {}", self.device.id(), e);
                PairingStatus::Failed
            }
        }
    }

    async fn close(&self) {
        if self.device.is_connected().await {
            info!("Disconnecting from device {}", self.device.id());
            if let Err(e) = self.adapter.disconnect_device(&self.device).await {
                warn!("Disconnecting {} failed: {}", self.device.id(), e);
            }
        }
    }
}

struct BluestService {
    service: Service,
}

#[async_trait]
impl GattService for BluestService {
    fn uuid(&self) -> Uuid {
        self.service.uuid()
    }

    async fn request_access(&self) -> AccessStatus {
        AccessStatus::Allowed
    }

    async fn characteristics(&self) -> Result<Vec<Arc<dyn GattCharacteristic>>, GattStatus> {
        let characteristics = self
            .service
            .discover_characteristics()
            .await
            .map_err(|e| gatt_status(&e))?;
        let service = Arc::new(BluestService { service: self.service.clone() });
        Ok(characteristics
            .into_iter()
            .map(|characteristic| {
                Arc::new(BluestCharacteristic {
                    service: service.clone(),
                    characteristic,
                    value_hooks: Arc::new(Mutex::new(Vec::new())),
                    notify_token: Mutex::new(None),
                }) as Arc<dyn GattCharacteristic>
            })
            .collect())
    }

    async fn close(&self) {
        // Handles are released on drop
        debug!("Releasing service {}", self.service.uuid());
    }
}

type ValueHooks = Arc<Mutex<Vec<mpsc::UnboundedSender<Vec<u8>>>>>;

/// bluest has no separate descriptor write: enabling notifications opens the
/// notify stream, which a task fans out to every value hook.
struct BluestCharacteristic {
    service: Arc<BluestService>,
    characteristic: Characteristic,
    value_hooks: ValueHooks,
    notify_token: Mutex<Option<CancellationToken>>,
}

impl BluestCharacteristic {
    async fn enable_notifications(&self) -> GattStatus {
        if lock(&self.notify_token).is_some() {
            return GattStatus::Success;
        }
        let cancel_token = CancellationToken::new();
        let cancel_token_for_task = cancel_token.clone();
        let characteristic = self.characteristic.clone();
        let hooks = self.value_hooks.clone();
        let (ready_tx, ready_rx) = oneshot::channel();

        tokio::spawn(async move {
            let stream = match characteristic.notify().await {
                Ok(stream) => {
                    let _ = ready_tx.send(GattStatus::Success);
                    stream
                }
                Err(e) => {
                    warn!("Subscribing to {} failed: {}", characteristic.uuid(), e);
                    let _ = ready_tx.send(gatt_status(&e));
                    return;
                }
            };
            tokio::pin!(stream);
            loop {
                tokio::select! {
                    value = stream.next() => match value {
                        Some(Ok(value)) => lock(&hooks).retain(|hook| hook.send(value.clone()).is_ok()),
                        Some(Err(e)) => {
                            error!("Notification error on {}: {}", characteristic.uuid(), e);
                            break;
                        }
                        None => break,
                    },
                    _ = cancel_token_for_task.cancelled() => break,
                }
            }
        });

        let status = ready_rx.await.unwrap_or(GattStatus::ProtocolError);
        if status == GattStatus::Success {
            *lock(&self.notify_token) = Some(cancel_token);
        }
        status
    }
}

#[async_trait]
impl GattCharacteristic for BluestCharacteristic {
    fn uuid(&self) -> Uuid {
        self.characteristic.uuid()
    }

    fn service(&self) -> Arc<dyn GattService> {
        self.service.clone()
    }

    async fn properties(&self) -> CharacteristicProperties {
        match self.characteristic.properties().await {
            Ok(p) => CharacteristicProperties {
                read: p.read,
                write: p.write,
                write_without_response: p.write_without_response,
                notify: p.notify,
                indicate: p.indicate,
            },
            Err(e) => {
                warn!("Reading properties of {} failed: {}", self.characteristic.uuid(), e);
                CharacteristicProperties::default()
            }
        }
    }

    async fn descriptors(&self) -> Result<usize, GattStatus> {
        self.characteristic
            .discover_descriptors()
            .await
            .map(|descriptors| descriptors.len())
            .map_err(|e| gatt_status(&e))
    }

    async fn write_client_configuration(&self, value: ClientConfiguration) -> GattStatus {
        match value {
            ClientConfiguration::Notify | ClientConfiguration::Indicate => self.enable_notifications().await,
            ClientConfiguration::None => {
                if let Some(token) = lock(&self.notify_token).take() {
                    token.cancel();
                }
                GattStatus::Success
            }
        }
    }

    async fn value_changed(&self) -> Result<mpsc::UnboundedReceiver<Vec<u8>>, GattStatus> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.value_hooks).push(tx);
        Ok(rx)
    }

    async fn read(&self) -> Result<Vec<u8>, GattStatus> {
        self.characteristic.read().await.map_err(|e| gatt_status(&e))
    }

    async fn write(&self, data: &[u8]) -> GattStatus {
        match self.characteristic.write(data).await {
            Ok(()) => GattStatus::Success,
            Err(e) => gatt_status(&e),
        }
    }
}

/// Enumerates connected devices first, then discovered ones.
struct BluestEnumerator {
    id: WatcherId,
    adapter: Adapter,
    devices: SharedDevices,
    selector: DeviceSelector,
    status: Arc<Mutex<WatcherStatus>>,
    cancel_token: CancellationToken,
}

async fn describe(device: &Device) -> DeviceInformation {
    let is_paired = device.is_paired().await.unwrap_or(false);
    let is_connected = device.is_connected().await;
    DeviceInformation {
        id: device.id().to_string(),
        name: device.name().unwrap_or_default(),
        is_enabled: true,
        is_default: false,
        is_paired,
        kind: ASSOCIATION_ENDPOINT_KIND.to_string(),
        properties: HashMap::from([
            (AEP_CAN_PAIR.to_string(), Value::Bool(!is_paired)),
            (AEP_IS_CONNECTED.to_string(), Value::Bool(is_connected)),
            (AEP_IS_PRESENT.to_string(), Value::Bool(true)),
            (AEP_IS_PAIRED.to_string(), Value::Bool(is_paired)),
        ]),
    }
}

fn selected(selector: DeviceSelector, info: &DeviceInformation) -> bool {
    match selector {
        DeviceSelector::BluetoothLe => true,
        DeviceSelector::BluetoothLePairedOnly => info.is_paired,
        DeviceSelector::BluetoothLeUnpairedOnly => !info.is_paired,
    }
}

impl BluestEnumerator {
    async fn run(
        adapter: Adapter,
        devices: SharedDevices,
        selector: DeviceSelector,
        status: Arc<Mutex<WatcherStatus>>,
        events: mpsc::UnboundedSender<EnumerationEvent>,
        cancel_token: CancellationToken,
    ) -> Result<()> {
        let mut seen = HashSet::new();
        let mut report = |device: Device, info: DeviceInformation| {
            let id = info.id.clone();
            devices.insert(id.clone(), device);
            if selected(selector, &info) && seen.insert(id) {
                let _ = events.send(EnumerationEvent::Added(info));
            }
        };

        for device in adapter.connected_devices().await? {
            let info = describe(&device).await;
            report(device, info);
        }
        *lock(&status) = WatcherStatus::EnumerationCompleted;
        let _ = events.send(EnumerationEvent::EnumerationCompleted);

        let discovered = adapter.discover_devices(&[]).await?;
        tokio::pin!(discovered);
        loop {
            tokio::select! {
                device = discovered.next() => match device {
                    Some(Ok(device)) => {
                        let info = describe(&device).await;
                        report(device, info);
                    }
                    Some(Err(e)) => warn!("Device discovery error: {}", e),
                    None => break,
                },
                _ = cancel_token.cancelled() => break,
            }
        }
        Ok(())
    }
}

#[async_trait]
impl DeviceEnumerator for BluestEnumerator {
    fn id(&self) -> WatcherId {
        self.id
    }

    fn status(&self) -> WatcherStatus {
        *lock(&self.status)
    }

    async fn start(&self) -> Result<mpsc::UnboundedReceiver<EnumerationEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&self.status) = WatcherStatus::Started;

        let adapter = self.adapter.clone();
        let devices = self.devices.clone();
        let selector = self.selector;
        let status = self.status.clone();
        let cancel_token = self.cancel_token.clone();
        tokio::spawn(async move {
            let result = Self::run(adapter, devices, selector, status.clone(), tx.clone(), cancel_token).await;
            let final_status = match result {
                Ok(()) => WatcherStatus::Stopped,
                Err(e) => {
                    error!("Device enumeration failed: {}", e);
                    WatcherStatus::Aborted
                }
            };
            *lock(&status) = final_status;
            let _ = tx.send(EnumerationEvent::Stopped);
        });
        Ok(rx)
    }

    fn stop(&self) {
        *lock(&self.status) = WatcherStatus::Stopping;
        self.cancel_token.cancel();
    }
}

/// Advertisement scanner with the signal strength policy applied in software.
struct BluestScanner {
    adapter: Adapter,
    devices: SharedDevices,
    filter: SignalStrengthFilter,
    status: Arc<Mutex<WatcherStatus>>,
    cancel_token: Mutex<CancellationToken>,
}

impl BluestScanner {
    async fn run(
        adapter: Adapter,
        devices: SharedDevices,
        filter: SignalStrengthFilter,
        samples: mpsc::UnboundedSender<AdvertisementSample>,
        cancel_token: CancellationToken,
    ) -> Result<()> {
        let mut tracker = RangeTracker::new(filter);
        let mut expiry = tokio::time::interval(filter.sampling_interval.max(Duration::from_millis(100)));
        let scan = adapter.scan(&[]).await?;
        tokio::pin!(scan);
        info!("Advertisement scan started");
        loop {
            tokio::select! {
                advertisement = scan.next() => {
                    let Some(advertisement) = advertisement else {
                        info!("Advertisement stream has ended.");
                        break;
                    };
                    let id = advertisement.device.id().to_string();
                    let (Some(address), Some(rssi)) = (parse_device_address(&id), advertisement.rssi) else {
                        continue;
                    };
                    devices.insert(id, advertisement.device);
                    if let Some(sample) = tracker.observe(address, rssi, Instant::now()) {
                        if sample.raw_signal_strength_dbm == OUT_OF_RANGE_RSSI {
                            devices.forget_address(address);
                        }
                        if samples.send(sample).is_err() {
                            break;
                        }
                    }
                }
                _ = expiry.tick() => {
                    for sample in tracker.expire(Instant::now()) {
                        devices.forget_address(sample.address);
                        let _ = samples.send(sample);
                    }
                }
                _ = cancel_token.cancelled() => break,
            }
        }
        Ok(())
    }
}

#[async_trait]
impl AdvertisementScanner for BluestScanner {
    fn status(&self) -> WatcherStatus {
        *lock(&self.status)
    }

    async fn start(&self) -> Result<mpsc::UnboundedReceiver<AdvertisementSample>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel_token = CancellationToken::new();
        *lock(&self.cancel_token) = cancel_token.clone();
        *lock(&self.status) = WatcherStatus::Started;

        let adapter = self.adapter.clone();
        let devices = self.devices.clone();
        let filter = self.filter;
        let status = self.status.clone();
        tokio::spawn(async move {
            let final_status = match Self::run(adapter, devices, filter, tx, cancel_token).await {
                Ok(()) => WatcherStatus::Stopped,
                Err(e) => {
                    error!("Advertisement scan failed: {}", e);
                    WatcherStatus::Aborted
                }
            };
            *lock(&status) = final_status;
        });
        Ok(rx)
    }

    fn stop(&self) {
        *lock(&self.status) = WatcherStatus::Stopping;
        lock(&self.cancel_token).cancel();
    }
}
