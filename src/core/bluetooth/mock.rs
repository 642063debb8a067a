//! In-memory Bluetooth platform
//! Devices, services and watchers are scripted by the caller, which makes the
//! session manager and the device watcher testable without an adapter.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::core::bluetooth::platform::*;
use crate::core::bluetooth::types::parse_device_address;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Scripted characteristic
pub struct MockCharacteristic {
    uuid: Uuid,
    service: Weak<MockService>,
    properties: CharacteristicProperties,
    descriptor_status: Mutex<GattStatus>,
    config_write_status: Mutex<GattStatus>,
    config_writes: Mutex<Vec<ClientConfiguration>>,
    value_hooks: Mutex<Vec<mpsc::UnboundedSender<Vec<u8>>>>,
    value: Mutex<Vec<u8>>,
    written: Mutex<Vec<Vec<u8>>>,
}

impl MockCharacteristic {
    pub fn set_descriptor_status(&self, status: GattStatus) {
        *lock(&self.descriptor_status) = status;
    }

    pub fn set_config_write_status(&self, status: GattStatus) {
        *lock(&self.config_write_status) = status;
    }

    pub fn config_writes(&self) -> Vec<ClientConfiguration> {
        lock(&self.config_writes).clone()
    }

    pub fn set_value(&self, value: &[u8]) {
        *lock(&self.value) = value.to_vec();
    }

    pub fn written(&self) -> Vec<Vec<u8>> {
        lock(&self.written).clone()
    }

    /// Delivers a value update to every live hook.
    pub fn push_value(&self, value: &[u8]) {
        lock(&self.value_hooks).retain(|hook| hook.send(value.to_vec()).is_ok());
    }

    pub fn live_value_hooks(&self) -> usize {
        lock(&self.value_hooks).iter().filter(|hook| !hook.is_closed()).count()
    }
}

#[async_trait]
impl GattCharacteristic for MockCharacteristic {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    fn service(&self) -> Arc<dyn GattService> {
        self.service.upgrade().expect("mock service outlives its characteristics")
    }

    async fn properties(&self) -> CharacteristicProperties {
        self.properties
    }

    async fn descriptors(&self) -> Result<usize, GattStatus> {
        match *lock(&self.descriptor_status) {
            GattStatus::Success => Ok(1),
            status => Err(status),
        }
    }

    async fn write_client_configuration(&self, value: ClientConfiguration) -> GattStatus {
        lock(&self.config_writes).push(value);
        *lock(&self.config_write_status)
    }

    async fn value_changed(&self) -> Result<mpsc::UnboundedReceiver<Vec<u8>>, GattStatus> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.value_hooks).push(tx);
        Ok(rx)
    }

    async fn read(&self) -> Result<Vec<u8>, GattStatus> {
        Ok(lock(&self.value).clone())
    }

    async fn write(&self, data: &[u8]) -> GattStatus {
        lock(&self.written).push(data.to_vec());
        GattStatus::Success
    }
}

/// Scripted service
pub struct MockService {
    uuid: Uuid,
    access: Mutex<AccessStatus>,
    characteristics_status: Mutex<GattStatus>,
    characteristics: Mutex<Vec<Arc<MockCharacteristic>>>,
    close_count: AtomicUsize,
}

impl MockService {
    pub fn new(uuid: Uuid) -> Arc<Self> {
        Arc::new(Self {
            uuid,
            access: Mutex::new(AccessStatus::Allowed),
            characteristics_status: Mutex::new(GattStatus::Success),
            characteristics: Mutex::new(Vec::new()),
            close_count: AtomicUsize::new(0),
        })
    }

    pub fn add_characteristic(self: &Arc<Self>, uuid: Uuid, properties: CharacteristicProperties) -> Arc<MockCharacteristic> {
        let characteristic = Arc::new(MockCharacteristic {
            uuid,
            service: Arc::downgrade(self),
            properties,
            descriptor_status: Mutex::new(GattStatus::Success),
            config_write_status: Mutex::new(GattStatus::Success),
            config_writes: Mutex::new(Vec::new()),
            value_hooks: Mutex::new(Vec::new()),
            value: Mutex::new(Vec::new()),
            written: Mutex::new(Vec::new()),
        });
        lock(&self.characteristics).push(characteristic.clone());
        characteristic
    }

    pub fn add_notify_characteristic(self: &Arc<Self>, uuid: Uuid) -> Arc<MockCharacteristic> {
        let properties = CharacteristicProperties {
            read: true,
            notify: true,
            ..Default::default()
        };
        self.add_characteristic(uuid, properties)
    }

    pub fn set_access(&self, access: AccessStatus) {
        *lock(&self.access) = access;
    }

    pub fn set_characteristics_status(&self, status: GattStatus) {
        *lock(&self.characteristics_status) = status;
    }

    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GattService for MockService {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    async fn request_access(&self) -> AccessStatus {
        *lock(&self.access)
    }

    async fn characteristics(&self) -> Result<Vec<Arc<dyn GattCharacteristic>>, GattStatus> {
        match *lock(&self.characteristics_status) {
            GattStatus::Success => Ok(lock(&self.characteristics)
                .iter()
                .map(|c| c.clone() as Arc<dyn GattCharacteristic>)
                .collect()),
            status => Err(status),
        }
    }

    async fn close(&self) {
        self.close_count.fetch_add(1, Ordering::SeqCst);
    }
}

/// Scripted device
pub struct MockDevice {
    id: String,
    name: String,
    connected: AtomicBool,
    services_status: Mutex<GattStatus>,
    services: Mutex<Vec<Arc<MockService>>>,
    pairing: Mutex<PairingState>,
    /// Forced outcome of the next pair requests.
    pair_outcome: Mutex<Option<PairingStatus>>,
    pair_calls: AtomicUsize,
    status_hooks: Mutex<Vec<mpsc::UnboundedSender<bool>>>,
    status_registrations: AtomicUsize,
    close_count: AtomicUsize,
}

impl MockDevice {
    pub fn new(id: &str, name: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            name: name.to_string(),
            connected: AtomicBool::new(true),
            services_status: Mutex::new(GattStatus::Success),
            services: Mutex::new(Vec::new()),
            pairing: Mutex::new(PairingState { can_pair: true, is_paired: false }),
            pair_outcome: Mutex::new(None),
            pair_calls: AtomicUsize::new(0),
            status_hooks: Mutex::new(Vec::new()),
            status_registrations: AtomicUsize::new(0),
            close_count: AtomicUsize::new(0),
        })
    }

    pub fn add_service(&self, uuid: Uuid) -> Arc<MockService> {
        let service = MockService::new(uuid);
        lock(&self.services).push(service.clone());
        service
    }

    pub fn set_services_status(&self, status: GattStatus) {
        *lock(&self.services_status) = status;
    }

    pub fn set_pairing(&self, pairing: PairingState) {
        *lock(&self.pairing) = pairing;
    }

    pub fn set_pair_outcome(&self, status: PairingStatus) {
        *lock(&self.pair_outcome) = Some(status);
    }

    pub fn pair_calls(&self) -> usize {
        self.pair_calls.load(Ordering::SeqCst)
    }

    /// Changes the link state and notifies every registered status hook.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
        lock(&self.status_hooks).retain(|hook| hook.send(connected).is_ok());
    }

    pub fn status_registrations(&self) -> usize {
        self.status_registrations.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BleDevice for MockDevice {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn connection_status_changed(&self) -> Result<mpsc::UnboundedReceiver<bool>, GattStatus> {
        self.status_registrations.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.status_hooks).push(tx);
        Ok(rx)
    }

    async fn services(&self) -> Result<Vec<Arc<dyn GattService>>, GattStatus> {
        match *lock(&self.services_status) {
            GattStatus::Success => Ok(lock(&self.services)
                .iter()
                .map(|s| s.clone() as Arc<dyn GattService>)
                .collect()),
            status => Err(status),
        }
    }

    async fn pairing_state(&self) -> PairingState {
        *lock(&self.pairing)
    }

    async fn pair_confirm_only(&self) -> PairingStatus {
        self.pair_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(status) = *lock(&self.pair_outcome) {
            return status;
        }
        let mut pairing = lock(&self.pairing);
        if pairing.is_paired {
            return PairingStatus::AlreadyPaired;
        }
        if !pairing.can_pair {
            return PairingStatus::NotReadyToPair;
        }
        pairing.is_paired = true;
        PairingStatus::Paired
    }

    async fn unpair(&self) -> PairingStatus {
        let mut pairing = lock(&self.pairing);
        if !pairing.is_paired {
            return PairingStatus::AlreadyUnpaired;
        }
        pairing.is_paired = false;
        PairingStatus::Unpaired
    }

    async fn close(&self) {
        self.close_count.fetch_add(1, Ordering::SeqCst);
    }
}

/// Scripted device enumerator
pub struct MockEnumerator {
    id: WatcherId,
    status: Mutex<WatcherStatus>,
    events: Mutex<Option<mpsc::UnboundedSender<EnumerationEvent>>>,
    stop_calls: AtomicUsize,
}

impl MockEnumerator {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            id: WatcherId::next(),
            status: Mutex::new(WatcherStatus::Created),
            events: Mutex::new(None),
            stop_calls: AtomicUsize::new(0),
        })
    }

    /// Delivers an event as the native watcher would.
    pub fn emit(&self, event: EnumerationEvent) {
        if let Some(events) = lock(&self.events).as_ref() {
            let _ = events.send(event);
        }
    }

    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }

    pub fn set_status(&self, status: WatcherStatus) {
        *lock(&self.status) = status;
    }
}

#[async_trait]
impl DeviceEnumerator for MockEnumerator {
    fn id(&self) -> WatcherId {
        self.id
    }

    fn status(&self) -> WatcherStatus {
        *lock(&self.status)
    }

    async fn start(&self) -> Result<mpsc::UnboundedReceiver<EnumerationEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&self.events) = Some(tx);
        *lock(&self.status) = WatcherStatus::Started;
        Ok(rx)
    }

    fn stop(&self) {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        *lock(&self.status) = WatcherStatus::Stopped;
        self.emit(EnumerationEvent::Stopped);
    }
}

/// Scripted advertisement scanner
pub struct MockScanner {
    filter: SignalStrengthFilter,
    status: Mutex<WatcherStatus>,
    samples: Mutex<Option<mpsc::UnboundedSender<AdvertisementSample>>>,
    stop_calls: AtomicUsize,
}

impl MockScanner {
    pub fn emit(&self, sample: AdvertisementSample) {
        if let Some(samples) = lock(&self.samples).as_ref() {
            let _ = samples.send(sample);
        }
    }

    pub fn filter(&self) -> SignalStrengthFilter {
        self.filter
    }

    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AdvertisementScanner for MockScanner {
    fn status(&self) -> WatcherStatus {
        *lock(&self.status)
    }

    async fn start(&self) -> Result<mpsc::UnboundedReceiver<AdvertisementSample>> {
        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&self.samples) = Some(tx);
        *lock(&self.status) = WatcherStatus::Started;
        Ok(rx)
    }

    fn stop(&self) {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        *lock(&self.status) = WatcherStatus::Stopped;
        lock(&self.samples).take();
    }
}

/// Scripted platform
#[derive(Default)]
pub struct MockPlatform {
    devices: Mutex<HashMap<String, Arc<MockDevice>>>,
    enumerators: Mutex<Vec<Arc<MockEnumerator>>>,
    scanners: Mutex<Vec<Arc<MockScanner>>>,
}

impl MockPlatform {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_device(&self, device: Arc<MockDevice>) {
        lock(&self.devices).insert(device.id.clone(), device);
    }

    /// Enumerators in creation order
    pub fn enumerators(&self) -> Vec<Arc<MockEnumerator>> {
        lock(&self.enumerators).clone()
    }

    /// Scanners in creation order
    pub fn scanners(&self) -> Vec<Arc<MockScanner>> {
        lock(&self.scanners).clone()
    }
}

#[async_trait]
impl BlePlatform for MockPlatform {
    async fn device_from_id(&self, id: &str) -> Option<Arc<dyn BleDevice>> {
        lock(&self.devices)
            .get(id)
            .map(|device| device.clone() as Arc<dyn BleDevice>)
    }

    async fn device_from_address(&self, address: u64) -> Option<Arc<dyn BleDevice>> {
        lock(&self.devices)
            .values()
            .find(|device| parse_device_address(&device.id) == Some(address))
            .map(|device| device.clone() as Arc<dyn BleDevice>)
    }

    fn create_device_enumerator(&self, _selector: DeviceSelector) -> Arc<dyn DeviceEnumerator> {
        let enumerator = MockEnumerator::new();
        lock(&self.enumerators).push(enumerator.clone());
        enumerator
    }

    fn create_advertisement_scanner(&self, filter: SignalStrengthFilter) -> Arc<dyn AdvertisementScanner> {
        let scanner = Arc::new(MockScanner {
            filter,
            status: Mutex::new(WatcherStatus::Created),
            samples: Mutex::new(None),
            stop_calls: AtomicUsize::new(0),
        });
        lock(&self.scanners).push(scanner.clone());
        scanner
    }
}
