//! GATT session manager
//! This module owns the single device session: connect, resolve, subscribe,
//! and the serialized teardown, including teardown after the peripheral
//! drops the link on its own.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::attributes::{AttributeCache, find_by_name};
use crate::core::bluetooth::constants::{DEVICE_NAME_CHARACTERISTIC, EVENT_CHANNEL_CAPACITY, GENERIC_ACCESS_NAME};
use crate::core::bluetooth::error::{GattError, GattResult};
use crate::core::bluetooth::notification::{NotificationHandler, Subscription};
use crate::core::bluetooth::platform::{
    BleDevice, BlePlatform, ClientConfiguration, GattCharacteristic, GattStatus, PairingStatus,
};
use crate::core::bluetooth::resolver::{self, CharacteristicResolver, ResolvedCharacteristic};
use crate::core::bluetooth::types::{ConnectionResult, ConnectionStatusChanged};

/// Phase of the session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Disconnected,
    Connecting,
    ServiceDiscovery,
    CharacteristicSetup,
    Connected,
    Disconnecting,
}

/// Work processed one at a time by the session's command queue.
enum SessionCommand {
    Disconnect {
        peer_initiated: bool,
        reply: oneshot::Sender<bool>,
    },
    /// The platform reported the link down for the session of `generation`.
    PeerDisconnected { generation: u64 },
}

/// Everything owned by one live connection.
struct Session {
    generation: u64,
    device: Arc<dyn BleDevice>,
    status_watch: Option<JoinHandle<()>>,
    attributes: AttributeCache,
    resolved: Option<ResolvedCharacteristic>,
    subscription: Option<Subscription>,
}

impl Session {
    fn new(generation: u64, device: Arc<dyn BleDevice>) -> Self {
        Self {
            generation,
            device,
            status_watch: None,
            attributes: AttributeCache::new(),
            resolved: None,
            subscription: None,
        }
    }
}

struct SessionInner {
    platform: Arc<dyn BlePlatform>,
    /// The live session. Holding this lock is the teardown gate.
    session: tokio::sync::Mutex<Option<Session>>,
    /// Device of the live or connecting session, for point-in-time queries.
    current_device: Mutex<Option<Arc<dyn BleDevice>>>,
    state: Mutex<SessionState>,
    connected: watch::Sender<bool>,
    data_tx: broadcast::Sender<Vec<u8>>,
    status_tx: broadcast::Sender<ConnectionStatusChanged>,
    commands: mpsc::UnboundedSender<SessionCommand>,
    generation: AtomicU64,
    notification_handler: NotificationHandler,
}

/// Manages one GATT session at a time
///
/// Cloning yields another handle to the same session.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<SessionInner>,
}

impl SessionManager {
    /// Creates a new SessionManager. Must be called inside a tokio runtime.
    pub fn new(platform: Arc<dyn BlePlatform>) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (data_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (status_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (connected, _) = watch::channel(false);

        let inner = Arc::new(SessionInner {
            platform,
            session: tokio::sync::Mutex::new(None),
            current_device: Mutex::new(None),
            state: Mutex::new(SessionState::Disconnected),
            connected,
            notification_handler: NotificationHandler::new(data_tx.clone()),
            data_tx,
            status_tx,
            commands: commands_tx,
            generation: AtomicU64::new(0),
        });

        tokio::spawn(SessionInner::run_commands(Arc::downgrade(&inner), commands_rx));
        Self { inner }
    }

    /// Connects to `device_id` and subscribes to notifications of
    /// `characteristic_name` in `service_name`. Failures are reported in the
    /// result, never as a panic or error.
    pub async fn connect(
        &self,
        device_id: &str,
        service_name: &str,
        characteristic_name: &str,
        try_pair: bool,
    ) -> ConnectionResult {
        info!("Connecting to {} ({} / {})", device_id, service_name, characteristic_name);
        match self
            .inner
            .try_connect(device_id, service_name, characteristic_name, try_pair)
            .await
        {
            Ok(result) => result,
            Err(e) => {
                warn!("Connection to {} failed: {}", device_id, e);
                ConnectionResult::failure(device_id, &e)
            }
        }
    }

    /// Tears the session down. Returns `false` when nothing was connected or
    /// when disabling notifications failed, in which case every handle is
    /// kept so the call can be retried.
    pub async fn disconnect(&self, peer_initiated: bool) -> bool {
        let (reply, result) = oneshot::channel();
        let command = SessionCommand::Disconnect { peer_initiated, reply };
        if self.inner.commands.send(command).is_err() {
            error!("Session command queue is closed");
            return false;
        }
        result.await.unwrap_or(false)
    }

    /// Queries the live device handle; never cached.
    pub async fn is_connected(&self) -> bool {
        match self.inner.device() {
            Some(device) => device.is_connected().await,
            None => false,
        }
    }

    /// Waits until the session signals connected, or until `token` fires.
    pub async fn wait_for_connected(&self, token: Option<&CancellationToken>) -> GattResult<()> {
        let mut connected = self.inner.connected.subscribe();
        if *connected.borrow() {
            return Ok(());
        }
        let wait = async move {
            connected
                .wait_for(|is_connected| *is_connected)
                .await
                .map(|_| ())
                .map_err(|_| GattError::Cancelled)
        };
        match token {
            Some(token) => tokio::select! {
                result = wait => result,
                _ = token.cancelled() => Err(GattError::Cancelled),
            },
            None => wait.await,
        }
    }

    pub fn state(&self) -> SessionState {
        *self.inner.lock_state()
    }

    /// Id of the live device, if any.
    pub fn device_id(&self) -> Option<String> {
        self.inner.device().map(|device| device.id())
    }

    /// Stream of framed notification payloads
    pub fn subscribe_data(&self) -> broadcast::Receiver<Vec<u8>> {
        self.inner.data_tx.subscribe()
    }

    /// Stream of connection status changes
    pub fn subscribe_connection_status(&self) -> broadcast::Receiver<ConnectionStatusChanged> {
        self.inner.status_tx.subscribe()
    }

    /// Writes `data` to a characteristic of a cached service.
    pub async fn write_device_info(&self, collection: &str, characteristic_name: &str, data: &[u8]) -> GattResult<()> {
        let characteristic = self.find_device_info(collection, characteristic_name).await?;
        match characteristic.write(data).await {
            GattStatus::Success => Ok(()),
            status => {
                warn!("Writing {} failed: {}", characteristic_name, status);
                Err(GattError::WriteFailed(characteristic_name.to_string()))
            }
        }
    }

    /// Reads a characteristic of a cached service as text.
    pub async fn read_device_info(&self, collection: &str, characteristic_name: &str) -> GattResult<String> {
        let characteristic = self.find_device_info(collection, characteristic_name).await?;
        let value = characteristic.read().await.map_err(|status| {
            warn!("Reading {} failed: {}", characteristic_name, status);
            GattError::ReadFailed(characteristic_name.to_string())
        })?;
        Ok(String::from_utf8_lossy(&value).trim_end_matches('\0').to_string())
    }

    /// Name the peripheral reports in its generic access service.
    pub async fn device_name(&self) -> GattResult<String> {
        self.read_device_info(GENERIC_ACCESS_NAME, DEVICE_NAME_CHARACTERISTIC).await
    }

    /// Releases the session without touching the peripheral's configuration.
    pub async fn dispose(&self) {
        self.disconnect(true).await;
    }

    async fn find_device_info(&self, collection: &str, characteristic_name: &str) -> GattResult<Arc<dyn GattCharacteristic>> {
        if !self.is_connected().await {
            return Err(GattError::NotConnected);
        }
        let service = {
            let session = self.inner.session.lock().await;
            session
                .as_ref()
                .and_then(|s| s.attributes.find(collection).cloned())
        }
        .ok_or_else(|| GattError::ServiceNotFound(collection.to_string()))?;

        let characteristics = resolver::service_characteristics(&service).await;
        find_by_name(&characteristics, characteristic_name)
            .and_then(|a| a.characteristic().cloned())
            .ok_or_else(|| GattError::CharacteristicNotFound(characteristic_name.to_string()))
    }
}

impl SessionInner {
    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: SessionState) {
        let mut current = self.lock_state();
        if *current != state {
            debug!("Session state {:?} -> {:?}", *current, state);
            *current = state;
        }
    }

    fn device(&self) -> Option<Arc<dyn BleDevice>> {
        self.current_device.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set_device(&self, device: Option<Arc<dyn BleDevice>>) {
        *self.current_device.lock().unwrap_or_else(|e| e.into_inner()) = device;
    }

    async fn try_connect(
        self: &Arc<Self>,
        device_id: &str,
        service_name: &str,
        characteristic_name: &str,
        try_pair: bool,
    ) -> GattResult<ConnectionResult> {
        let mut slot = self.session.lock().await;
        if slot.is_some() {
            info!("Releasing previous session before connecting");
            if !self.teardown(&mut slot, false).await {
                self.teardown(&mut slot, true).await;
            }
        }
        self.connected.send_replace(false);
        self.set_state(SessionState::Connecting);

        let Some(device) = self.platform.device_from_id(device_id).await else {
            self.set_state(SessionState::Disconnected);
            return Err(GattError::DeviceNotFound(device_id.to_string()));
        };
        self.set_device(Some(device.clone()));

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let mut session = Session::new(generation, device.clone());
        self.register_status_watch(&mut session).await;

        self.set_state(SessionState::ServiceDiscovery);
        match device.services().await {
            Ok(services) => {
                info!("Discovered {} services on {}", services.len(), device_id);
                session.attributes.extend_services(services);
            }
            Err(status) => {
                self.abandon(session).await;
                return Err(GattError::DeviceUnreachable(status.to_string()));
            }
        }

        self.set_state(SessionState::CharacteristicSetup);
        let resolved = match CharacteristicResolver::new(&session.attributes)
            .resolve(service_name, characteristic_name)
            .await
        {
            Ok(resolved) => resolved,
            Err(e) => {
                self.abandon(session).await;
                return Err(e);
            }
        };
        match resolver::subscribe(&resolved, &self.notification_handler).await {
            Ok(subscription) => {
                session.resolved = Some(resolved);
                session.subscription = Some(subscription);
            }
            Err(e) => {
                self.abandon(session).await;
                return Err(e);
            }
        }

        // Pairing failure leaves the session up; it is only reported
        let mut pairing_error = None;
        if try_pair {
            let pairing = device.pairing_state().await;
            if pairing.can_pair && !pairing.is_paired {
                info!("Pairing with {}", device_id);
                match device.pair_confirm_only().await {
                    PairingStatus::Paired | PairingStatus::AlreadyPaired => info!("Paired with {}", device_id),
                    status => {
                        let e = GattError::PairingFailed(status.to_string());
                        warn!("{} for {}", e, device_id);
                        pairing_error = Some(e);
                    }
                }
            }
        }

        let is_connected = device.is_connected().await;
        let result = ConnectionResult {
            device_id: device.id(),
            name: device.name(),
            is_connected,
            is_paired: Some(device.pairing_state().await.is_paired),
            has_error: false,
            error_message: pairing_error.as_ref().map(ToString::to_string),
            error_kind: pairing_error.as_ref().map(GattError::kind),
        };
        *slot = Some(session);
        self.connected.send_replace(is_connected);
        self.set_state(if is_connected {
            SessionState::Connected
        } else {
            SessionState::Disconnected
        });
        info!("Session {} established, connected: {}", generation, is_connected);
        Ok(result)
    }

    /// Hooks connection status changes of the session's device, once.
    async fn register_status_watch(self: &Arc<Self>, session: &mut Session) {
        if session.status_watch.is_some() {
            return;
        }
        let mut changes = match session.device.connection_status_changed().await {
            Ok(changes) => changes,
            Err(status) => {
                warn!("Could not watch connection status of {}: {}", session.device.id(), status);
                return;
            }
        };
        let inner = Arc::downgrade(self);
        let generation = session.generation;
        session.status_watch = Some(tokio::spawn(async move {
            while let Some(is_connected) = changes.recv().await {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                inner.on_connection_status_changed(generation, is_connected);
            }
        }));
    }

    /// Platform callback. A link-down resets the connected signal before
    /// anything else, then queues the teardown.
    fn on_connection_status_changed(&self, generation: u64, is_connected: bool) {
        if !is_connected {
            self.connected.send_replace(false);
            self.set_state(SessionState::Disconnecting);
            info!("Peripheral dropped the link, queueing teardown of session {}", generation);
            if self.commands.send(SessionCommand::PeerDisconnected { generation }).is_err() {
                warn!("Session command queue is closed, teardown skipped");
            }
        }
        let _ = self.status_tx.send(ConnectionStatusChanged { is_connected });
    }

    async fn run_commands(inner: Weak<Self>, mut commands: mpsc::UnboundedReceiver<SessionCommand>) {
        while let Some(command) = commands.recv().await {
            let Some(inner) = inner.upgrade() else {
                break;
            };
            match command {
                SessionCommand::Disconnect { peer_initiated, reply } => {
                    let mut slot = inner.session.lock().await;
                    let result = inner.teardown(&mut slot, peer_initiated).await;
                    drop(slot);
                    let _ = reply.send(result);
                }
                SessionCommand::PeerDisconnected { generation } => {
                    let mut slot = inner.session.lock().await;
                    if slot.as_ref().map(|s| s.generation) != Some(generation) {
                        debug!("Ignoring link-down for stale session {}", generation);
                        continue;
                    }
                    inner.teardown(&mut slot, true).await;
                }
            }
        }
        debug!("Session command queue stopped");
    }

    /// Releases the session in `slot`. Aborts before releasing anything if
    /// notifications cannot be disabled on a caller-initiated teardown.
    async fn teardown(&self, slot: &mut Option<Session>, peer_initiated: bool) -> bool {
        let Some(mut session) = slot.take() else {
            return false;
        };
        let previous_state = *self.lock_state();
        self.set_state(SessionState::Disconnecting);
        info!("Tearing down session {} (peer initiated: {})", session.generation, peer_initiated);

        let handle = session.resolved.as_ref().map(|r| r.handle.clone());
        if let (Some(handle), false) = (handle, peer_initiated) {
            let status = handle.write_client_configuration(ClientConfiguration::None).await;
            if status != GattStatus::Success {
                warn!("Disabling notifications failed: {}, keeping session", status);
                *slot = Some(session);
                self.set_state(previous_state);
                return false;
            }
        }
        if let Some(subscription) = session.subscription.take() {
            subscription.unhook().await;
        }

        self.release(session).await;
        true
    }

    /// Abandons a session that never finished connecting.
    async fn abandon(&self, mut session: Session) {
        if let Some(subscription) = session.subscription.take() {
            subscription.unhook().await;
        }
        self.release(session).await;
    }

    async fn release(&self, mut session: Session) {
        if let Some(resolved) = session.resolved.take() {
            resolved.characteristic.release_service().await;
            resolved.service.release_service().await;
        }
        session.attributes.release_all().await;
        if let Some(status_watch) = session.status_watch.take() {
            status_watch.abort();
        }
        session.device.close().await;

        self.set_device(None);
        self.connected.send_replace(false);
        self.set_state(SessionState::Disconnected);
        info!("Session {} released", session.generation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bluetooth::constants::*;
    use crate::core::bluetooth::error::ErrorKind;
    use crate::core::bluetooth::mock::{MockCharacteristic, MockDevice, MockPlatform, MockService};
    use crate::core::bluetooth::platform::{CharacteristicProperties, PairingState};
    use std::time::Duration;

    const DEVICE_ID: &str = "BluetoothLE#BluetoothLE00:11:22:33:44:55-aa:bb:cc:dd:ee:ff";

    struct Fixture {
        platform: Arc<MockPlatform>,
        device: Arc<MockDevice>,
        heart_rate: Arc<MockService>,
        measurement: Arc<MockCharacteristic>,
        manager: SessionManager,
    }

    fn fixture() -> Fixture {
        let platform = MockPlatform::new();
        let device = MockDevice::new(DEVICE_ID, "HRM");
        let heart_rate = device.add_service(UUID_HEART_RATE_SERVICE);
        let measurement = heart_rate.add_notify_characteristic(UUID_HEART_RATE_MEASUREMENT);
        let access = device.add_service(UUID_GENERIC_ACCESS_SERVICE);
        let name = access.add_characteristic(
            UUID_DEVICE_NAME,
            CharacteristicProperties { read: true, write: true, ..Default::default() },
        );
        name.set_value(b"Polar H10\0");
        platform.add_device(device.clone());
        let manager = SessionManager::new(platform.clone());
        Fixture { platform, device, heart_rate, measurement, manager }
    }

    async fn connect(f: &Fixture) -> ConnectionResult {
        f.manager.connect(DEVICE_ID, "HeartRate", "HeartRateMeasurement", false).await
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn connect_subscribes_and_signals() {
        let f = fixture();
        let result = connect(&f).await;

        assert!(result.is_connected);
        assert!(!result.has_error);
        assert_eq!(result.name, "HRM");
        assert_eq!(result.is_paired, Some(false));
        assert_eq!(f.manager.state(), SessionState::Connected);
        assert!(f.manager.is_connected().await);
        assert_eq!(f.measurement.config_writes(), vec![ClientConfiguration::Notify]);
        assert_eq!(f.device.status_registrations(), 1);
        f.manager.wait_for_connected(None).await.unwrap();
    }

    #[tokio::test]
    async fn unknown_device_is_not_found() {
        let f = fixture();
        let result = f.manager.connect("missing", "HeartRate", "HeartRateMeasurement", false).await;
        assert_eq!(result.error_kind, Some(ErrorKind::DeviceNotFound));
        assert_eq!(result.error_message.as_deref(), Some("Could not find specified device"));
        assert_eq!(f.manager.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn failed_service_enumeration_is_unreachable() {
        let f = fixture();
        f.device.set_services_status(GattStatus::Unreachable);
        let result = connect(&f).await;
        assert_eq!(result.error_kind, Some(ErrorKind::DeviceUnreachable));
        assert!(!f.manager.is_connected().await);
        assert_eq!(f.device.close_count(), 1);
    }

    #[tokio::test]
    async fn unknown_service_and_characteristic_are_reported() {
        let f = fixture();
        let result = f.manager.connect(DEVICE_ID, "Battery", "BatteryLevel", false).await;
        assert_eq!(result.error_kind, Some(ErrorKind::ServiceNotFound));
        assert_eq!(result.error_message.as_deref(), Some("Cannot find Battery service"));

        let result = f.manager.connect(DEVICE_ID, "HeartRate", "BatteryLevel", false).await;
        assert_eq!(result.error_kind, Some(ErrorKind::CharacteristicNotFound));
        assert!(!result.is_connected);
    }

    #[tokio::test]
    async fn failed_connect_leaves_wait_pending() {
        let f = fixture();
        f.measurement.set_config_write_status(GattStatus::ProtocolError);
        let result = connect(&f).await;
        assert_eq!(result.error_kind, Some(ErrorKind::ConfigWriteFailed));
        assert_eq!(f.measurement.live_value_hooks(), 0);

        let token = CancellationToken::new();
        token.cancel();
        assert_eq!(f.manager.wait_for_connected(Some(&token)).await, Err(GattError::Cancelled));
    }

    #[tokio::test]
    async fn wait_for_connected_is_released_by_connect() {
        let f = fixture();
        let manager = f.manager.clone();
        let waiter = tokio::spawn(async move { manager.wait_for_connected(None).await });
        settle().await;
        assert!(!waiter.is_finished());

        connect(&f).await;
        assert_eq!(waiter.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn try_pair_pairs_unpaired_device() {
        let f = fixture();
        let result = f.manager.connect(DEVICE_ID, "HeartRate", "HeartRateMeasurement", true).await;
        assert_eq!(result.is_paired, Some(true));
        assert_eq!(f.device.pair_calls(), 1);
    }

    #[tokio::test]
    async fn failed_pairing_is_reported_without_failing_connect() {
        let f = fixture();
        f.device.set_pair_outcome(PairingStatus::RejectedByHandler);
        let result = f.manager.connect(DEVICE_ID, "HeartRate", "HeartRateMeasurement", true).await;

        assert!(!result.has_error);
        assert!(result.is_connected);
        assert_eq!(result.is_paired, Some(false));
        assert_eq!(result.error_kind, Some(ErrorKind::PairingFailed));
        assert_eq!(result.error_message.as_deref(), Some("Pairing failed: RejectedByHandler"));
        assert_eq!(f.manager.state(), SessionState::Connected);
    }

    #[tokio::test]
    async fn try_pair_skips_paired_device() {
        let f = fixture();
        f.device.set_pairing(PairingState { can_pair: true, is_paired: true });
        f.manager.connect(DEVICE_ID, "HeartRate", "HeartRateMeasurement", true).await;
        assert_eq!(f.device.pair_calls(), 0);
    }

    #[tokio::test]
    async fn notifications_are_framed() {
        let f = fixture();
        let mut data = f.manager.subscribe_data();
        connect(&f).await;

        f.measurement.push_value(&[0x01, 0x02, 0x03]);
        assert_eq!(data.recv().await.unwrap(), vec![0x00, 0x03, 0x01, 0x02, 0x03]);
    }

    #[tokio::test]
    async fn disconnect_without_session_is_noop() {
        let f = fixture();
        assert!(!f.manager.disconnect(false).await);
        assert!(!f.manager.disconnect(false).await);
        assert!(!f.manager.is_connected().await);
    }

    #[tokio::test]
    async fn disconnect_disables_notifications_and_releases_handles() {
        let f = fixture();
        connect(&f).await;

        assert!(f.manager.disconnect(false).await);
        assert_eq!(
            f.measurement.config_writes(),
            vec![ClientConfiguration::Notify, ClientConfiguration::None]
        );
        assert_eq!(f.measurement.live_value_hooks(), 0);
        // owning service, resolved service, and the cache entry
        assert_eq!(f.heart_rate.close_count(), 3);
        assert_eq!(f.device.close_count(), 1);
        assert!(!f.manager.is_connected().await);
        assert_eq!(f.manager.state(), SessionState::Disconnected);
        assert_eq!(f.manager.device_id(), None);
    }

    #[tokio::test]
    async fn failed_disable_keeps_session_for_retry() {
        let f = fixture();
        connect(&f).await;
        f.measurement.set_config_write_status(GattStatus::Unreachable);

        assert!(!f.manager.disconnect(false).await);
        assert_eq!(f.device.close_count(), 0);
        assert_eq!(f.heart_rate.close_count(), 0);
        assert!(f.manager.is_connected().await);

        f.measurement.set_config_write_status(GattStatus::Success);
        assert!(f.manager.disconnect(false).await);
        assert_eq!(f.device.close_count(), 1);
    }

    #[tokio::test]
    async fn peer_initiated_disconnect_skips_config_write() {
        let f = fixture();
        connect(&f).await;
        assert!(f.manager.disconnect(true).await);
        assert_eq!(f.measurement.config_writes(), vec![ClientConfiguration::Notify]);
        assert_eq!(f.measurement.live_value_hooks(), 0);
    }

    #[tokio::test]
    async fn concurrent_disconnects_tear_down_once() {
        let f = fixture();
        connect(&f).await;

        let calls: Vec<_> = (0..4)
            .map(|_| {
                let manager = f.manager.clone();
                tokio::spawn(async move { manager.disconnect(false).await })
            })
            .collect();
        let mut torn_down = 0;
        for call in calls {
            if call.await.unwrap() {
                torn_down += 1;
            }
        }

        assert_eq!(torn_down, 1);
        assert_eq!(f.device.close_count(), 1);
        assert!(!f.manager.is_connected().await);
    }

    #[tokio::test]
    async fn caller_and_peer_disconnect_race_tears_down_once() {
        let f = fixture();
        connect(&f).await;

        let manager = f.manager.clone();
        let caller = tokio::spawn(async move { manager.disconnect(false).await });
        f.device.set_connected(false);
        caller.await.unwrap();
        settle().await;

        assert_eq!(f.device.close_count(), 1);
        assert_eq!(f.manager.state(), SessionState::Disconnected);
        assert_eq!(f.manager.device_id(), None);
        assert!(!f.manager.is_connected().await);
    }

    #[tokio::test]
    async fn late_link_down_for_released_session_is_ignored() {
        let f = fixture();
        connect(&f).await;
        let released = f.manager.inner.generation.load(Ordering::SeqCst);
        assert!(f.manager.disconnect(false).await);

        f.manager
            .inner
            .commands
            .send(SessionCommand::PeerDisconnected { generation: released })
            .unwrap();
        settle().await;
        assert_eq!(f.device.close_count(), 1);
        assert_eq!(f.manager.state(), SessionState::Disconnected);

        connect(&f).await;
        f.manager
            .inner
            .commands
            .send(SessionCommand::PeerDisconnected { generation: released })
            .unwrap();
        settle().await;

        assert_eq!(f.device.close_count(), 1);
        assert_eq!(f.manager.state(), SessionState::Connected);
        assert_eq!(f.manager.device_id().as_deref(), Some(DEVICE_ID));
        assert_eq!(
            f.measurement.config_writes(),
            vec![ClientConfiguration::Notify, ClientConfiguration::None, ClientConfiguration::Notify]
        );
    }

    #[tokio::test]
    async fn peer_disconnect_tears_down_session() {
        let f = fixture();
        let mut status = f.manager.subscribe_connection_status();
        connect(&f).await;

        f.device.set_connected(false);
        assert_eq!(status.recv().await.unwrap(), ConnectionStatusChanged { is_connected: false });
        settle().await;

        assert_eq!(f.device.close_count(), 1);
        assert_eq!(f.measurement.config_writes(), vec![ClientConfiguration::Notify]);
        assert_eq!(f.manager.state(), SessionState::Disconnected);
        assert_eq!(f.manager.device_id(), None);

        let token = CancellationToken::new();
        token.cancel();
        assert_eq!(f.manager.wait_for_connected(Some(&token)).await, Err(GattError::Cancelled));
    }

    #[tokio::test]
    async fn reconnect_registers_status_watch_once_per_session() {
        let f = fixture();
        connect(&f).await;
        connect(&f).await;
        assert_eq!(f.device.status_registrations(), 2);
        assert_eq!(f.device.close_count(), 1);

        let mut status = f.manager.subscribe_connection_status();
        f.device.set_connected(false);
        assert_eq!(status.recv().await.unwrap(), ConnectionStatusChanged { is_connected: false });
        settle().await;
        assert!(status.try_recv().is_err());
        assert_eq!(f.device.close_count(), 2);
    }

    #[tokio::test]
    async fn device_info_round_trip() {
        let f = fixture();
        assert_eq!(f.manager.device_name().await, Err(GattError::NotConnected));

        connect(&f).await;
        assert_eq!(f.manager.device_name().await.unwrap(), "Polar H10");
        f.manager.write_device_info("GenericAccess", "DeviceName", b"HRM-2").await.unwrap();
        assert_eq!(
            f.manager.write_device_info("Battery", "BatteryLevel", &[1]).await,
            Err(GattError::ServiceNotFound("Battery".into()))
        );
        assert_eq!(f.manager.device_id().as_deref(), Some(DEVICE_ID));
        drop(f.platform);
    }
}
