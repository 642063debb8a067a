//! Discovery watcher
//! Runs the device enumerator and the advertisement scanner side by side,
//! keeps the signal strength table, and publishes discovery events.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use anyhow::{Result, anyhow};
use log::{debug, error, info, warn};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::constants::EVENT_CHANNEL_CAPACITY;
use crate::core::bluetooth::platform::{
    AdvertisementSample, AdvertisementScanner, BlePlatform, DeviceEnumerator, DeviceSelector, EnumerationEvent,
    SignalStrengthFilter, WatcherId, WatcherStatus,
};
use crate::core::bluetooth::signal::SignalStrengthTable;
use crate::core::bluetooth::types::{DiscoveredDevice, WatcherEvent, parse_device_address};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

struct WatcherInner {
    platform: Arc<dyn BlePlatform>,
    selector: DeviceSelector,
    /// Name allow-list; `None` accepts every device.
    filters: Option<HashSet<String>>,
    table: Arc<SignalStrengthTable>,
    events_tx: broadcast::Sender<WatcherEvent>,
    enumerator: Mutex<Arc<dyn DeviceEnumerator>>,
    scanner: Arc<dyn AdvertisementScanner>,
    /// Enumerator whose callbacks are currently accepted.
    active: Mutex<Option<WatcherId>>,
    running: AtomicBool,
    /// Cancels the broadcast loop and every forwarding task.
    cancel_token: CancellationToken,
    /// Cancels the forwarding tasks of the current start.
    run_token: Mutex<Option<CancellationToken>>,
}

/// Watches for nearby devices and their signal strength.
///
/// Cloning yields another handle to the same watcher.
#[derive(Clone)]
pub struct DeviceWatcher {
    inner: Arc<WatcherInner>,
}

impl DeviceWatcher {
    /// Creates the native watchers and starts the periodic signal strength
    /// broadcast. Must be called inside a tokio runtime.
    pub fn new(
        platform: Arc<dyn BlePlatform>,
        selector: DeviceSelector,
        filters: Option<Vec<String>>,
        signal_strength_interval: Duration,
    ) -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let enumerator = platform.create_device_enumerator(selector);
        let scanner =
            platform.create_advertisement_scanner(SignalStrengthFilter::with_sampling_interval(signal_strength_interval));

        let inner = Arc::new(WatcherInner {
            platform,
            selector,
            filters: filters.map(|names| names.into_iter().collect()),
            table: Arc::new(SignalStrengthTable::new()),
            events_tx,
            enumerator: Mutex::new(enumerator),
            scanner,
            active: Mutex::new(None),
            running: AtomicBool::new(false),
            cancel_token: CancellationToken::new(),
            run_token: Mutex::new(None),
        });

        tokio::spawn(WatcherInner::broadcast_signal_strengths(
            Arc::downgrade(&inner),
            signal_strength_interval,
            inner.cancel_token.clone(),
        ));
        Self { inner }
    }

    /// Starts both native watchers. A stopped enumerator is replaced by a
    /// fresh one, whose identity becomes the only one accepted.
    pub async fn start(&self) -> Result<()> {
        if self.inner.cancel_token.is_cancelled() {
            return Err(anyhow!("Device watcher disposed"));
        }
        if self.inner.running.swap(true, Ordering::SeqCst) {
            debug!("Device watcher already running");
            return Ok(());
        }
        if let Err(e) = self.inner.start().await {
            self.inner.running.store(false, Ordering::SeqCst);
            error!("Failed to start device watcher: {}", e);
            return Err(e);
        }
        info!("Device watcher started");
        Ok(())
    }

    /// Stops both native watchers. Safe to call repeatedly.
    pub fn stop(&self) {
        self.inner.stop();
    }

    /// Stops the watchers, forgets the active enumerator and ends the
    /// broadcast loop. Starting a disposed watcher fails.
    pub fn dispose(&self) {
        self.inner.stop();
        lock(&self.inner.active).take();
        self.inner.cancel_token.cancel();
        info!("Device watcher disposed");
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WatcherEvent> {
        self.inner.events_tx.subscribe()
    }

    pub fn signal_strengths(&self) -> Arc<SignalStrengthTable> {
        self.inner.table.clone()
    }

    /// Routes one enumerator callback. Callbacks from any enumerator other
    /// than the active one are dropped.
    pub(crate) fn handle_enumeration_event(&self, source: WatcherId, event: EnumerationEvent) {
        self.inner.handle_enumeration_event(source, event);
    }
}

impl WatcherInner {
    async fn start(self: &Arc<Self>) -> Result<()> {
        let enumerator = {
            let mut enumerator = lock(&self.enumerator);
            let status = enumerator.status();
            if status.is_stopped_or_stopping() || status == WatcherStatus::Aborted {
                debug!("Replacing {:?} enumerator {:?}", status, enumerator.id());
                *enumerator = self.platform.create_device_enumerator(self.selector);
            }
            enumerator.clone()
        };
        let source = enumerator.id();
        *lock(&self.active) = Some(source);

        let run_token = self.cancel_token.child_token();
        if let Some(previous) = lock(&self.run_token).replace(run_token.clone()) {
            previous.cancel();
        }

        let events = enumerator.start().await?;
        tokio::spawn(Self::forward_enumeration(
            Arc::downgrade(self),
            source,
            events,
            run_token.clone(),
        ));

        let samples = self.scanner.start().await?;
        tokio::spawn(Self::forward_samples(self.table.clone(), samples, run_token));
        Ok(())
    }

    fn stop(&self) {
        let enumerator = lock(&self.enumerator).clone();
        if !enumerator.status().is_stopped_or_stopping() {
            enumerator.stop();
        }
        if !self.scanner.status().is_stopped_or_stopping() {
            self.scanner.stop();
        }
        if self.running.swap(false, Ordering::SeqCst) {
            info!("Device watcher stopped");
        }
    }

    async fn forward_enumeration(
        inner: Weak<Self>,
        source: WatcherId,
        mut events: mpsc::UnboundedReceiver<EnumerationEvent>,
        cancel_token: CancellationToken,
    ) {
        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else { break };
                    let Some(inner) = inner.upgrade() else { break };
                    inner.handle_enumeration_event(source, event);
                }
                _ = cancel_token.cancelled() => break,
            }
        }
        debug!("Enumeration forwarding for {:?} ended", source);
    }

    async fn forward_samples(
        table: Arc<SignalStrengthTable>,
        mut samples: mpsc::UnboundedReceiver<AdvertisementSample>,
        cancel_token: CancellationToken,
    ) {
        loop {
            tokio::select! {
                sample = samples.recv() => {
                    let Some(sample) = sample else { break };
                    table.record(sample);
                }
                _ = cancel_token.cancelled() => break,
            }
        }
    }

    async fn broadcast_signal_strengths(inner: Weak<Self>, period: Duration, cancel_token: CancellationToken) {
        // First tick completes immediately
        let mut interval = tokio::time::interval(period);
        loop {
            tokio::select! {
                biased;
                _ = cancel_token.cancelled() => break,
                _ = interval.tick() => {
                    let Some(inner) = inner.upgrade() else { break };
                    // No receivers is not an error
                    let _ = inner.events_tx.send(WatcherEvent::SignalStrengthUpdated(inner.table.snapshot()));
                }
            }
        }
        debug!("Signal strength broadcast stopped");
    }

    fn handle_enumeration_event(&self, source: WatcherId, event: EnumerationEvent) {
        if *lock(&self.active) != Some(source) {
            debug!("Dropping {:?} from stale enumerator {:?}", event, source);
            return;
        }

        let event = match event {
            EnumerationEvent::Added(info) => {
                if let Some(filters) = &self.filters {
                    if !filters.contains(&info.name) {
                        return;
                    }
                }
                let Some(address) = parse_device_address(&info.id) else {
                    warn!("Ignoring device with unparseable id: {}", info.id);
                    return;
                };
                let device = DiscoveredDevice::from_information(&info, address, self.table.get(address));
                info!("Device added: {} ({})", device.name, info.id);
                WatcherEvent::DeviceAdded(device)
            }
            EnumerationEvent::Updated(update) => WatcherEvent::DeviceUpdated(DiscoveredDevice::from_update(&update)),
            EnumerationEvent::Removed(update) => WatcherEvent::DeviceRemoved(DiscoveredDevice::from_update(&update)),
            EnumerationEvent::EnumerationCompleted => {
                info!("Device enumeration completed");
                WatcherEvent::EnumerationCompleted
            }
            EnumerationEvent::Stopped => WatcherEvent::EnumerationStopped,
        };
        let _ = self.events_tx.send(event);
    }
}
