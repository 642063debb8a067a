//! Characteristic resolution for a connected device
//! Walks the attribute cache to find the requested service and
//! characteristic, checks its descriptors and notify support, and subscribes.

use std::sync::Arc;

use log::{debug, info, warn};

use crate::core::bluetooth::attributes::{Attribute, AttributeCache, find_by_name};
use crate::core::bluetooth::error::{GattError, GattResult};
use crate::core::bluetooth::notification::{NotificationHandler, Subscription};
use crate::core::bluetooth::platform::{AccessStatus, ClientConfiguration, GattCharacteristic, GattStatus};

/// Service and characteristic picked by [`CharacteristicResolver::resolve`].
#[derive(Clone)]
pub struct ResolvedCharacteristic {
    pub service: Attribute,
    pub characteristic: Attribute,
    pub handle: Arc<dyn GattCharacteristic>,
}

/// Resolves named attributes against an [`AttributeCache`].
pub struct CharacteristicResolver<'a> {
    cache: &'a AttributeCache,
}

impl<'a> CharacteristicResolver<'a> {
    pub fn new(cache: &'a AttributeCache) -> Self {
        Self { cache }
    }

    /// Finds `service_name` and its `characteristic_name`, then checks that
    /// descriptors can be fetched and that the characteristic notifies.
    pub async fn resolve(&self, service_name: &str, characteristic_name: &str) -> GattResult<ResolvedCharacteristic> {
        let service = self
            .cache
            .find(service_name)
            .cloned()
            .ok_or_else(|| GattError::ServiceNotFound(service_name.to_string()))?;

        let characteristics = service_characteristics(&service).await;
        let characteristic = find_by_name(&characteristics, characteristic_name)
            .cloned()
            .ok_or_else(|| {
                for c in &characteristics {
                    debug!("Available characteristic: {}", c.name);
                }
                GattError::CharacteristicNotFound(characteristic_name.to_string())
            })?;
        let handle = characteristic
            .characteristic()
            .cloned()
            .ok_or_else(|| GattError::CharacteristicNotFound(characteristic_name.to_string()))?;
        info!("Found {} characteristic in {} service", characteristic.name, service.name);

        if let Err(status) = handle.descriptors().await {
            return Err(GattError::DescriptorFetchFailed(status));
        }

        if !handle.properties().await.notify {
            return Err(GattError::NotifyUnsupported(characteristic_name.to_string()));
        }

        Ok(ResolvedCharacteristic { service, characteristic, handle })
    }
}

/// Enables notifications on a resolved characteristic. The value-changed
/// callback is only attached after the configuration write succeeded.
pub async fn subscribe(resolved: &ResolvedCharacteristic, handler: &NotificationHandler) -> GattResult<Subscription> {
    let status = resolved.handle.write_client_configuration(ClientConfiguration::Notify).await;
    if status != GattStatus::Success {
        warn!("Enabling notifications on {} failed: {}", resolved.characteristic.name, status);
        return Err(GattError::ConfigWriteFailed(status));
    }
    handler
        .attach(resolved.handle.clone())
        .await
        .ok_or(GattError::ConfigWriteFailed(GattStatus::ProtocolError))
}

/// Child characteristics of a service attribute. Denied access or a failed
/// fetch yields an empty list rather than an error.
pub async fn service_characteristics(service: &Attribute) -> Vec<Attribute> {
    let Some(handle) = service.service() else {
        return Vec::new();
    };
    let access = handle.request_access().await;
    if access != AccessStatus::Allowed {
        warn!("Access to {} service not granted: {:?}", service.name, access);
        return Vec::new();
    }
    match handle.characteristics().await {
        Ok(characteristics) => characteristics.into_iter().map(Attribute::from_characteristic).collect(),
        Err(status) => {
            warn!("Fetching characteristics of {} failed: {}", service.name, status);
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bluetooth::constants::*;
    use crate::core::bluetooth::error::ErrorKind;
    use crate::core::bluetooth::mock::{MockDevice, MockService};
    use crate::core::bluetooth::platform::{BleDevice, CharacteristicProperties};
    use tokio::sync::broadcast;

    async fn cache_for(device: &MockDevice) -> AttributeCache {
        let mut cache = AttributeCache::new();
        cache.extend_services(device.services().await.unwrap());
        cache
    }

    fn heart_rate_device() -> (Arc<MockDevice>, Arc<MockService>) {
        let device = MockDevice::new("BluetoothLE#BluetoothLE00:11:22:33:44:55-aa:bb:cc:dd:ee:ff", "HRM");
        let service = device.add_service(UUID_HEART_RATE_SERVICE);
        (device, service)
    }

    #[tokio::test]
    async fn unknown_service_is_reported() {
        let (device, _) = heart_rate_device();
        let cache = cache_for(&device).await;
        let err = CharacteristicResolver::new(&cache).resolve("Battery", "BatteryLevel").await.err();
        assert_eq!(err.map(|e| e.kind()), Some(ErrorKind::ServiceNotFound));
    }

    #[tokio::test]
    async fn denied_access_reads_as_no_characteristics() {
        let (device, service) = heart_rate_device();
        service.add_notify_characteristic(UUID_HEART_RATE_MEASUREMENT);
        service.set_access(AccessStatus::DeniedByUser);
        let cache = cache_for(&device).await;

        let attribute = cache.find("HeartRate").unwrap();
        assert!(service_characteristics(attribute).await.is_empty());
        let err = CharacteristicResolver::new(&cache)
            .resolve("HeartRate", "HeartRateMeasurement")
            .await
            .err();
        assert_eq!(err.map(|e| e.kind()), Some(ErrorKind::CharacteristicNotFound));
    }

    #[tokio::test]
    async fn failed_fetch_reads_as_no_characteristics() {
        let (device, service) = heart_rate_device();
        service.add_notify_characteristic(UUID_HEART_RATE_MEASUREMENT);
        service.set_characteristics_status(GattStatus::Unreachable);
        let cache = cache_for(&device).await;

        assert!(service_characteristics(cache.find("HeartRate").unwrap()).await.is_empty());
    }

    #[tokio::test]
    async fn descriptor_failure_is_surfaced() {
        let (device, service) = heart_rate_device();
        let characteristic = service.add_notify_characteristic(UUID_HEART_RATE_MEASUREMENT);
        characteristic.set_descriptor_status(GattStatus::ProtocolError);
        let cache = cache_for(&device).await;

        let err = CharacteristicResolver::new(&cache)
            .resolve("HeartRate", "HeartRateMeasurement")
            .await
            .err();
        assert_eq!(err, Some(GattError::DescriptorFetchFailed(GattStatus::ProtocolError)));
    }

    #[tokio::test]
    async fn characteristic_without_notify_is_rejected() {
        let (device, service) = heart_rate_device();
        service.add_characteristic(
            UUID_BODY_SENSOR_LOCATION,
            CharacteristicProperties { read: true, ..Default::default() },
        );
        let cache = cache_for(&device).await;

        let err = CharacteristicResolver::new(&cache)
            .resolve("HeartRate", "BodySensorLocation")
            .await
            .err();
        assert_eq!(err, Some(GattError::NotifyUnsupported("BodySensorLocation".into())));
    }

    #[tokio::test]
    async fn failed_config_write_attaches_nothing() {
        let (device, service) = heart_rate_device();
        let characteristic = service.add_notify_characteristic(UUID_HEART_RATE_MEASUREMENT);
        characteristic.set_config_write_status(GattStatus::Unreachable);
        let cache = cache_for(&device).await;
        let resolved = CharacteristicResolver::new(&cache)
            .resolve("HeartRate", "HeartRateMeasurement")
            .await
            .unwrap();

        let (data_tx, _data_rx) = broadcast::channel(4);
        let result = subscribe(&resolved, &NotificationHandler::new(data_tx)).await;
        assert!(matches!(result, Err(GattError::ConfigWriteFailed(GattStatus::Unreachable))));
        assert_eq!(characteristic.live_value_hooks(), 0);
        assert_eq!(characteristic.config_writes(), vec![ClientConfiguration::Notify]);
    }

    #[tokio::test]
    async fn successful_subscribe_hooks_values() {
        let (device, service) = heart_rate_device();
        let characteristic = service.add_notify_characteristic(UUID_HEART_RATE_MEASUREMENT);
        let cache = cache_for(&device).await;
        let resolved = CharacteristicResolver::new(&cache)
            .resolve("HeartRate", "HeartRateMeasurement")
            .await
            .unwrap();

        let (data_tx, _data_rx) = broadcast::channel(4);
        let subscription = subscribe(&resolved, &NotificationHandler::new(data_tx)).await.unwrap();
        assert_eq!(characteristic.live_value_hooks(), 1);
        subscription.unhook().await;
    }
}
