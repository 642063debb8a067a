//! Named GATT attributes and the per-connection attribute cache.

use std::sync::Arc;

use uuid::Uuid;

use crate::core::bluetooth::constants::*;
use crate::core::bluetooth::platform::{GattCharacteristic, GattService};

/// Native handle behind an attribute.
#[derive(Clone)]
pub enum AttributeHandle {
    Service(Arc<dyn GattService>),
    Characteristic(Arc<dyn GattCharacteristic>),
}

/// A service or characteristic together with its display name.
#[derive(Clone)]
pub struct Attribute {
    pub name: String,
    pub handle: AttributeHandle,
}

impl Attribute {
    pub fn from_service(service: Arc<dyn GattService>) -> Self {
        Self {
            name: service_name(service.uuid()),
            handle: AttributeHandle::Service(service),
        }
    }

    pub fn from_characteristic(characteristic: Arc<dyn GattCharacteristic>) -> Self {
        let name = match characteristic.user_description() {
            Some(description) if !description.is_empty() => description,
            _ => characteristic_name(characteristic.uuid()),
        };
        Self {
            name,
            handle: AttributeHandle::Characteristic(characteristic),
        }
    }

    pub fn service(&self) -> Option<&Arc<dyn GattService>> {
        match &self.handle {
            AttributeHandle::Service(service) => Some(service),
            AttributeHandle::Characteristic(_) => None,
        }
    }

    pub fn characteristic(&self) -> Option<&Arc<dyn GattCharacteristic>> {
        match &self.handle {
            AttributeHandle::Characteristic(characteristic) => Some(characteristic),
            AttributeHandle::Service(_) => None,
        }
    }

    /// Releases the service handle: the service itself, or the owning
    /// service of a characteristic.
    pub async fn release_service(&self) {
        match &self.handle {
            AttributeHandle::Service(service) => service.close().await,
            AttributeHandle::Characteristic(characteristic) => characteristic.service().close().await,
        }
    }
}

/// Display name of a service UUID.
pub fn service_name(uuid: Uuid) -> String {
    let known = match uuid {
        UUID_GENERIC_ACCESS_SERVICE => GENERIC_ACCESS_NAME,
        UUID_GENERIC_ATTRIBUTE_SERVICE => "GenericAttribute",
        UUID_DEVICE_INFORMATION_SERVICE => "DeviceInformation",
        UUID_HEART_RATE_SERVICE => "HeartRate",
        UUID_BATTERY_SERVICE => "Battery",
        UUID_CYCLING_POWER_SERVICE => "CyclingPower",
        UUID_CYCLING_SPEED_AND_CADENCE_SERVICE => "CyclingSpeedAndCadence",
        UUID_RUNNING_SPEED_AND_CADENCE_SERVICE => "RunningSpeedAndCadence",
        _ => return format!("Custom Service: {}", uuid),
    };
    known.to_string()
}

/// Display name of a characteristic UUID.
pub fn characteristic_name(uuid: Uuid) -> String {
    let known = match uuid {
        UUID_DEVICE_NAME => DEVICE_NAME_CHARACTERISTIC,
        UUID_APPEARANCE => "Appearance",
        UUID_SERVICE_CHANGED => "ServiceChanged",
        UUID_BATTERY_LEVEL => "BatteryLevel",
        UUID_MODEL_NUMBER => "ModelNumberString",
        UUID_SERIAL_NUMBER => "SerialNumberString",
        UUID_FIRMWARE_REVISION => "FirmwareRevisionString",
        UUID_HARDWARE_REVISION => "HardwareRevisionString",
        UUID_SOFTWARE_REVISION => "SoftwareRevisionString",
        UUID_MANUFACTURER_NAME => "ManufacturerNameString",
        UUID_HEART_RATE_MEASUREMENT => "HeartRateMeasurement",
        UUID_BODY_SENSOR_LOCATION => "BodySensorLocation",
        UUID_HEART_RATE_CONTROL_POINT => "HeartRateControlPoint",
        UUID_CYCLING_POWER_MEASUREMENT => "CyclingPowerMeasurement",
        UUID_CSC_MEASUREMENT => "CscMeasurement",
        UUID_RSC_MEASUREMENT => "RscMeasurement",
        _ => return format!("Custom Characteristic: {}", uuid),
    };
    known.to_string()
}

/// Services of the connected device, rebuilt on every connect.
#[derive(Clone, Default)]
pub struct AttributeCache {
    attributes: Vec<Attribute>,
}

impl AttributeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend_services(&mut self, services: Vec<Arc<dyn GattService>>) {
        self.attributes.extend(services.into_iter().map(Attribute::from_service));
    }

    /// First attribute with exactly this name. Which one wins when several
    /// share a name is undefined.
    pub fn find(&self, name: &str) -> Option<&Attribute> {
        find_by_name(&self.attributes, name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Attribute> {
        self.attributes.iter()
    }

    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    /// Releases every cached service handle and empties the cache.
    pub async fn release_all(&mut self) {
        for attribute in self.attributes.drain(..) {
            attribute.release_service().await;
        }
    }
}

pub(crate) fn find_by_name<'a>(attributes: &'a [Attribute], name: &str) -> Option<&'a Attribute> {
    attributes.iter().find(|a| a.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_well_known_uuids() {
        assert_eq!(service_name(UUID_HEART_RATE_SERVICE), "HeartRate");
        assert_eq!(service_name(UUID_GENERIC_ACCESS_SERVICE), "GenericAccess");
        assert_eq!(characteristic_name(UUID_HEART_RATE_MEASUREMENT), "HeartRateMeasurement");
        assert_eq!(characteristic_name(UUID_DEVICE_NAME), "DeviceName");
    }

    #[test]
    fn names_custom_uuids() {
        let uuid = Uuid::from_u128(0x4f63756c_7573_2054_6872_65656d6f7465);
        assert_eq!(service_name(uuid), format!("Custom Service: {}", uuid));
        assert_eq!(characteristic_name(uuid), format!("Custom Characteristic: {}", uuid));
    }
}
