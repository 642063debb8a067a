//! Pairing helper
//! Pair, unpair and query pairing state of devices by id or address.

use std::sync::Arc;

use log::{info, warn};

use crate::core::bluetooth::platform::{BleDevice, BlePlatform, PairingStatus};
use crate::core::bluetooth::types::{PairingResult, format_device_address};

/// Pairing operations outside of a session.
#[derive(Clone)]
pub struct PairingHelper {
    platform: Arc<dyn BlePlatform>,
}

enum DeviceRef<'a> {
    Id(&'a str),
    Address(u64),
}

impl DeviceRef<'_> {
    fn not_found(&self) -> PairingResult {
        let status = match self {
            DeviceRef::Id(id) => format!("Device Id:{} not found", id),
            DeviceRef::Address(address) => format!("Device address:{} not found", format_device_address(*address)),
        };
        warn!("{}", status);
        PairingResult { status }
    }
}

impl PairingHelper {
    pub fn new(platform: Arc<dyn BlePlatform>) -> Self {
        Self { platform }
    }

    async fn device(&self, device: &DeviceRef<'_>) -> Option<Arc<dyn BleDevice>> {
        match device {
            DeviceRef::Id(id) => self.platform.device_from_id(id).await,
            DeviceRef::Address(address) => self.platform.device_from_address(*address).await,
        }
    }

    pub async fn is_paired(&self, device_id: &str) -> bool {
        self.paired(DeviceRef::Id(device_id)).await
    }

    pub async fn is_paired_by_address(&self, address: u64) -> bool {
        self.paired(DeviceRef::Address(address)).await
    }

    pub async fn pair_device(&self, device_id: &str) -> PairingResult {
        self.pair(DeviceRef::Id(device_id)).await
    }

    pub async fn pair_device_by_address(&self, address: u64) -> PairingResult {
        self.pair(DeviceRef::Address(address)).await
    }

    pub async fn unpair_device(&self, device_id: &str) -> PairingResult {
        self.unpair(DeviceRef::Id(device_id)).await
    }

    pub async fn unpair_device_by_address(&self, address: u64) -> PairingResult {
        self.unpair(DeviceRef::Address(address)).await
    }

    async fn paired(&self, device_ref: DeviceRef<'_>) -> bool {
        match self.device(&device_ref).await {
            Some(device) => {
                let paired = device.pairing_state().await.is_paired;
                device.close().await;
                paired
            }
            None => false,
        }
    }

    async fn pair(&self, device_ref: DeviceRef<'_>) -> PairingResult {
        let Some(device) = self.device(&device_ref).await else {
            return device_ref.not_found();
        };
        let pairing = device.pairing_state().await;
        let status = if pairing.is_paired {
            PairingStatus::AlreadyPaired
        } else if !pairing.can_pair {
            PairingStatus::NotReadyToPair
        } else {
            device.pair_confirm_only().await
        };
        info!("Pairing {}: {}", device.id(), status);
        device.close().await;
        status.into()
    }

    async fn unpair(&self, device_ref: DeviceRef<'_>) -> PairingResult {
        let Some(device) = self.device(&device_ref).await else {
            return device_ref.not_found();
        };
        let status = device.unpair().await;
        info!("Unpairing {}: {}", device.id(), status);
        device.close().await;
        status.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bluetooth::mock::{MockDevice, MockPlatform};
    use crate::core::bluetooth::platform::PairingState;

    const DEVICE_ID: &str = "BluetoothLE#BluetoothLE00:11:22:33:44:55-aa:bb:cc:dd:ee:ff";

    fn helper() -> (PairingHelper, Arc<MockDevice>) {
        let platform = MockPlatform::new();
        let device = MockDevice::new(DEVICE_ID, "HRM");
        platform.add_device(device.clone());
        (PairingHelper::new(platform), device)
    }

    #[tokio::test]
    async fn pairs_and_unpairs_by_id() {
        let (helper, device) = helper();
        assert!(!helper.is_paired(DEVICE_ID).await);

        assert_eq!(helper.pair_device(DEVICE_ID).await.status, "Paired");
        assert!(helper.is_paired(DEVICE_ID).await);
        assert_eq!(helper.pair_device(DEVICE_ID).await.status, "AlreadyPaired");
        assert_eq!(device.pair_calls(), 1);

        assert_eq!(helper.unpair_device(DEVICE_ID).await.status, "Unpaired");
        assert_eq!(helper.unpair_device(DEVICE_ID).await.status, "AlreadyUnpaired");
    }

    #[tokio::test]
    async fn resolves_devices_by_address() {
        let (helper, _device) = helper();
        assert_eq!(helper.pair_device_by_address(0xAABBCCDDEEFF).await.status, "Paired");
        assert!(helper.is_paired_by_address(0xAABBCCDDEEFF).await);
        assert_eq!(helper.unpair_device_by_address(0xAABBCCDDEEFF).await.status, "Unpaired");
    }

    #[tokio::test]
    async fn device_that_cannot_pair_is_not_ready() {
        let (helper, device) = helper();
        device.set_pairing(PairingState { can_pair: false, is_paired: false });
        assert_eq!(helper.pair_device(DEVICE_ID).await.status, "NotReadyToPair");
        assert_eq!(device.pair_calls(), 0);
    }

    #[tokio::test]
    async fn unknown_devices_are_reported() {
        let (helper, _device) = helper();
        assert_eq!(helper.pair_device("missing").await.status, "Device Id:missing not found");
        assert_eq!(
            helper.unpair_device_by_address(0x1).await.status,
            "Device address:00:00:00:00:00:01 not found"
        );
        assert!(!helper.is_paired("missing").await);
    }
}
