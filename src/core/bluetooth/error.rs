//! Error types for GATT session and discovery operations.

use serde::Serialize;
use thiserror::Error;

use crate::core::bluetooth::platform::GattStatus;

/// Failures of the connect, subscribe and device-info paths.
///
/// Messages are meant for users; raw platform codes only ever appear as the
/// name of a [`GattStatus`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GattError {
    #[error("Could not find specified device")]
    DeviceNotFound(String),

    /// Service enumeration failed: out of range, powered off or similar.
    #[error("Device is unreachable (i.e. out of range or shutoff)")]
    DeviceUnreachable(String),

    #[error("Cannot find {0} service")]
    ServiceNotFound(String),

    #[error("Cannot find {0} characteristic")]
    CharacteristicNotFound(String),

    #[error("{0}")]
    DescriptorFetchFailed(GattStatus),

    #[error("{0} characteristic does not support notify")]
    NotifyUnsupported(String),

    #[error("{0}")]
    ConfigWriteFailed(GattStatus),

    #[error("Pairing failed: {0}")]
    PairingFailed(String),

    #[error("Operation was cancelled")]
    Cancelled,

    #[error("No device connected")]
    NotConnected,

    #[error("Writing {0} characteristic failed")]
    WriteFailed(String),

    #[error("Reading {0} characteristic failed")]
    ReadFailed(String),
}

/// Serializable discriminant of [`GattError`], carried by results that cross
/// the caller boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    DeviceNotFound,
    DeviceUnreachable,
    ServiceNotFound,
    CharacteristicNotFound,
    DescriptorFetchFailed,
    NotifyUnsupported,
    ConfigWriteFailed,
    PairingFailed,
    Cancelled,
    NotConnected,
    WriteFailed,
    ReadFailed,
}

impl GattError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::DeviceNotFound(_) => ErrorKind::DeviceNotFound,
            Self::DeviceUnreachable(_) => ErrorKind::DeviceUnreachable,
            Self::ServiceNotFound(_) => ErrorKind::ServiceNotFound,
            Self::CharacteristicNotFound(_) => ErrorKind::CharacteristicNotFound,
            Self::DescriptorFetchFailed(_) => ErrorKind::DescriptorFetchFailed,
            Self::NotifyUnsupported(_) => ErrorKind::NotifyUnsupported,
            Self::ConfigWriteFailed(_) => ErrorKind::ConfigWriteFailed,
            Self::PairingFailed(_) => ErrorKind::PairingFailed,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::NotConnected => ErrorKind::NotConnected,
            Self::WriteFailed(_) => ErrorKind::WriteFailed,
            Self::ReadFailed(_) => ErrorKind::ReadFailed,
        }
    }
}

pub type GattResult<T> = std::result::Result<T, GattError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bluetooth::platform::PairingStatus;

    #[test]
    fn messages_name_the_missing_attribute() {
        let err = GattError::ServiceNotFound("HeartRate".to_string());
        assert_eq!(err.to_string(), "Cannot find HeartRate service");
        assert_eq!(err.kind(), ErrorKind::ServiceNotFound);

        let err = GattError::NotifyUnsupported("BatteryLevel".to_string());
        assert_eq!(err.to_string(), "BatteryLevel characteristic does not support notify");
    }

    #[test]
    fn status_failures_surface_the_status_name() {
        let err = GattError::DescriptorFetchFailed(GattStatus::Unreachable);
        assert_eq!(err.to_string(), "Unreachable");
        assert_eq!(err.kind(), ErrorKind::DescriptorFetchFailed);
    }

    #[test]
    fn pairing_failure_names_the_status() {
        let err = GattError::PairingFailed(PairingStatus::NotReadyToPair.to_string());
        assert_eq!(err.to_string(), "Pairing failed: NotReadyToPair");
        assert_eq!(err.kind(), ErrorKind::PairingFailed);
    }
}
