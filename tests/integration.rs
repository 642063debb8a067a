use std::collections::HashMap;

use gatt_monitor::config::MonitorConfig;
use gatt_monitor::core::bluetooth::{
    AdvertisementSample, ConnectionResult, ErrorKind, GattError, OUT_OF_RANGE_RSSI, SIGNAL_TABLE_CAPACITY,
    SignalStrengthTable, UNKNOWN_SIGNAL_STRENGTH, frame_notification, parse_device_address,
};

fn sample(address: u64, rssi: i16) -> AdvertisementSample {
    AdvertisementSample { address, raw_signal_strength_dbm: rssi }
}

#[test]
fn notification_frame_has_reserved_and_length_prefix() {
    assert_eq!(frame_notification(&[0x01, 0x02, 0x03]), vec![0x00, 0x03, 0x01, 0x02, 0x03]);
}

#[test]
fn address_comes_from_trailing_mac() {
    assert_eq!(
        parse_device_address("BluetoothLE#BluetoothLE11:22:33:44:55:66-AA:BB:CC:DD:EE:FF"),
        Some(0xAABBCCDDEEFF)
    );
    assert_eq!(parse_device_address("no address here"), None);
}

#[test]
fn signal_table_resets_when_full() {
    let table = SignalStrengthTable::new();
    for address in 0..SIGNAL_TABLE_CAPACITY as u64 {
        table.record(sample(address, -70));
    }
    table.record(sample(42, OUT_OF_RANGE_RSSI));
    assert!(table.is_empty());

    table.record(sample(7, -65));
    table.record(sample(8, OUT_OF_RANGE_RSSI));
    assert_eq!(table.snapshot(), HashMap::from([(7, -65)]));
    assert_eq!(table.get(8), UNKNOWN_SIGNAL_STRENGTH);
}

#[test]
fn failure_result_hides_platform_codes() {
    let result = ConnectionResult::failure("dev", &GattError::DeviceUnreachable("Unreachable".into()));
    assert_eq!(result.error_kind, Some(ErrorKind::DeviceUnreachable));
    assert_eq!(
        result.error_message.as_deref(),
        Some("Device is unreachable (i.e. out of range or shutoff)")
    );
    let json = serde_json::to_value(&result).unwrap();
    assert_eq!(json["has_error"], serde_json::Value::Bool(true));
}

#[tokio::test]
async fn config_round_trips_through_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("conf").join("monitor.json");
    let config = MonitorConfig {
        service_name: "Battery".to_string(),
        characteristic_name: "BatteryLevel".to_string(),
        ..Default::default()
    };
    config.save_config(&path).await.unwrap();
    assert_eq!(MonitorConfig::load_config(&path).await.unwrap(), config);
}
