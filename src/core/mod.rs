//! Core functionality for the GATT monitor
//! This module contains the Bluetooth LE session and discovery machinery

pub mod bluetooth;

// Re-export commonly used types
pub use bluetooth::{DeviceWatcher, SessionManager};
