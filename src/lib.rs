//! GATT monitor library
//! Connects to a Bluetooth LE peripheral, streams framed notifications from
//! one characteristic, and watches nearby devices with their signal strength.

// Module declarations
pub mod config;
pub mod core;
pub mod logging;
pub mod state;
pub mod utils;
