//! Bluetooth stack backends

pub mod bluetoothctl;

pub use bluetoothctl::{BluetoothCtl, BluetoothCtlTimeouts};
