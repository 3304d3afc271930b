//! Audio graph backends
//!
//! A node drives PipeWire through its command line tools (`pw-dump`,
//! `pw-link`, `wpctl`). Links follow the BlueZ naming scheme, so a phone
//! connected over A2DP shows up as `bluez_source.<MAC>`.

pub mod pipewire;

pub use pipewire::*;
