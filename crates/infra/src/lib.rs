//! House Audio Infrastructure Layer
//!
//! Platform-specific implementations of the capabilities defined in
//! `house-audio-core`: the PipeWire audio graph, the BlueZ stack, the UDP
//! clock transport and hardware identity lookup.

pub mod audio;
pub mod bluetooth;
pub mod command;
pub mod hardware;
pub mod net;

pub use audio::PipeWireCli;
pub use bluetooth::BluetoothCtl;
pub use command::{CommandOutput, CommandRunner, TokioCommandRunner};
pub use net::UdpClockTransport;
