//! Core of a house audio node: clock sync, audio routing, the Bluetooth
//! device directory and the node orchestrator that runs them together.

pub mod domain;
pub mod testing;

pub use domain::*;
