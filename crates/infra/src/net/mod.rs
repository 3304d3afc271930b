//! Network transports

pub mod udp_clock;

pub use udp_clock::UdpClockTransport;
