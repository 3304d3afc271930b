//! Bluetooth device model and the Bluetooth stack capability

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::domain::audio::BackendResult;

/// RSSI at or below this value is considered a poor link
pub const POOR_SIGNAL_THRESHOLD_DBM: i16 = -80;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid MAC address: {0}")]
pub struct InvalidMac(pub String);

/// Hardware address of a Bluetooth device, normalized to `AA:BB:CC:DD:EE:FF`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddress(String);

impl MacAddress {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `AA_BB_CC_DD_EE_FF`, the form used in audio graph node names
    pub fn underscored(&self) -> String {
        self.0.replace(':', "_")
    }

    /// The 48-bit address as an integer
    pub fn to_u64(&self) -> u64 {
        self.0
            .split(':')
            .filter_map(|octet| u8::from_str_radix(octet, 16).ok())
            .fold(0u64, |acc, octet| (acc << 8) | u64::from(octet))
    }

    pub fn is_zero(&self) -> bool {
        self.to_u64() == 0
    }
}

impl FromStr for MacAddress {
    type Err = InvalidMac;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().replace('_', ":").to_ascii_uppercase();
        let octets: Vec<&str> = normalized.split(':').collect();
        let valid = octets.len() == 6
            && octets
                .iter()
                .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()));
        if valid {
            Ok(Self(normalized))
        } else {
            Err(InvalidMac(s.to_string()))
        }
    }
}

impl TryFrom<String> for MacAddress {
    type Error = InvalidMac;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MacAddress> for String {
    fn from(mac: MacAddress) -> Self {
        mac.0
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Discovered,
    Trusted,
    Paired,
    Connected,
    Disconnected,
}

/// Link quality derived solely from RSSI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalQuality {
    Good,
    Poor,
}

impl SignalQuality {
    /// A missing reading counts as `Poor`.
    pub fn from_rssi(rssi: Option<i16>) -> Self {
        match rssi {
            Some(dbm) if dbm > POOR_SIGNAL_THRESHOLD_DBM => SignalQuality::Good,
            _ => SignalQuality::Poor,
        }
    }
}

/// A Bluetooth device tracked by the directory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BluetoothDevice {
    pub mac: MacAddress,
    pub name: String,
    pub connection_state: ConnectionState,
    pub signal_strength: Option<i16>,
    pub supports_audio: bool,
}

impl BluetoothDevice {
    pub fn discovered(mac: MacAddress, name: impl Into<String>) -> Self {
        Self {
            mac,
            name: name.into(),
            connection_state: ConnectionState::Discovered,
            signal_strength: None,
            supports_audio: false,
        }
    }

    pub fn signal_quality(&self) -> SignalQuality {
        SignalQuality::from_rssi(self.signal_strength)
    }
}

/// Detailed information the stack reports for a single device
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub name: Option<String>,
    /// Device class description, e.g. `0x240404 (Audio/Video)`
    pub class: Option<String>,
    pub uuids: Vec<String>,
    pub paired: bool,
    pub trusted: bool,
    pub connected: bool,
    pub rssi: Option<i16>,
}

impl DeviceInfo {
    pub fn supports_audio(&self) -> bool {
        let class_audio = self
            .class
            .as_deref()
            .map(|class| class.contains("Audio"))
            .unwrap_or(false);
        class_audio
            || self
                .uuids
                .iter()
                .any(|uuid| uuid.contains("Audio Sink") || uuid.contains("Audio Source"))
    }

    /// The strongest state the info vouches for, if any
    pub fn connection_state(&self) -> Option<ConnectionState> {
        if self.connected {
            Some(ConnectionState::Connected)
        } else if self.paired {
            Some(ConnectionState::Paired)
        } else if self.trusted {
            Some(ConnectionState::Trusted)
        } else {
            None
        }
    }
}

/// Capability interface of the host Bluetooth stack
#[async_trait]
pub trait BluetoothStack: Send + Sync {
    /// Devices the stack currently knows about
    async fn scan(&self) -> BackendResult<Vec<BluetoothDevice>>;

    async fn info(&self, mac: &MacAddress) -> BackendResult<DeviceInfo>;

    /// Pair (if needed) and connect; `Ok(false)` when the device refused
    async fn connect(&self, mac: &MacAddress) -> BackendResult<bool>;

    async fn disconnect(&self, mac: &MacAddress) -> BackendResult<bool>;

    async fn set_discoverable(&self, enabled: bool) -> BackendResult<bool>;

    /// `Ok(None)` when no reading is available
    async fn rssi(&self, mac: &MacAddress) -> BackendResult<Option<i16>>;
}
