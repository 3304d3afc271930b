//! Bluetooth device directory
//!
//! A stateful cache over the Bluetooth stack. It is the single writer of
//! [`BluetoothDevice`] records; everyone else reads snapshots.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use crate::domain::audio::BackendError;
use crate::domain::bluetooth::{
    BluetoothDevice, BluetoothStack, ConnectionState, MacAddress, SignalQuality,
};
use crate::domain::config::RetryPolicy;

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("Unknown device: {0}")]
    UnknownDevice(MacAddress),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

pub type Result<T> = std::result::Result<T, DirectoryError>;

pub struct DeviceDirectory {
    stack: Arc<dyn BluetoothStack>,
    scan_retry: RetryPolicy,
    devices: RwLock<BTreeMap<MacAddress, BluetoothDevice>>,
}

impl DeviceDirectory {
    pub fn new(stack: Arc<dyn BluetoothStack>, scan_retry: RetryPolicy) -> Self {
        Self {
            stack,
            scan_retry,
            devices: RwLock::new(BTreeMap::new()),
        }
    }

    /// Merge the stack's device list and per-device details into the directory
    ///
    /// Devices that are already known keep their connection state unless the
    /// stack vouches for a newer one.
    #[instrument(skip(self))]
    pub async fn scan(&self) -> Result<Vec<BluetoothDevice>> {
        let found = self.scan_with_retry().await?;

        let mut merged = Vec::with_capacity(found.len());
        for mut device in found {
            match self.stack.info(&device.mac).await {
                Ok(info) => {
                    device.supports_audio = device.supports_audio || info.supports_audio();
                    if let Some(name) = info.name.as_ref().filter(|n| !n.is_empty()) {
                        device.name = name.clone();
                    }
                    if let Some(state) = info.connection_state() {
                        device.connection_state = state;
                    }
                    if info.rssi.is_some() {
                        device.signal_strength = info.rssi;
                    }
                }
                Err(e) => debug!(mac = %device.mac, error = %e, "No device info"),
            }
            merged.push(device);
        }

        let mut devices = self.devices.write().await;
        for device in &merged {
            devices
                .entry(device.mac.clone())
                .and_modify(|known| {
                    known.name = device.name.clone();
                    known.supports_audio = device.supports_audio;
                    if device.connection_state != ConnectionState::Discovered {
                        known.connection_state = device.connection_state;
                    }
                    if device.signal_strength.is_some() {
                        known.signal_strength = device.signal_strength;
                    }
                })
                .or_insert_with(|| device.clone());
        }
        info!(found = merged.len(), known = devices.len(), "Bluetooth scan finished");
        Ok(merged)
    }

    pub async fn audio_capable_devices(&self) -> Vec<BluetoothDevice> {
        self.devices
            .read()
            .await
            .values()
            .filter(|device| device.supports_audio)
            .cloned()
            .collect()
    }

    /// Poll the RSSI of a device and store it
    ///
    /// `Ok(None)` when the stack has no reading; the stored value is cleared
    /// rather than replaced with a sentinel.
    pub async fn update_signal(&self, mac: &MacAddress) -> Result<Option<i16>> {
        let rssi = self.stack.rssi(mac).await?;
        let mut devices = self.devices.write().await;
        let device = devices
            .get_mut(mac)
            .ok_or_else(|| DirectoryError::UnknownDevice(mac.clone()))?;
        device.signal_strength = rssi;
        Ok(rssi)
    }

    pub async fn signal_quality(&self, mac: &MacAddress) -> Option<SignalQuality> {
        self.devices
            .read()
            .await
            .get(mac)
            .map(BluetoothDevice::signal_quality)
    }

    /// Devices currently in `Connected` state
    pub async fn active_devices(&self) -> BTreeSet<MacAddress> {
        self.devices
            .read()
            .await
            .values()
            .filter(|device| device.connection_state == ConnectionState::Connected)
            .map(|device| device.mac.clone())
            .collect()
    }

    /// Record a successful connect, creating the entry for unscanned devices
    pub async fn mark_connected(&self, mac: &MacAddress) {
        let mut devices = self.devices.write().await;
        let device = devices
            .entry(mac.clone())
            .or_insert_with(|| BluetoothDevice {
                supports_audio: true,
                ..BluetoothDevice::discovered(mac.clone(), mac.as_str())
            });
        device.connection_state = ConnectionState::Connected;
        info!(mac = %mac, "Device connected");
    }

    pub async fn mark_disconnected(&self, mac: &MacAddress) -> Result<()> {
        let mut devices = self.devices.write().await;
        let device = devices
            .get_mut(mac)
            .ok_or_else(|| DirectoryError::UnknownDevice(mac.clone()))?;
        device.connection_state = ConnectionState::Disconnected;
        info!(mac = %mac, "Device disconnected");
        Ok(())
    }

    /// Drop a device; returns the removed record
    pub async fn forget(&self, mac: &MacAddress) -> Option<BluetoothDevice> {
        let removed = self.devices.write().await.remove(mac);
        if removed.is_some() {
            debug!(mac = %mac, "Device forgotten");
        }
        removed
    }

    pub async fn device(&self, mac: &MacAddress) -> Option<BluetoothDevice> {
        self.devices.read().await.get(mac).cloned()
    }

    pub async fn snapshot(&self) -> Vec<BluetoothDevice> {
        self.devices.read().await.values().cloned().collect()
    }

    async fn scan_with_retry(&self) -> Result<Vec<BluetoothDevice>> {
        let attempts = self.scan_retry.attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.stack.scan().await {
                Ok(found) => return Ok(found),
                Err(e) if attempt < attempts => {
                    warn!(attempt, error = %e, "Bluetooth scan failed, retrying");
                    tokio::time::sleep(self.scan_retry.backoff()).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}
