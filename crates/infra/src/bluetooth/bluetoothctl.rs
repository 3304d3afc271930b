//! BlueZ access through `bluetoothctl`

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use house_audio_core::domain::audio::{BackendError, BackendResult};
use house_audio_core::domain::bluetooth::{BluetoothDevice, BluetoothStack, DeviceInfo, MacAddress};

use crate::command::{CommandOutput, CommandRunner, TokioCommandRunner};

const PROGRAM: &str = "bluetoothctl";

/// `Device AA:BB:CC:DD:EE:FF Name` lines of `bluetoothctl devices`
pub fn parse_devices(output: &str) -> Vec<BluetoothDevice> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.trim().splitn(3, ' ');
            if parts.next()? != "Device" {
                return None;
            }
            let mac: MacAddress = parts.next()?.parse().ok()?;
            let name = parts.next().unwrap_or_default().trim();
            Some(BluetoothDevice::discovered(mac, name))
        })
        .collect()
}

/// RSSI as either `-60` or `0xffffffc4 (-60)`
fn parse_rssi(value: &str) -> Option<i16> {
    let value = value.trim();
    if let Some((_, decimal)) = value.split_once('(') {
        return decimal.trim_end_matches(')').trim().parse().ok();
    }
    value.parse().ok()
}

fn yes(value: &str) -> bool {
    value.trim() == "yes"
}

/// Key/value lines of `bluetoothctl info <mac>`
pub fn parse_info(output: &str) -> DeviceInfo {
    let mut info = DeviceInfo::default();
    for line in output.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "Name" => info.name = Some(value.to_string()),
            "Class" => info.class = Some(value.to_string()),
            "UUID" => info.uuids.push(value.to_string()),
            "Paired" => info.paired = yes(value),
            "Trusted" => info.trusted = yes(value),
            "Connected" => info.connected = yes(value),
            "RSSI" => info.rssi = parse_rssi(value),
            _ => {}
        }
    }
    info
}

/// Timeouts for the individual `bluetoothctl` steps
#[derive(Debug, Clone, Copy)]
pub struct BluetoothCtlTimeouts {
    pub command: Duration,
    pub pair: Duration,
    pub connect: Duration,
}

impl Default for BluetoothCtlTimeouts {
    fn default() -> Self {
        Self {
            command: Duration::from_secs(5),
            pair: Duration::from_secs(30),
            connect: Duration::from_secs(30),
        }
    }
}

/// [`BluetoothStack`] backed by the BlueZ command line client
pub struct BluetoothCtl {
    runner: Arc<dyn CommandRunner>,
    timeouts: BluetoothCtlTimeouts,
}

impl BluetoothCtl {
    pub fn new() -> Self {
        Self::with_runner(Arc::new(TokioCommandRunner))
    }

    pub fn with_runner(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            timeouts: BluetoothCtlTimeouts::default(),
        }
    }

    pub fn with_timeouts(mut self, timeouts: BluetoothCtlTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    async fn run(&self, args: &[&str], timeout: Duration) -> BackendResult<CommandOutput> {
        self.runner.run(PROGRAM, args, timeout).await
    }

    async fn run_checked(&self, args: &[&str]) -> BackendResult<CommandOutput> {
        let output = self.run(args, self.timeouts.command).await?;
        if output.success {
            Ok(output)
        } else {
            Err(BackendError::CommandFailed(format!(
                "{PROGRAM} {}: {}",
                args.join(" "),
                output.stderr.trim()
            )))
        }
    }

    /// Register a pairing agent so phones can pair without interaction
    ///
    /// Tries `DisplayOnly` first and falls back to `NoInputNoOutput`.
    pub async fn prepare_agent(&self) -> BackendResult<()> {
        let timeout = self.timeouts.command;
        self.run(&["agent", "off"], timeout).await?;

        let agent = self.run(&["agent", "DisplayOnly"], timeout).await?;
        if !agent.success {
            warn!(stderr = %agent.stderr.trim(), "DisplayOnly agent refused, using NoInputNoOutput");
            self.run_checked(&["agent", "NoInputNoOutput"]).await?;
        }
        self.run_checked(&["default-agent"]).await?;
        info!("Pairing agent ready");
        Ok(())
    }
}

impl Default for BluetoothCtl {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BluetoothStack for BluetoothCtl {
    async fn scan(&self) -> BackendResult<Vec<BluetoothDevice>> {
        let output = self.run_checked(&["devices"]).await?;
        let devices = parse_devices(&output.stdout);
        debug!(count = devices.len(), "Known Bluetooth devices");
        Ok(devices)
    }

    async fn info(&self, mac: &MacAddress) -> BackendResult<DeviceInfo> {
        let output = self.run_checked(&["info", mac.as_str()]).await?;
        Ok(parse_info(&output.stdout))
    }

    #[instrument(skip_all, fields(mac = %mac))]
    async fn connect(&self, mac: &MacAddress) -> BackendResult<bool> {
        let mac = mac.as_str();
        // Stale pairings make reconnects fail, start from scratch
        self.run(&["remove", mac], self.timeouts.command).await?;
        self.run_checked(&["trust", mac]).await?;

        let paired = self.run(&["pair", mac], self.timeouts.pair).await?;
        if !paired.success {
            debug!(stderr = %paired.stderr.trim(), "Pairing reported failure, trying to connect anyway");
        }

        let connected = self.run(&["connect", mac], self.timeouts.connect).await?;
        let ok = connected.combined().contains("Connection successful");
        if ok {
            info!("Device connected");
        } else {
            warn!(output = %connected.combined().trim(), "Device refused connection");
        }
        Ok(ok)
    }

    async fn disconnect(&self, mac: &MacAddress) -> BackendResult<bool> {
        let output = self.run(&["disconnect", mac.as_str()], self.timeouts.command).await?;
        Ok(output.combined().contains("Successful disconnected"))
    }

    async fn set_discoverable(&self, enabled: bool) -> BackendResult<bool> {
        let mode = if enabled { "on" } else { "off" };
        let discoverable = self.run(&["discoverable", mode], self.timeouts.command).await?;
        let pairable = self.run(&["pairable", mode], self.timeouts.command).await?;
        if enabled {
            self.run(&["discoverable-timeout", "0"], self.timeouts.command).await?;
        }
        Ok(discoverable.success && pairable.success)
    }

    async fn rssi(&self, mac: &MacAddress) -> BackendResult<Option<i16>> {
        Ok(self.info(mac).await?.rssi)
    }
}
