//! In-memory collaborators for tests and local experiments
//!
//! Each double keeps its state behind a mutex and exposes knobs to inject
//! failures, so the engines can be exercised without PipeWire, BlueZ or a
//! real network.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::domain::audio::{
    AudioBackend, BackendError, BackendResult, Channel, ChannelLink, DeviceId, OutputDevice,
    Volume,
};
use crate::domain::bluetooth::{BluetoothDevice, BluetoothStack, DeviceInfo, MacAddress};
use crate::domain::clock::{ClockMessage, ClockTransport, TimeSource, Timestamp, TransportError};
use crate::domain::network::{NetworkProbe, NetworkStats};

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct AudioState {
    outputs: Vec<OutputDevice>,
    scripted_outputs: VecDeque<BackendResult<Vec<OutputDevice>>>,
    links: HashSet<ChannelLink>,
    volumes: HashMap<DeviceId, f32>,
    failing_links: HashSet<(DeviceId, Channel)>,
    failing_volume_writes: HashSet<DeviceId>,
    fail_volume_reads: bool,
    default_output: Option<DeviceId>,
    list_calls: usize,
    link_calls: usize,
}

/// Audio graph kept in memory
#[derive(Default)]
pub struct MemoryAudioBackend {
    state: Mutex<AudioState>,
}

impl MemoryAudioBackend {
    pub fn new(outputs: Vec<OutputDevice>) -> Self {
        let volumes = outputs
            .iter()
            .map(|output| (output.id.clone(), output.current_volume.get()))
            .collect();
        Self {
            state: Mutex::new(AudioState {
                outputs,
                volumes,
                ..Default::default()
            }),
        }
    }

    pub fn set_outputs(&self, outputs: Vec<OutputDevice>) {
        locked(&self.state).outputs = outputs;
    }

    /// Answers for the next `list_outputs` calls, in order
    pub fn script_outputs(&self, answers: Vec<BackendResult<Vec<OutputDevice>>>) {
        locked(&self.state).scripted_outputs.extend(answers);
    }

    pub fn fail_link(&self, device: &DeviceId, channel: Channel) {
        locked(&self.state)
            .failing_links
            .insert((device.clone(), channel));
    }

    pub fn fail_volume_writes(&self, device: &DeviceId) {
        locked(&self.state)
            .failing_volume_writes
            .insert(device.clone());
    }

    pub fn fail_volume_reads(&self, fail: bool) {
        locked(&self.state).fail_volume_reads = fail;
    }

    pub fn set_default_output(&self, device: Option<DeviceId>) {
        locked(&self.state).default_output = device;
    }

    /// Remove a link behind the engine's back
    pub fn drop_link(&self, link: &ChannelLink) {
        locked(&self.state).links.remove(link);
    }

    pub fn clear_links(&self) {
        locked(&self.state).links.clear();
    }

    pub fn active_links(&self) -> HashSet<ChannelLink> {
        locked(&self.state).links.clone()
    }

    pub fn volume(&self, device: &DeviceId) -> Option<f32> {
        locked(&self.state).volumes.get(device).copied()
    }

    pub fn list_calls(&self) -> usize {
        locked(&self.state).list_calls
    }

    pub fn link_calls(&self) -> usize {
        locked(&self.state).link_calls
    }
}

#[async_trait]
impl AudioBackend for MemoryAudioBackend {
    async fn list_outputs(&self) -> BackendResult<Vec<OutputDevice>> {
        let mut state = locked(&self.state);
        state.list_calls += 1;
        match state.scripted_outputs.pop_front() {
            Some(answer) => answer,
            None => Ok(state.outputs.clone()),
        }
    }

    async fn link(&self, link: &ChannelLink) -> BackendResult<()> {
        let mut state = locked(&self.state);
        state.link_calls += 1;
        let device = &link.target.device;
        if !state.outputs.iter().any(|output| &output.id == device) {
            return Err(BackendError::CommandFailed(format!("no such port: {link}")));
        }
        if state
            .failing_links
            .contains(&(device.clone(), link.target.channel))
        {
            return Err(BackendError::CommandFailed(format!("failed to link {link}")));
        }
        state.links.insert(link.clone());
        Ok(())
    }

    async fn unlink(&self, link: &ChannelLink) -> BackendResult<()> {
        locked(&self.state).links.remove(link);
        Ok(())
    }

    async fn list_active_links(&self) -> BackendResult<HashSet<ChannelLink>> {
        Ok(locked(&self.state).links.clone())
    }

    async fn set_volume(&self, device: &DeviceId, volume: Volume) -> BackendResult<()> {
        let mut state = locked(&self.state);
        if state.failing_volume_writes.contains(device) {
            return Err(BackendError::CommandFailed(format!("cannot set volume of {device}")));
        }
        state.volumes.insert(device.clone(), volume.get());
        Ok(())
    }

    async fn get_volume(&self, device: &DeviceId) -> BackendResult<Option<f32>> {
        let state = locked(&self.state);
        if state.fail_volume_reads {
            return Err(BackendError::Unavailable("volume reads disabled".to_string()));
        }
        Ok(state.volumes.get(device).copied())
    }

    async fn default_output(&self) -> BackendResult<Option<DeviceId>> {
        Ok(locked(&self.state).default_output.clone())
    }
}

#[derive(Default)]
struct BluetoothState {
    devices: BTreeMap<MacAddress, DeviceInfo>,
    rssi: HashMap<MacAddress, Option<i16>>,
    refused: HashSet<MacAddress>,
    connect_delay: Option<Duration>,
    failing_scans: u32,
    scan_calls: usize,
    discoverable: Option<bool>,
    disconnected: Vec<MacAddress>,
}

/// Bluetooth stack kept in memory
#[derive(Default)]
pub struct MemoryBluetoothStack {
    state: Mutex<BluetoothState>,
}

impl MemoryBluetoothStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_device(&self, mac: MacAddress, info: DeviceInfo) {
        locked(&self.state).devices.insert(mac, info);
    }

    pub fn set_rssi(&self, mac: &MacAddress, rssi: Option<i16>) {
        locked(&self.state).rssi.insert(mac.clone(), rssi);
    }

    /// Make `connect` answer `false` for this device
    pub fn refuse_connect(&self, mac: &MacAddress) {
        locked(&self.state).refused.insert(mac.clone());
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        locked(&self.state).connect_delay = Some(delay);
    }

    /// Fail the next `count` scans
    pub fn fail_scans(&self, count: u32) {
        locked(&self.state).failing_scans = count;
    }

    pub fn scan_calls(&self) -> usize {
        locked(&self.state).scan_calls
    }

    /// Last value passed to `set_discoverable`
    pub fn discoverable(&self) -> Option<bool> {
        locked(&self.state).discoverable
    }

    pub fn disconnected(&self) -> Vec<MacAddress> {
        locked(&self.state).disconnected.clone()
    }

    pub fn is_connected(&self, mac: &MacAddress) -> bool {
        locked(&self.state)
            .devices
            .get(mac)
            .is_some_and(|info| info.connected)
    }
}

#[async_trait]
impl BluetoothStack for MemoryBluetoothStack {
    async fn scan(&self) -> BackendResult<Vec<BluetoothDevice>> {
        let mut state = locked(&self.state);
        state.scan_calls += 1;
        if state.failing_scans > 0 {
            state.failing_scans -= 1;
            return Err(BackendError::Unavailable("adapter not ready".to_string()));
        }
        Ok(state
            .devices
            .iter()
            .map(|(mac, info)| {
                let name = info.name.clone().unwrap_or_else(|| mac.to_string());
                BluetoothDevice::discovered(mac.clone(), name)
            })
            .collect())
    }

    async fn info(&self, mac: &MacAddress) -> BackendResult<DeviceInfo> {
        locked(&self.state)
            .devices
            .get(mac)
            .cloned()
            .ok_or_else(|| BackendError::CommandFailed(format!("Device {mac} not available")))
    }

    async fn connect(&self, mac: &MacAddress) -> BackendResult<bool> {
        let delay = locked(&self.state).connect_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = locked(&self.state);
        if state.refused.contains(mac) {
            return Ok(false);
        }
        let info = state.devices.entry(mac.clone()).or_default();
        info.trusted = true;
        info.paired = true;
        info.connected = true;
        Ok(true)
    }

    async fn disconnect(&self, mac: &MacAddress) -> BackendResult<bool> {
        let mut state = locked(&self.state);
        state.disconnected.push(mac.clone());
        if let Some(info) = state.devices.get_mut(mac) {
            info.connected = false;
        }
        Ok(true)
    }

    async fn set_discoverable(&self, enabled: bool) -> BackendResult<bool> {
        locked(&self.state).discoverable = Some(enabled);
        Ok(true)
    }

    async fn rssi(&self, mac: &MacAddress) -> BackendResult<Option<i16>> {
        let state = locked(&self.state);
        Ok(match state.rssi.get(mac) {
            Some(rssi) => *rssi,
            None => state.devices.get(mac).and_then(|info| info.rssi),
        })
    }
}

type Datagram = (ClockMessage, SocketAddr);

#[derive(Default)]
struct NetworkState {
    next_host: u8,
    sockets: HashMap<SocketAddr, mpsc::UnboundedSender<Datagram>>,
}

/// A broadcast domain of in-memory clock endpoints
///
/// Broadcasts reach every endpoint bound to the same port, the sender
/// included, the way a UDP broadcast loops back on a real host.
#[derive(Clone, Default)]
pub struct MemoryClockNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryClockNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// A new host on the network with its own address
    pub fn endpoint(&self) -> MemoryClockTransport {
        let host = {
            let mut state = locked(&self.state);
            state.next_host = state.next_host.wrapping_add(1);
            state.next_host
        };
        MemoryClockTransport {
            network: self.clone(),
            ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, host)),
            addr: Mutex::new(None),
            rx: tokio::sync::Mutex::new(None),
        }
    }
}

pub struct MemoryClockTransport {
    network: MemoryClockNetwork,
    ip: IpAddr,
    addr: Mutex<Option<SocketAddr>>,
    rx: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<Datagram>>>,
}

impl MemoryClockTransport {
    /// Address once bound
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *locked(&self.addr)
    }

    fn bound_addr(&self) -> Result<SocketAddr, TransportError> {
        self.local_addr().ok_or(TransportError::NotBound)
    }
}

#[async_trait]
impl ClockTransport for MemoryClockTransport {
    async fn bind(&self, port: u16) -> Result<(), TransportError> {
        let addr = SocketAddr::new(self.ip, port);
        let in_use = || TransportError::Bind {
            port,
            source: io::Error::new(io::ErrorKind::AddrInUse, "address already in use"),
        };
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut own = locked(&self.addr);
            let mut network = locked(&self.network.state);
            if own.is_some() || network.sockets.contains_key(&addr) {
                return Err(in_use());
            }
            network.sockets.insert(addr, tx);
            *own = Some(addr);
        }
        *self.rx.lock().await = Some(rx);
        Ok(())
    }

    async fn broadcast(&self, message: &ClockMessage) -> Result<(), TransportError> {
        let from = self.bound_addr()?;
        let network = locked(&self.network.state);
        for (addr, tx) in &network.sockets {
            if addr.port() == from.port() {
                let _ = tx.send((*message, from));
            }
        }
        Ok(())
    }

    async fn send_to(&self, message: &ClockMessage, peer: SocketAddr) -> Result<(), TransportError> {
        let from = self.bound_addr()?;
        if let Some(tx) = locked(&self.network.state).sockets.get(&peer) {
            let _ = tx.send((*message, from));
        }
        Ok(())
    }

    async fn recv_timeout(&self, timeout: Duration) -> Result<Option<Datagram>, TransportError> {
        let mut rx = self.rx.lock().await;
        let rx = rx.as_mut().ok_or(TransportError::NotBound)?;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(datagram) => Ok(datagram),
            Err(_) => Ok(None),
        }
    }

    async fn close(&self) {
        let addr = locked(&self.addr).take();
        if let Some(addr) = addr {
            locked(&self.network.state).sockets.remove(&addr);
        }
        *self.rx.lock().await = None;
    }
}

/// A clock that only moves when told to
#[derive(Debug, Default)]
pub struct ManualTimeSource {
    nanos: AtomicI64,
}

impl ManualTimeSource {
    pub fn new(nanos: i64) -> Self {
        Self {
            nanos: AtomicI64::new(nanos),
        }
    }

    pub fn set(&self, at: Timestamp) {
        self.nanos.store(at.as_nanos(), Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        let by = i64::try_from(by.as_nanos()).unwrap_or(i64::MAX);
        self.nanos.fetch_add(by, Ordering::SeqCst);
    }
}

impl TimeSource for ManualTimeSource {
    fn now(&self) -> Timestamp {
        Timestamp(self.nanos.load(Ordering::SeqCst))
    }
}

/// Network probe reporting whatever the test sets
#[derive(Default)]
pub struct MemoryNetworkProbe {
    stats: Mutex<Option<NetworkStats>>,
    adjustments: Mutex<Vec<NetworkStats>>,
}

impl MemoryNetworkProbe {
    pub fn set_stats(&self, stats: Option<NetworkStats>) {
        *locked(&self.stats) = stats;
    }

    pub fn adjustments(&self) -> Vec<NetworkStats> {
        locked(&self.adjustments).clone()
    }
}

#[async_trait]
impl NetworkProbe for MemoryNetworkProbe {
    async fn stats(&self) -> BackendResult<Option<NetworkStats>> {
        Ok(*locked(&self.stats))
    }

    async fn adjust_buffer(&self, stats: NetworkStats) -> BackendResult<()> {
        locked(&self.adjustments).push(stats);
        Ok(())
    }
}
