//! Node orchestrator
//!
//! Composes the clock, routing and directory components with the Bluetooth
//! stack, drives the node lifecycle and runs the periodic monitors.

mod monitors;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::domain::audio::{AudioBackend, BackendError, DeviceId, OutputDevice, Volume};
use crate::domain::bluetooth::{BluetoothDevice, BluetoothStack, MacAddress};
use crate::domain::clock::{
    ClockSyncEngine, ClockTransport, Node, NodeId, SyncError, SystemTimeSource, TimeSource,
};
use crate::domain::config::{Mode, NodeConfig};
use crate::domain::directory::{DeviceDirectory, DirectoryError};
use crate::domain::handoff::{
    run_handoff, HandoffAdvisor, HandoffError, HandoffOutcome, HandoffPhases, HandoffRequest,
    NoHandoff, NodeAddress, SingleNodeHandoff,
};
use crate::domain::network::{NetworkProbe, NullNetworkProbe};
use crate::domain::routing::{Route, RouteId, RoutingEngine, RoutingError};

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Node is not running (currently {0:?})")]
    NotRunning(NodePhase),

    #[error("Node cannot start while {0:?}")]
    AlreadyStarted(NodePhase),

    #[error("Clock sync is enabled but no clock transport was supplied")]
    MissingClockTransport,

    #[error("Connecting {mac} timed out after {timeout:?}")]
    ConnectTimeout { mac: MacAddress, timeout: Duration },

    #[error("Device {0} refused the connection")]
    ConnectRefused(MacAddress),

    #[error("Device {0} did not disconnect")]
    DisconnectFailed(MacAddress),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Routing(#[from] RoutingError),

    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error(transparent)]
    Handoff(#[from] HandoffError),

    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] BackendError),
}

impl NodeError {
    /// Subsystem whose last-error slot this error belongs in
    pub fn subsystem(&self) -> Option<Subsystem> {
        match self {
            NodeError::NotRunning(_)
            | NodeError::AlreadyStarted(_)
            | NodeError::MissingClockTransport => None,
            NodeError::Sync(_) => Some(Subsystem::Clock),
            NodeError::Routing(_) => Some(Subsystem::Routing),
            NodeError::Handoff(_) => Some(Subsystem::Handoff),
            NodeError::ConnectTimeout { .. }
            | NodeError::ConnectRefused(_)
            | NodeError::DisconnectFailed(_)
            | NodeError::Directory(_)
            | NodeError::Bluetooth(_) => Some(Subsystem::Bluetooth),
        }
    }
}

pub type Result<T> = std::result::Result<T, NodeError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodePhase {
    Stopped,
    Starting,
    Running,
    Stopping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Subsystem {
    Clock,
    Routing,
    Bluetooth,
    Network,
    Handoff,
}

impl fmt::Display for Subsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Subsystem::Clock => "clock",
            Subsystem::Routing => "routing",
            Subsystem::Bluetooth => "bluetooth",
            Subsystem::Network => "network",
            Subsystem::Handoff => "handoff",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceAction {
    Connect,
    Disconnect,
}

impl FromStr for DeviceAction {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "connect" => Ok(DeviceAction::Connect),
            "disconnect" => Ok(DeviceAction::Disconnect),
            other => Err(format!("unknown device action: {other}")),
        }
    }
}

/// Read-only snapshot of the whole node
#[derive(Debug, Clone, Serialize)]
pub struct NodeState {
    pub node: Node,
    pub mode: Mode,
    pub phase: NodePhase,
    pub running: bool,
    pub routes: Vec<Route>,
    pub outputs: Vec<OutputDevice>,
    pub devices: Vec<BluetoothDevice>,
    pub last_errors: BTreeMap<Subsystem, String>,
}

/// External capabilities a node is built from
pub struct Collaborators {
    pub audio: Arc<dyn AudioBackend>,
    pub bluetooth: Arc<dyn BluetoothStack>,
    pub clock_transport: Option<Arc<dyn ClockTransport>>,
    pub time: Arc<dyn TimeSource>,
    pub network: Arc<dyn NetworkProbe>,
    pub handoff: Arc<dyn HandoffPhases>,
    pub advisor: Arc<dyn HandoffAdvisor>,
}

impl Collaborators {
    /// Single-node defaults: no clock transport, no network statistics, no handoff
    pub fn new(audio: Arc<dyn AudioBackend>, bluetooth: Arc<dyn BluetoothStack>) -> Self {
        Self {
            audio,
            bluetooth,
            clock_transport: None,
            time: Arc::new(SystemTimeSource),
            network: Arc::new(NullNetworkProbe),
            handoff: Arc::new(SingleNodeHandoff),
            advisor: Arc::new(NoHandoff),
        }
    }

    pub fn with_clock_transport(mut self, transport: Arc<dyn ClockTransport>) -> Self {
        self.clock_transport = Some(transport);
        self
    }

    pub fn with_time_source(mut self, time: Arc<dyn TimeSource>) -> Self {
        self.time = time;
        self
    }

    pub fn with_network_probe(mut self, network: Arc<dyn NetworkProbe>) -> Self {
        self.network = network;
        self
    }

    pub fn with_handoff_phases(mut self, handoff: Arc<dyn HandoffPhases>) -> Self {
        self.handoff = handoff;
        self
    }

    pub fn with_handoff_advisor(mut self, advisor: Arc<dyn HandoffAdvisor>) -> Self {
        self.advisor = advisor;
        self
    }
}

#[derive(Default)]
struct Lifecycle {
    cancel: Option<CancellationToken>,
    tasks: Vec<JoinHandle<()>>,
}

struct Inner {
    id: NodeId,
    config: NodeConfig,
    clock: Option<ClockSyncEngine>,
    routing: RoutingEngine,
    directory: DeviceDirectory,
    bluetooth: Arc<dyn BluetoothStack>,
    network: Arc<dyn NetworkProbe>,
    handoff: Arc<dyn HandoffPhases>,
    advisor: Arc<dyn HandoffAdvisor>,
    phase: RwLock<NodePhase>,
    state: RwLock<NodeState>,
    last_errors: RwLock<BTreeMap<Subsystem, String>>,
    lifecycle: Mutex<Lifecycle>,
}

/// Handle to a node; clones share the same node
#[derive(Clone)]
pub struct NodeOrchestrator {
    inner: Arc<Inner>,
}

impl NodeOrchestrator {
    pub fn new(id: NodeId, config: NodeConfig, collaborators: Collaborators) -> Result<Self> {
        let clock = if config.clock_enabled() {
            let transport = collaborators
                .clock_transport
                .ok_or(NodeError::MissingClockTransport)?;
            Some(ClockSyncEngine::new(
                id,
                config.clock.clone(),
                transport,
                collaborators.time.clone(),
            ))
        } else {
            None
        };

        let routing = RoutingEngine::new(collaborators.audio, config.routing.discovery);
        let directory =
            DeviceDirectory::new(collaborators.bluetooth.clone(), config.bluetooth.scan);
        let state = NodeState {
            node: Node::new(id),
            mode: config.mode,
            phase: NodePhase::Stopped,
            running: false,
            routes: Vec::new(),
            outputs: Vec::new(),
            devices: Vec::new(),
            last_errors: BTreeMap::new(),
        };

        Ok(Self {
            inner: Arc::new(Inner {
                id,
                config,
                clock,
                routing,
                directory,
                bluetooth: collaborators.bluetooth,
                network: collaborators.network,
                handoff: collaborators.handoff,
                advisor: collaborators.advisor,
                phase: RwLock::new(NodePhase::Stopped),
                state: RwLock::new(state),
                last_errors: RwLock::new(BTreeMap::new()),
                lifecycle: Mutex::new(Lifecycle::default()),
            }),
        })
    }

    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    pub async fn phase(&self) -> NodePhase {
        *self.inner.phase.read().await
    }

    /// Set up every subsystem and start the monitors
    ///
    /// A failing setup step is fatal: whatever was set up is torn down again
    /// and the node returns to `Stopped`.
    #[instrument(skip_all, fields(node = %self.inner.id))]
    pub async fn start(&self) -> Result<()> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        {
            let mut phase = self.inner.phase.write().await;
            if *phase != NodePhase::Stopped {
                return Err(NodeError::AlreadyStarted(*phase));
            }
            *phase = NodePhase::Starting;
        }
        info!(mode = ?self.inner.config.mode, "Starting node");

        if let Err(e) = self.setup().await {
            error!(error = %e, "Node setup failed");
            self.record_node_error(&e).await;
            self.teardown().await;
            *self.inner.phase.write().await = NodePhase::Stopped;
            self.refresh_state().await;
            return Err(e);
        }

        let cancel = CancellationToken::new();
        lifecycle.tasks = monitors::spawn_all(self, &cancel).await;
        lifecycle.cancel = Some(cancel);
        *self.inner.phase.write().await = NodePhase::Running;
        self.refresh_state().await;
        info!(monitors = lifecycle.tasks.len(), "Node running");
        Ok(())
    }

    /// Cancel the monitors, wait for them, then release every resource
    #[instrument(skip_all, fields(node = %self.inner.id))]
    pub async fn stop(&self) -> Result<()> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        {
            let mut phase = self.inner.phase.write().await;
            if *phase == NodePhase::Stopped {
                return Ok(());
            }
            *phase = NodePhase::Stopping;
        }
        info!("Stopping node");

        if let Some(cancel) = lifecycle.cancel.take() {
            cancel.cancel();
        }
        for handle in lifecycle.tasks.drain(..) {
            if let Err(e) = handle.await {
                warn!(error = %e, "Monitor task ended abnormally");
            }
        }

        self.teardown().await;
        *self.inner.phase.write().await = NodePhase::Stopped;
        self.refresh_state().await;
        info!("Node stopped");
        Ok(())
    }

    /// Start, wait for `shutdown`, stop
    pub async fn run<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        self.start().await?;
        shutdown.await;
        info!("Shutdown requested");
        self.stop().await
    }

    /// Connect or disconnect a Bluetooth source
    ///
    /// A connect pairs the device, waits for it to settle, routes it to the
    /// default output and applies the default volume. Returns the new route.
    #[instrument(skip_all, fields(mac = %mac))]
    pub async fn handle_bluetooth_device(
        &self,
        mac: &MacAddress,
        action: DeviceAction,
    ) -> Result<Option<RouteId>> {
        self.ensure_running().await?;
        let result = match action {
            DeviceAction::Connect => self.connect_device(mac).await.map(Some),
            DeviceAction::Disconnect => self.disconnect_device(mac).await.map(|()| None),
        };
        if let Err(e) = &result {
            self.record_node_error(e).await;
        }
        result
    }

    /// Move the stream of `mac` to another node
    #[instrument(skip_all, fields(mac = %mac, target = %target))]
    pub async fn handoff(&self, mac: &MacAddress, target: NodeAddress) -> Result<HandoffOutcome> {
        self.ensure_running().await?;
        let source_routes = self.inner.routing.routes_for_source(mac).await;
        if source_routes.is_empty() {
            return Err(RoutingError::NoRouteForSource(mac.clone()).into());
        }
        let request = HandoffRequest {
            mac: mac.clone(),
            target,
            source_routes,
        };

        let outcome = run_handoff(self.inner.handoff.as_ref(), &self.inner.routing, &request).await;
        if !outcome.is_completed() {
            self.record_error(Subsystem::Handoff, format!("{outcome:?}"))
                .await;
        }
        Ok(outcome)
    }

    pub async fn set_volume(&self, device: &DeviceId, volume: f32) -> Result<()> {
        self.ensure_running().await?;
        let device = self.inner.routing.resolve_output(device).await?;
        Ok(self.inner.routing.set_volume(&device, volume).await?)
    }

    pub async fn get_volume(&self, device: &DeviceId) -> Result<Option<Volume>> {
        self.ensure_running().await?;
        let device = self.inner.routing.resolve_output(device).await?;
        Ok(self.inner.routing.get_volume(&device).await)
    }

    /// Route a source to an output as a new route
    pub async fn route(&self, mac: &MacAddress, target: &DeviceId) -> Result<RouteId> {
        self.ensure_running().await?;
        let target = self.inner.routing.resolve_output(target).await?;
        Ok(self.inner.routing.create_route(mac, &target).await?)
    }

    /// Fan the existing route of a source out to one more output
    pub async fn add_output(&self, mac: &MacAddress, target: &DeviceId) -> Result<RouteId> {
        self.ensure_running().await?;
        let target = self.inner.routing.resolve_output(target).await?;
        Ok(self.inner.routing.add_output(mac, &target).await?)
    }

    pub async fn remove_route(&self, id: RouteId) -> Result<()> {
        self.ensure_running().await?;
        Ok(self.inner.routing.remove_route(id).await?)
    }

    /// Last snapshot built by the state refresh
    pub async fn state(&self) -> NodeState {
        self.inner.state.read().await.clone()
    }

    /// Rebuild the snapshot now and return it
    pub async fn refresh_state(&self) -> NodeState {
        let inner = &self.inner;
        let node = match &inner.clock {
            Some(clock) => clock.status().await,
            None => Node::new(inner.id),
        };
        let phase = *inner.phase.read().await;
        let snapshot = NodeState {
            node,
            mode: inner.config.mode,
            phase,
            running: phase == NodePhase::Running,
            routes: inner.routing.routes().await,
            outputs: inner.routing.outputs().await,
            devices: inner.directory.snapshot().await,
            last_errors: inner.last_errors.read().await.clone(),
        };
        *inner.state.write().await = snapshot.clone();
        snapshot
    }

    async fn setup(&self) -> Result<()> {
        let inner = &self.inner;
        if let Some(clock) = &inner.clock {
            let role = clock.setup().await?;
            info!(?role, "Clock sync ready");
        }

        let outputs = inner.routing.discover_outputs().await?;
        if outputs.is_empty() {
            warn!("No audio outputs found, routes can only be created after they appear");
        }

        if !inner.bluetooth.set_discoverable(true).await? {
            warn!("Bluetooth adapter refused to become discoverable");
        }
        inner.directory.scan().await?;
        Ok(())
    }

    /// Best-effort release of everything `setup` and the commands acquired
    async fn teardown(&self) {
        let inner = &self.inner;
        inner.routing.cleanup().await;

        match inner.bluetooth.set_discoverable(false).await {
            Ok(true) => {}
            Ok(false) => warn!("Bluetooth adapter stayed discoverable"),
            Err(e) => warn!(error = %e, "Could not disable discoverable mode"),
        }
        for mac in inner.directory.active_devices().await {
            match inner.bluetooth.disconnect(&mac).await {
                Ok(_) => {
                    if let Err(e) = inner.directory.mark_disconnected(&mac).await {
                        warn!(mac = %mac, error = %e, "Disconnected device was not in the directory");
                    }
                }
                Err(e) => warn!(mac = %mac, error = %e, "Disconnect during shutdown failed"),
            }
        }

        if let Some(clock) = &inner.clock {
            clock.cleanup().await;
        }
    }

    async fn connect_device(&self, mac: &MacAddress) -> Result<RouteId> {
        let inner = &self.inner;
        let timeout = inner.config.bluetooth.connect_timeout();
        let connected = tokio::time::timeout(timeout, inner.bluetooth.connect(mac))
            .await
            .map_err(|_| NodeError::ConnectTimeout {
                mac: mac.clone(),
                timeout,
            })??;
        if !connected {
            return Err(NodeError::ConnectRefused(mac.clone()));
        }
        inner.directory.mark_connected(mac).await;

        tokio::time::sleep(inner.config.bluetooth.stabilization()).await;

        let target = inner
            .routing
            .resolve_output(&inner.config.default_output())
            .await?;
        let route = inner.routing.create_route(mac, &target).await?;
        if let Err(e) = inner
            .routing
            .set_volume(&target, inner.config.node.default_volume)
            .await
        {
            if let Err(remove_err) = inner.routing.remove_route(route).await {
                warn!(route = %route, error = %remove_err, "Could not remove route after failed connect");
            }
            return Err(e.into());
        }
        info!(route = %route, target = %target, "Device connected and routed");
        Ok(route)
    }

    async fn disconnect_device(&self, mac: &MacAddress) -> Result<()> {
        if !self.inner.bluetooth.disconnect(mac).await? {
            return Err(NodeError::DisconnectFailed(mac.clone()));
        }
        if let Err(e) = self.inner.directory.mark_disconnected(mac).await {
            warn!(mac = %mac, error = %e, "Disconnected device was not in the directory");
        }
        Ok(())
    }

    async fn ensure_running(&self) -> Result<()> {
        match *self.inner.phase.read().await {
            NodePhase::Running => Ok(()),
            phase => Err(NodeError::NotRunning(phase)),
        }
    }

    async fn record_node_error(&self, error: &NodeError) {
        if let Some(subsystem) = error.subsystem() {
            self.record_error(subsystem, error.to_string()).await;
        }
    }

    async fn record_error(&self, subsystem: Subsystem, message: String) {
        warn!(%subsystem, error = %message, "Subsystem error");
        self.inner.last_errors.write().await.insert(subsystem, message);
    }
}
