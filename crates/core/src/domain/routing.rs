//! Audio route lifecycle
//!
//! A route carries one Bluetooth source to an ordered list of outputs. Each
//! target gets a front-left link, plus a front-right link unless the output
//! is mono. The engine owns the route table and the output cache; every
//! mutation and every verification goes through the same table lock.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, trace, warn};

use crate::domain::audio::{
    AudioBackend, BackendError, Channel, ChannelLink, DeviceId, OutputDevice, Volume,
};
use crate::domain::bluetooth::MacAddress;
use crate::domain::config::RetryPolicy;

/// Alias for "whatever the audio graph considers its default sink"
pub const DEFAULT_OUTPUT_ALIAS: &str = "default";

#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("Unknown output: {0}")]
    UnknownTarget(DeviceId),

    #[error("No route for source {0}")]
    NoRouteForSource(MacAddress),

    #[error("Unknown route: {0}")]
    UnknownRoute(RouteId),

    #[error("Route already exists: {0}")]
    RouteExists(RouteId),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

pub type Result<T> = std::result::Result<T, RoutingError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RouteId(pub u64);

impl fmt::Display for RouteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "route-{}", self.0)
    }
}

/// A source fanned out to one or more outputs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub id: RouteId,
    pub source: MacAddress,
    /// Insertion order is fan-out priority; the first entry is the primary target
    pub targets: Vec<DeviceId>,
    pub links: BTreeSet<ChannelLink>,
    /// Result of the last verification
    pub healthy: bool,
}

impl Route {
    pub fn primary_target(&self) -> Option<&DeviceId> {
        self.targets.first()
    }

    pub fn links_to<'a>(&'a self, target: &'a DeviceId) -> impl Iterator<Item = &'a ChannelLink> {
        self.links.iter().filter(move |link| &link.target.device == target)
    }
}

/// Verification outcome of one route
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteHealth {
    pub id: RouteId,
    pub source: MacAddress,
    pub healthy: bool,
}

/// Links needed to carry `source` to `output`: FL always, FR unless mono
pub fn plan_links(source: &MacAddress, output: &OutputDevice) -> Vec<ChannelLink> {
    let channels: &[Channel] = if output.is_mono() {
        &[Channel::FrontLeft]
    } else {
        &[Channel::FrontLeft, Channel::FrontRight]
    };
    channels
        .iter()
        .map(|channel| ChannelLink::new(source.clone(), output.id.clone(), *channel))
        .collect()
}

#[derive(Default)]
struct RoutingTable {
    outputs: BTreeMap<DeviceId, OutputDevice>,
    routes: BTreeMap<RouteId, Route>,
    volumes: HashMap<DeviceId, Volume>,
    next_id: u64,
}

impl RoutingTable {
    fn allocate_id(&mut self) -> RouteId {
        self.next_id += 1;
        RouteId(self.next_id)
    }

    fn first_route_for(&self, source: &MacAddress) -> Option<RouteId> {
        self.routes
            .values()
            .find(|route| &route.source == source)
            .map(|route| route.id)
    }

    fn output(&self, id: &DeviceId) -> Result<OutputDevice> {
        self.outputs
            .get(id)
            .cloned()
            .ok_or_else(|| RoutingError::UnknownTarget(id.clone()))
    }
}

/// Route lifecycle manager over an [`AudioBackend`]
pub struct RoutingEngine {
    backend: Arc<dyn AudioBackend>,
    discovery: RetryPolicy,
    table: Mutex<RoutingTable>,
}

impl RoutingEngine {
    pub fn new(backend: Arc<dyn AudioBackend>, discovery: RetryPolicy) -> Self {
        Self {
            backend,
            discovery,
            table: Mutex::new(RoutingTable::default()),
        }
    }

    /// Refresh the output cache, retrying while the graph reports nothing
    ///
    /// An empty final result is returned as such; only a failing final
    /// attempt is an error.
    #[instrument(skip(self))]
    pub async fn discover_outputs(&self) -> Result<Vec<OutputDevice>> {
        let attempts = self.discovery.attempts.max(1);
        let mut last = Ok(Vec::new());
        for attempt in 1..=attempts {
            last = self.backend.list_outputs().await;
            match &last {
                Ok(outputs) if !outputs.is_empty() => break,
                Ok(_) => debug!(attempt, "No outputs found"),
                Err(e) => warn!(attempt, error = %e, "Output discovery failed"),
            }
            if attempt < attempts {
                tokio::time::sleep(self.discovery.backoff()).await;
            }
        }

        let outputs = last?;
        let mut table = self.table.lock().await;
        table.outputs = outputs
            .iter()
            .map(|output| (output.id.clone(), output.clone()))
            .collect();
        for output in &outputs {
            table
                .volumes
                .entry(output.id.clone())
                .or_insert(output.current_volume);
        }
        info!(count = outputs.len(), "Outputs discovered");
        Ok(outputs)
    }

    /// Map a requested output onto a known one
    ///
    /// The `default` alias resolves to the graph's default sink, falling back
    /// to the first known output.
    pub async fn resolve_output(&self, requested: &DeviceId) -> Result<DeviceId> {
        let table = self.table.lock().await;
        if table.outputs.contains_key(requested) {
            return Ok(requested.clone());
        }
        if requested.as_str() != DEFAULT_OUTPUT_ALIAS {
            return Err(RoutingError::UnknownTarget(requested.clone()));
        }
        let backend_default = match self.backend.default_output().await {
            Ok(default) => default.filter(|id| table.outputs.contains_key(id)),
            Err(e) => {
                warn!(error = %e, "Could not query the default output");
                None
            }
        };
        backend_default
            .or_else(|| table.outputs.keys().next().cloned())
            .ok_or_else(|| RoutingError::UnknownTarget(requested.clone()))
    }

    /// Always creates a new route, even if the source is already routed
    #[instrument(skip_all, fields(source = %source, target = %target))]
    pub async fn create_route(&self, source: &MacAddress, target: &DeviceId) -> Result<RouteId> {
        let mut table = self.table.lock().await;
        let output = table.output(target)?;
        let links = self.link_target(source, &output).await?;

        let id = table.allocate_id();
        table.routes.insert(
            id,
            Route {
                id,
                source: source.clone(),
                targets: vec![target.clone()],
                links: links.into_iter().collect(),
                healthy: true,
            },
        );
        info!(route = %id, "Route created");
        Ok(id)
    }

    /// Fan an existing route of `source` out to one more output
    #[instrument(skip_all, fields(source = %source, target = %target))]
    pub async fn add_output(&self, source: &MacAddress, target: &DeviceId) -> Result<RouteId> {
        let mut table = self.table.lock().await;
        let id = table
            .first_route_for(source)
            .ok_or_else(|| RoutingError::NoRouteForSource(source.clone()))?;
        if table
            .routes
            .get(&id)
            .is_some_and(|route| route.targets.contains(target))
        {
            debug!(route = %id, "Output already part of route");
            return Ok(id);
        }

        let output = table.output(target)?;
        let links = self.link_target(source, &output).await?;
        if let Some(route) = table.routes.get_mut(&id) {
            route.targets.push(target.clone());
            route.links.extend(links);
        }
        info!(route = %id, "Output added to route");
        Ok(id)
    }

    /// Re-create a previously captured route under its own id and targets
    ///
    /// All targets are linked or none are. Fails with `RouteExists` while a
    /// route with that id is still present.
    #[instrument(skip_all, fields(route = %captured.id, source = %captured.source))]
    pub async fn restore_route(&self, captured: &Route) -> Result<RouteId> {
        let mut table = self.table.lock().await;
        if table.routes.contains_key(&captured.id) {
            return Err(RoutingError::RouteExists(captured.id));
        }
        let outputs = captured
            .targets
            .iter()
            .map(|target| table.output(target))
            .collect::<Result<Vec<_>>>()?;

        let mut links: Vec<ChannelLink> = Vec::new();
        for output in &outputs {
            match self.link_target(&captured.source, output).await {
                Ok(made) => links.extend(made),
                Err(e) => {
                    for undo in links.iter().rev() {
                        if let Err(undo_err) = self.backend.unlink(undo).await {
                            warn!(link = %undo, error = %undo_err, "Rollback unlink failed");
                        }
                    }
                    return Err(e);
                }
            }
        }

        table.next_id = table.next_id.max(captured.id.0);
        table.routes.insert(
            captured.id,
            Route {
                id: captured.id,
                source: captured.source.clone(),
                targets: captured.targets.clone(),
                links: links.into_iter().collect(),
                healthy: true,
            },
        );
        info!(targets = captured.targets.len(), "Route restored");
        Ok(captured.id)
    }

    /// Whether every recorded link of the route is active; `false` for unknown ids
    pub async fn verify_route(&self, id: RouteId) -> Result<bool> {
        let table = self.table.lock().await;
        let Some(route) = table.routes.get(&id) else {
            return Ok(false);
        };
        let active = self.backend.list_active_links().await?;
        Ok(route.links.iter().all(|link| active.contains(link)))
    }

    /// Verify every route and record the outcome on it
    pub async fn check_health(&self) -> Result<Vec<RouteHealth>> {
        let mut table = self.table.lock().await;
        if table.routes.is_empty() {
            return Ok(Vec::new());
        }
        let active = self.backend.list_active_links().await?;
        let report = table
            .routes
            .values_mut()
            .map(|route| {
                route.healthy = route.links.iter().all(|link| active.contains(link));
                if !route.healthy {
                    debug!(route = %route.id, "Route has missing links");
                }
                RouteHealth {
                    id: route.id,
                    source: route.source.clone(),
                    healthy: route.healthy,
                }
            })
            .collect();
        Ok(report)
    }

    /// Tear down and rebuild a route in its original target order
    ///
    /// Single attempt. `Ok(false)` for an unknown id or when the rebuilt route
    /// still does not verify. On a failing step the route keeps exactly the
    /// links that were re-created and is marked unhealthy.
    #[instrument(skip_all, fields(route = %id))]
    pub async fn repair_route(&self, id: RouteId) -> Result<bool> {
        let mut guard = self.table.lock().await;
        let table = &mut *guard;
        let Some(route) = table.routes.get_mut(&id) else {
            return Ok(false);
        };

        for link in &route.links {
            if let Err(e) = self.backend.unlink(link).await {
                warn!(link = %link, error = %e, "Unlink during repair failed");
            }
        }
        route.links.clear();
        route.healthy = false;

        for target in route.targets.clone() {
            let output = table
                .outputs
                .get(&target)
                .ok_or_else(|| RoutingError::UnknownTarget(target.clone()))?;
            let links = self.link_target(&route.source, output).await?;
            route.links.extend(links);
        }

        let active = self.backend.list_active_links().await?;
        route.healthy = route.links.iter().all(|link| active.contains(link));
        info!(healthy = route.healthy, "Route repaired");
        Ok(route.healthy)
    }

    /// Unlink and forget a route
    ///
    /// Links the backend refuses to drop stay recorded on the route.
    #[instrument(skip_all, fields(route = %id))]
    pub async fn remove_route(&self, id: RouteId) -> Result<()> {
        let mut table = self.table.lock().await;
        let mut route = table
            .routes
            .remove(&id)
            .ok_or(RoutingError::UnknownRoute(id))?;

        let mut first_error = None;
        let mut remaining = BTreeSet::new();
        for link in std::mem::take(&mut route.links) {
            if let Err(e) = self.backend.unlink(&link).await {
                warn!(link = %link, error = %e, "Unlink failed");
                first_error.get_or_insert(e);
                remaining.insert(link);
            }
        }

        match first_error {
            None => {
                info!("Route removed");
                Ok(())
            }
            Some(e) => {
                route.links = remaining;
                route.healthy = false;
                table.routes.insert(id, route);
                Err(e.into())
            }
        }
    }

    #[instrument(skip_all, fields(device = %device))]
    pub async fn set_volume(&self, device: &DeviceId, volume: f32) -> Result<()> {
        let volume = Volume::new(volume).ok_or_else(|| {
            RoutingError::InvalidArgument(format!("volume {volume} outside 0.0..=1.0"))
        })?;

        let mut table = self.table.lock().await;
        if !table.outputs.contains_key(device) {
            return Err(RoutingError::UnknownTarget(device.clone()));
        }
        self.backend.set_volume(device, volume).await?;
        table.volumes.insert(device.clone(), volume);
        if let Some(output) = table.outputs.get_mut(device) {
            output.current_volume = volume;
        }
        debug!(volume = volume.get(), "Volume set");
        Ok(())
    }

    /// Live volume when the graph answers, otherwise the last known value
    pub async fn get_volume(&self, device: &DeviceId) -> Option<Volume> {
        let mut table = self.table.lock().await;
        match self.backend.get_volume(device).await {
            Ok(Some(raw)) => {
                let volume = Volume::clamped(raw);
                table.volumes.insert(device.clone(), volume);
                Some(volume)
            }
            Ok(None) => table.volumes.get(device).copied(),
            Err(e) => {
                debug!(device = %device, error = %e, "Using cached volume");
                table.volumes.get(device).copied()
            }
        }
    }

    /// Best-effort teardown of every route, then every known volume to zero
    #[instrument(skip(self))]
    pub async fn cleanup(&self) {
        let mut table = self.table.lock().await;
        for route in std::mem::take(&mut table.routes).into_values() {
            for link in &route.links {
                if let Err(e) = self.backend.unlink(link).await {
                    warn!(route = %route.id, link = %link, error = %e, "Unlink during cleanup failed");
                }
            }
        }

        let devices: Vec<DeviceId> = table.volumes.keys().cloned().collect();
        for device in devices {
            match self.backend.set_volume(&device, Volume::MUTE).await {
                Ok(()) => {
                    table.volumes.insert(device, Volume::MUTE);
                }
                Err(e) => warn!(device = %device, error = %e, "Volume reset failed"),
            }
        }
        info!("Routing cleaned up");
    }

    pub async fn routes(&self) -> Vec<Route> {
        self.table.lock().await.routes.values().cloned().collect()
    }

    pub async fn route(&self, id: RouteId) -> Option<Route> {
        self.table.lock().await.routes.get(&id).cloned()
    }

    pub async fn routes_for_source(&self, source: &MacAddress) -> Vec<Route> {
        self.table
            .lock()
            .await
            .routes
            .values()
            .filter(|route| &route.source == source)
            .cloned()
            .collect()
    }

    pub async fn outputs(&self) -> Vec<OutputDevice> {
        self.table.lock().await.outputs.values().cloned().collect()
    }

    /// Link every planned channel of one target; undo partial work on failure
    async fn link_target(&self, source: &MacAddress, output: &OutputDevice) -> Result<Vec<ChannelLink>> {
        let planned = plan_links(source, output);
        let mut made: Vec<ChannelLink> = Vec::with_capacity(planned.len());
        for link in planned {
            if let Err(e) = self.backend.link(&link).await {
                warn!(link = %link, error = %e, "Link failed, rolling back target");
                for undo in made.iter().rev() {
                    if let Err(undo_err) = self.backend.unlink(undo).await {
                        warn!(link = %undo, error = %undo_err, "Rollback unlink failed");
                    }
                }
                return Err(e.into());
            }
            trace!(link = %link, "Linked");
            made.push(link);
        }
        Ok(made)
    }
}
