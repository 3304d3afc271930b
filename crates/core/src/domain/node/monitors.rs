//! Periodic monitor tasks of a running node
//!
//! Every monitor is its own tokio task. Cancellation is observed between
//! ticks only, so a tick that already talks to a collaborator runs to
//! completion (every collaborator call is itself bounded).

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::{NodeOrchestrator, Subsystem};
use crate::domain::bluetooth::SignalQuality;
use crate::domain::clock::Role;
use crate::domain::config::Mode;

/// Spawn every monitor that applies to this node's mode and clock role
pub(super) async fn spawn_all(node: &NodeOrchestrator, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
    let config = node.inner.config.clone();
    let monitors = &config.monitors;
    let mut tasks = Vec::new();

    if let Some(clock) = &node.inner.clock {
        tasks.push(spawn_monitor(
            "sync",
            monitors.sync_interval(),
            cancel.clone(),
            ticker(node, |node| async move { node.sync_tick().await }),
        ));
        if clock.status().await.role == Role::Master {
            tasks.push(spawn_responder(node.clone(), cancel.clone()));
        }
    }

    tasks.push(spawn_monitor(
        "signal",
        monitors.signal_interval(config.mode),
        cancel.clone(),
        ticker(node, |node| async move { node.signal_tick().await }),
    ));

    if config.mode == Mode::Distributed {
        tasks.push(spawn_monitor(
            "network",
            monitors.network_interval(),
            cancel.clone(),
            ticker(node, |node| async move { node.network_tick().await }),
        ));
    }

    tasks.push(spawn_monitor(
        "route-health",
        monitors.route_health_interval(),
        cancel.clone(),
        ticker(node, |node| async move { node.route_health_tick().await }),
    ));

    tasks.push(spawn_monitor(
        "state-refresh",
        monitors.state_refresh_interval(),
        cancel.clone(),
        ticker(node, |node| async move {
            node.refresh_state().await;
        }),
    ));

    tasks
}

/// Bind a tick body to a clone of the node handle
fn ticker<F, Fut>(node: &NodeOrchestrator, body: F) -> impl FnMut() -> Fut + Send + 'static
where
    F: Fn(NodeOrchestrator) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let node = node.clone();
    move || body(node.clone())
}

fn spawn_monitor<F, Fut>(
    name: &'static str,
    interval: Duration,
    cancel: CancellationToken,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(
        async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            debug!(?interval, "Monitor started");

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => tick().await,
                }
            }
            debug!("Monitor stopped");
        }
        .instrument(info_span!("monitor", name)),
    )
}

/// Answer clock requests for as long as the node runs as master
fn spawn_responder(node: NodeOrchestrator, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(
        async move {
            let Some(clock) = &node.inner.clock else {
                return;
            };
            let poll = node.inner.config.clock.responder_poll();
            while !cancel.is_cancelled() {
                match clock.serve(poll).await {
                    Ok(answered) if answered > 0 => debug!(answered, "Clock requests answered"),
                    Ok(_) => {}
                    Err(e) => {
                        node.record_error(Subsystem::Clock, e.to_string()).await;
                        tokio::select! {
                            _ = cancel.cancelled() => {}
                            _ = tokio::time::sleep(poll) => {}
                        }
                    }
                }
            }
            debug!("Clock responder stopped");
        }
        .instrument(info_span!("monitor", name = "clock-responder")),
    )
}

impl NodeOrchestrator {
    /// Check drift and realign once it exceeds the threshold
    async fn sync_tick(&self) {
        let Some(clock) = &self.inner.clock else {
            return;
        };
        let drift = match clock.check_drift().await {
            Ok(drift) => drift,
            Err(e) => {
                self.record_error(Subsystem::Clock, e.to_string()).await;
                return;
            }
        };
        if drift.abs() <= self.inner.config.clock.drift_threshold() {
            return;
        }

        info!(%drift, "Drift above threshold, realigning");
        match clock.realign().await {
            Ok(true) => {}
            Ok(false) => {
                self.record_error(Subsystem::Clock, "sync failed: no sample arrived".to_string())
                    .await
            }
            Err(e) => self.record_error(Subsystem::Clock, e.to_string()).await,
        }
    }

    /// Poll the signal of every connected device
    async fn signal_tick(&self) {
        let inner = &self.inner;
        for mac in inner.directory.active_devices().await {
            let rssi = match inner.directory.update_signal(&mac).await {
                Ok(rssi) => rssi,
                Err(e) => {
                    self.record_error(Subsystem::Bluetooth, e.to_string()).await;
                    continue;
                }
            };
            if SignalQuality::from_rssi(rssi) == SignalQuality::Good {
                continue;
            }

            match inner.config.mode {
                Mode::Standalone => warn!(mac = %mac, ?rssi, "Poor signal quality"),
                Mode::Distributed => {
                    let Some(target) = inner.advisor.evaluate(&mac, rssi).await else {
                        debug!(mac = %mac, ?rssi, "Poor signal, no handoff advised");
                        continue;
                    };
                    info!(mac = %mac, target = %target, "Handoff advised");
                    match self.handoff(&mac, target).await {
                        Ok(outcome) => info!(mac = %mac, ?outcome, "Handoff finished"),
                        Err(e) => self.record_error(Subsystem::Handoff, e.to_string()).await,
                    }
                }
            }
        }
    }

    /// Ask for a larger buffer when jitter exceeds the threshold
    async fn network_tick(&self) {
        let inner = &self.inner;
        let stats = match inner.network.stats().await {
            Ok(Some(stats)) => stats,
            Ok(None) => return,
            Err(e) => {
                self.record_error(Subsystem::Network, e.to_string()).await;
                return;
            }
        };
        debug!(latency = ?stats.latency, jitter = ?stats.jitter, "Network stats");
        if stats.jitter > inner.config.network.jitter_threshold() {
            info!(jitter = ?stats.jitter, "Jitter above threshold, adjusting buffer");
            if let Err(e) = inner.network.adjust_buffer(stats).await {
                self.record_error(Subsystem::Network, e.to_string()).await;
            }
        }
    }

    /// One repair attempt per tick for broken routes of connected sources
    async fn route_health_tick(&self) {
        let inner = &self.inner;
        let report = match inner.routing.check_health().await {
            Ok(report) => report,
            Err(e) => {
                self.record_error(Subsystem::Routing, e.to_string()).await;
                return;
            }
        };
        let active = inner.directory.active_devices().await;

        for health in report.into_iter().filter(|h| !h.healthy) {
            if !active.contains(&health.source) {
                debug!(route = %health.id, "Skipping repair, source not connected");
                continue;
            }
            match inner.routing.repair_route(health.id).await {
                Ok(true) => info!(route = %health.id, "Route repaired"),
                Ok(false) => {
                    self.record_error(
                        Subsystem::Routing,
                        format!("{} still broken after repair", health.id),
                    )
                    .await
                }
                Err(e) => self.record_error(Subsystem::Routing, e.to_string()).await,
            }
        }
    }
}
