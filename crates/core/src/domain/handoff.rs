//! Device handoff between nodes
//!
//! A handoff moves an active stream to another node in four phases. The
//! phase bodies need a cross-node channel and are supplied through
//! [`HandoffPhases`]; this module owns the state machine and the rule that a
//! failing transfer or finalize is always rolled back.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing::{error, info, instrument, warn};

use crate::domain::bluetooth::MacAddress;
use crate::domain::routing::{Route, RoutingEngine, RoutingError};

#[derive(Debug, Error)]
pub enum HandoffError {
    #[error("Handoff not supported: {0}")]
    Unsupported(String),

    #[error("{stage:?} failed: {reason}")]
    Phase { stage: HandoffStage, reason: String },

    #[error(transparent)]
    Routing(#[from] RoutingError),
}

pub type Result<T> = std::result::Result<T, HandoffError>;

/// Address of a peer node as understood by the phase implementation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeAddress(String);

impl NodeAddress {
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandoffStage {
    Prepare,
    Transfer,
    Finalize,
    Rollback,
}

#[derive(Debug, Clone)]
pub struct HandoffRequest {
    pub mac: MacAddress,
    pub target: NodeAddress,
    /// Routes of the source captured before `prepare`
    pub source_routes: Vec<Route>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HandoffOutcome {
    Completed,
    /// Prepare failed; nothing was changed so nothing is rolled back
    Aborted { reason: String },
    RolledBack {
        failed: HandoffStage,
        reason: String,
    },
    RollbackFailed {
        failed: HandoffStage,
        reason: String,
        rollback_error: String,
    },
}

impl HandoffOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, HandoffOutcome::Completed)
    }
}

/// Phase bodies of the handoff protocol
#[async_trait]
pub trait HandoffPhases: Send + Sync {
    /// Reserve resources on the target and notify it
    async fn prepare(&self, request: &HandoffRequest) -> Result<()>;

    /// Move the audio stream
    async fn transfer(&self, request: &HandoffRequest) -> Result<()>;

    /// Commit on the target and release on the source
    async fn finalize(&self, request: &HandoffRequest) -> Result<()>;

    /// Undo whatever prepare/transfer/finalize did on the target
    async fn rollback(&self, request: &HandoffRequest) -> Result<()>;
}

/// Phases for a node without peers: every handoff is declined at prepare
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleNodeHandoff;

#[async_trait]
impl HandoffPhases for SingleNodeHandoff {
    async fn prepare(&self, request: &HandoffRequest) -> Result<()> {
        Err(HandoffError::Unsupported(format!(
            "no peer channel to reach {}",
            request.target
        )))
    }

    async fn transfer(&self, _request: &HandoffRequest) -> Result<()> {
        Ok(())
    }

    async fn finalize(&self, _request: &HandoffRequest) -> Result<()> {
        Ok(())
    }

    async fn rollback(&self, _request: &HandoffRequest) -> Result<()> {
        Ok(())
    }
}

/// Decides whether a device with a weak signal should move to another node
#[async_trait]
pub trait HandoffAdvisor: Send + Sync {
    async fn evaluate(&self, mac: &MacAddress, rssi: Option<i16>) -> Option<NodeAddress>;
}

/// Declines every handoff
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHandoff;

#[async_trait]
impl HandoffAdvisor for NoHandoff {
    async fn evaluate(&self, _mac: &MacAddress, _rssi: Option<i16>) -> Option<NodeAddress> {
        None
    }
}

/// Drive Prepare, Transfer and Finalize, rolling back on a late failure
#[instrument(skip_all, fields(mac = %request.mac, target = %request.target))]
pub async fn run_handoff(
    phases: &dyn HandoffPhases,
    routing: &RoutingEngine,
    request: &HandoffRequest,
) -> HandoffOutcome {
    if let Err(e) = phases.prepare(request).await {
        warn!(error = %e, "Handoff prepare failed");
        return HandoffOutcome::Aborted {
            reason: e.to_string(),
        };
    }

    let failure = match phases.transfer(request).await {
        Err(e) => Some((HandoffStage::Transfer, e)),
        Ok(()) => phases
            .finalize(request)
            .await
            .err()
            .map(|e| (HandoffStage::Finalize, e)),
    };

    let Some((failed, cause)) = failure else {
        info!("Handoff completed");
        return HandoffOutcome::Completed;
    };
    warn!(stage = ?failed, error = %cause, "Handoff failed, rolling back");

    let rollback = match phases.rollback(request).await {
        Ok(()) => restore_routes(routing, &request.source_routes).await,
        Err(e) => Err(e),
    };
    match rollback {
        Ok(()) => HandoffOutcome::RolledBack {
            failed,
            reason: cause.to_string(),
        },
        Err(e) => {
            error!(error = %e, "Handoff rollback failed");
            HandoffOutcome::RollbackFailed {
                failed,
                reason: cause.to_string(),
                rollback_error: e.to_string(),
            }
        }
    }
}

/// Bring every captured route back to a verified state
async fn restore_routes(routing: &RoutingEngine, captured: &[Route]) -> Result<()> {
    for route in captured {
        if routing.verify_route(route.id).await? {
            continue;
        }
        if routing.route(route.id).await.is_some() {
            if !routing.repair_route(route.id).await? {
                return Err(HandoffError::Phase {
                    stage: HandoffStage::Rollback,
                    reason: format!("{} does not verify after repair", route.id),
                });
            }
            continue;
        }

        routing.restore_route(route).await?;
        info!(route = %route.id, "Route recreated after rollback");
    }
    Ok(())
}
