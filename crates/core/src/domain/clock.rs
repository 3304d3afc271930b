//! Clock synchronization between nodes
//!
//! Nodes elect the lowest node id as time master. Slaves estimate their
//! offset to the master from round-trip samples and re-align when the
//! measured drift crosses a threshold. The exchange is a small from-scratch
//! master/slave protocol carried over any [`ClockTransport`].

mod engine;
mod wire;

pub use engine::ClockSyncEngine;
pub use wire::{ClockMessage, WireError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

use crate::domain::bluetooth::MacAddress;

/// Errors of the clock datagram channel
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Cannot bind clock port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("Send failed: {0}")]
    Send(std::io::Error),

    #[error("Receive failed: {0}")]
    Recv(std::io::Error),

    #[error("Transport is not bound")]
    NotBound,
}

/// Errors of the clock sync engine
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Clock transport error: {0}")]
    Transport(#[from] TransportError),

    /// Another process announced our own node id
    #[error("Duplicate node id {0} on the network")]
    DuplicateNodeId(NodeId),

    #[error("Clock engine is not set up")]
    NotSetUp,
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// Stable node identity, the 48-bit hardware address as an integer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl NodeId {
    pub fn from_mac(mac: &MacAddress) -> Self {
        Self(mac.to_u64())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:012x}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Master,
    Slave,
    Undetermined,
}

/// Nanoseconds since the Unix epoch on some node's clock
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub fn as_nanos(&self) -> i64 {
        self.0
    }

    /// Signed distance from `earlier` to `self`
    pub fn since(&self, earlier: Timestamp) -> ClockOffset {
        ClockOffset(self.0.saturating_sub(earlier.0))
    }
}

/// Signed clock difference in nanoseconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClockOffset(pub i64);

impl ClockOffset {
    pub const ZERO: ClockOffset = ClockOffset(0);

    pub fn from_millis(ms: i64) -> Self {
        Self(ms.saturating_mul(1_000_000))
    }

    pub fn from_micros(us: i64) -> Self {
        Self(us.saturating_mul(1_000))
    }

    pub fn as_nanos(&self) -> i64 {
        self.0
    }

    /// Magnitude, dropping the sign
    pub fn abs(&self) -> Duration {
        Duration::from_nanos(self.0.unsigned_abs())
    }
}

impl std::ops::Sub for ClockOffset {
    type Output = ClockOffset;

    fn sub(self, other: ClockOffset) -> ClockOffset {
        ClockOffset(self.0.saturating_sub(other.0))
    }
}

impl fmt::Display for ClockOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3}ms", self.0 as f64 / 1_000_000.0)
    }
}

/// Freshness of the offset estimate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncState {
    NeverSynced,
    Synced,
    /// The last sampling round produced no sample; the offset is the previous one
    Stale,
}

/// Elected master as seen from a slave
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterInfo {
    pub id: NodeId,
    pub addr: SocketAddr,
}

/// Clock state of this node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub role: Role,
    pub clock_offset: ClockOffset,
    /// Offset change per elapsed time since the last alignment (ns per ns)
    pub drift_rate: f64,
    pub last_sync_at: Option<Timestamp>,
    pub master: Option<MasterInfo>,
    pub sync_state: SyncState,
}

impl Node {
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            role: Role::Undetermined,
            clock_offset: ClockOffset::ZERO,
            drift_rate: 0.0,
            last_sync_at: None,
            master: None,
            sync_state: SyncState::NeverSynced,
        }
    }
}

/// One completed request/response exchange
///
/// `t1`/`t4` are read from the local clock, `t2`/`t3` from the master's.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSample {
    pub t1: Timestamp,
    pub t2: Timestamp,
    pub t3: Timestamp,
    pub t4: Timestamp,
}

impl SyncSample {
    /// `((t2 - t1) + (t3 - t4)) / 2`
    pub fn offset(&self) -> ClockOffset {
        let outbound = i128::from(self.t2.0) - i128::from(self.t1.0);
        let inbound = i128::from(self.t3.0) - i128::from(self.t4.0);
        ClockOffset(clamp_i128((outbound + inbound) / 2))
    }
}

/// Arithmetic mean of the per-sample offsets, `None` for no samples
pub fn mean_offset(samples: &[SyncSample]) -> Option<ClockOffset> {
    if samples.is_empty() {
        return None;
    }
    let sum: i128 = samples.iter().map(|s| i128::from(s.offset().0)).sum();
    Some(ClockOffset(clamp_i128(sum / samples.len() as i128)))
}

fn clamp_i128(value: i128) -> i64 {
    i64::try_from(value).unwrap_or(if value < 0 { i64::MIN } else { i64::MAX })
}

/// Master election over the ids observed during the election window
///
/// The lowest id wins; seeing our own id from another process is fatal.
pub fn elect(own: NodeId, observed: impl IntoIterator<Item = NodeId>) -> Result<Role> {
    let mut lowest_peer: Option<NodeId> = None;
    for peer in observed {
        if peer == own {
            return Err(SyncError::DuplicateNodeId(own));
        }
        lowest_peer = Some(lowest_peer.map_or(peer, |low| low.min(peer)));
    }
    match lowest_peer {
        Some(peer) if peer < own => Ok(Role::Slave),
        _ => Ok(Role::Master),
    }
}

/// Source of the local wall-clock time
pub trait TimeSource: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// The host's system clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now(&self) -> Timestamp {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(i64::try_from(since_epoch.as_nanos()).unwrap_or(i64::MAX))
    }
}

/// Datagram channel shared by every node on the well-known clock port
#[async_trait]
pub trait ClockTransport: Send + Sync {
    async fn bind(&self, port: u16) -> std::result::Result<(), TransportError>;

    /// Send to every node listening on the bound port
    async fn broadcast(&self, message: &ClockMessage) -> std::result::Result<(), TransportError>;

    async fn send_to(
        &self,
        message: &ClockMessage,
        peer: SocketAddr,
    ) -> std::result::Result<(), TransportError>;

    /// Next decodable message, or `Ok(None)` once `timeout` elapses
    async fn recv_timeout(
        &self,
        timeout: Duration,
    ) -> std::result::Result<Option<(ClockMessage, SocketAddr)>, TransportError>;

    /// Release the socket; closing twice is harmless
    async fn close(&self);
}
