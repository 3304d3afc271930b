use std::collections::BTreeMap;
use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hasher};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use super::{
    elect, mean_offset, ClockMessage, ClockOffset, ClockTransport, MasterInfo, Node, NodeId,
    Result, Role, SyncError, SyncSample, SyncState, TimeSource, TransportError,
};
use crate::domain::config::ClockConfig;

/// Per-node master/slave clock alignment
///
/// The engine is the only writer of the [`Node`] clock fields. Sampling
/// rounds are serialized so a drift check and a realign never interleave
/// their request/response exchanges on the shared transport.
pub struct ClockSyncEngine {
    config: ClockConfig,
    transport: Arc<dyn ClockTransport>,
    time: Arc<dyn TimeSource>,
    instance: u64,
    node: RwLock<Node>,
    next_seq: Mutex<u32>,
    bound: AtomicBool,
}

impl ClockSyncEngine {
    pub fn new(
        id: NodeId,
        config: ClockConfig,
        transport: Arc<dyn ClockTransport>,
        time: Arc<dyn TimeSource>,
    ) -> Self {
        let mut hasher = RandomState::new().build_hasher();
        hasher.write_u64(id.0);
        Self {
            config,
            transport,
            time,
            instance: hasher.finish(),
            node: RwLock::new(Node::new(id)),
            next_seq: Mutex::new(0),
            bound: AtomicBool::new(false),
        }
    }

    pub async fn id(&self) -> NodeId {
        self.node.read().await.id
    }

    /// Bind, elect, and take the initial sample round when elected slave
    #[instrument(skip(self))]
    pub async fn setup(&self) -> Result<Role> {
        self.bind().await?;
        let role = match self.elect().await {
            Ok(role) => role,
            Err(e) => {
                self.cleanup().await;
                return Err(e);
            }
        };
        if role == Role::Slave {
            self.realign().await?;
        }
        Ok(role)
    }

    pub async fn bind(&self) -> Result<()> {
        self.transport.bind(self.config.port).await?;
        self.bound.store(true, Ordering::SeqCst);
        debug!(port = self.config.port, "Clock transport bound");
        Ok(())
    }

    /// Announce ourselves and collect peer announcements for one window
    ///
    /// Each peer heard for the first time gets our announcement back, so
    /// nodes that bound after our broadcast still learn about us.
    #[instrument(skip(self))]
    pub async fn elect(&self) -> Result<Role> {
        self.ensure_bound()?;
        let own = self.id().await;
        let announce = ClockMessage::Announce {
            node_id: own,
            instance: self.instance,
        };
        self.transport.broadcast(&announce).await?;

        let mut peers: BTreeMap<NodeId, SocketAddr> = BTreeMap::new();
        let deadline = Instant::now() + self.config.election_window();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match self.transport.recv_timeout(remaining).await? {
                Some((ClockMessage::Announce { node_id, instance }, addr)) => {
                    if instance == self.instance {
                        continue;
                    }
                    if node_id == own {
                        error!(node = %own, peer = %addr, "Another node announced our id");
                        return Err(SyncError::DuplicateNodeId(own));
                    }
                    if peers.insert(node_id, addr).is_none() {
                        self.transport.send_to(&announce, addr).await?;
                    }
                }
                Some(_) => {}
                None => break,
            }
        }

        let role = elect(own, peers.keys().copied())?;
        let master = match role {
            Role::Slave => peers
                .iter()
                .next()
                .map(|(id, addr)| MasterInfo { id: *id, addr: *addr }),
            _ => None,
        };

        let mut node = self.node.write().await;
        node.role = role;
        node.master = master;
        info!(node = %own, ?role, peers = peers.len(), "Clock election finished");
        Ok(role)
    }

    /// Signed offset change since the last alignment; zero on the master
    #[instrument(skip(self))]
    pub async fn check_drift(&self) -> Result<ClockOffset> {
        let master = match self.slave_master().await? {
            Some(master) => master,
            None => return Ok(ClockOffset::ZERO),
        };

        let Some(measured) = self.sample_round(master).await else {
            self.mark_stale().await;
            return Ok(ClockOffset::ZERO);
        };

        let now = self.time.now();
        let mut node = self.node.write().await;
        let drift = measured - node.clock_offset;
        let elapsed = node
            .last_sync_at
            .map(|at| now.since(at).as_nanos())
            .unwrap_or(0);
        node.drift_rate = if elapsed > 0 {
            drift.as_nanos() as f64 / elapsed as f64
        } else {
            0.0
        };
        debug!(%drift, drift_rate = node.drift_rate, "Drift measured");
        Ok(drift)
    }

    /// Re-sample and adopt the new offset; `Ok(false)` when no sample arrived
    #[instrument(skip(self))]
    pub async fn realign(&self) -> Result<bool> {
        let master = match self.slave_master().await? {
            Some(master) => master,
            None => return Ok(true),
        };

        let Some(offset) = self.sample_round(master).await else {
            self.mark_stale().await;
            return Ok(false);
        };

        let now = self.time.now();
        let mut node = self.node.write().await;
        node.clock_offset = offset;
        node.last_sync_at = Some(now);
        node.sync_state = SyncState::Synced;
        info!(%offset, master = %master.id, "Clock aligned");
        Ok(true)
    }

    pub async fn status(&self) -> Node {
        self.node.read().await.clone()
    }

    /// Answer clock traffic for one poll window while master
    ///
    /// Returns the number of messages answered.
    pub async fn serve(&self, poll: Duration) -> Result<usize> {
        self.ensure_bound()?;
        let (own, role) = {
            let node = self.node.read().await;
            (node.id, node.role)
        };
        if role != Role::Master {
            return Ok(0);
        }

        let mut answered = 0;
        let deadline = Instant::now() + poll;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let Some((message, peer)) = self.transport.recv_timeout(remaining).await? else {
                break;
            };
            let receive = self.time.now();
            match message {
                ClockMessage::SyncRequest { seq, .. } => {
                    let reply = ClockMessage::SyncResponse {
                        seq,
                        receive,
                        transmit: self.time.now(),
                    };
                    self.transport.send_to(&reply, peer).await?;
                    answered += 1;
                }
                ClockMessage::Announce { node_id, instance } if instance != self.instance => {
                    if node_id == own {
                        error!(node = %own, %peer, "Another node announced our id");
                        continue;
                    }
                    let reply = ClockMessage::Announce {
                        node_id: own,
                        instance: self.instance,
                    };
                    self.transport.send_to(&reply, peer).await?;
                    answered += 1;
                }
                _ => {}
            }
        }
        Ok(answered)
    }

    /// Release the transport; safe to call more than once
    pub async fn cleanup(&self) {
        if self.bound.swap(false, Ordering::SeqCst) {
            self.transport.close().await;
            debug!("Clock transport released");
        }
    }

    fn ensure_bound(&self) -> Result<()> {
        if self.bound.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SyncError::NotSetUp)
        }
    }

    /// `Ok(None)` on the master, the master's address on a slave
    async fn slave_master(&self) -> Result<Option<MasterInfo>> {
        self.ensure_bound()?;
        let node = self.node.read().await;
        match (node.role, node.master) {
            (Role::Master, _) => Ok(None),
            (Role::Slave, Some(master)) => Ok(Some(master)),
            _ => Err(SyncError::NotSetUp),
        }
    }

    async fn mark_stale(&self) {
        let mut node = self.node.write().await;
        node.sync_state = SyncState::Stale;
        warn!(offset = %node.clock_offset, "No sync sample arrived, keeping previous offset");
    }

    async fn sample_round(&self, master: MasterInfo) -> Option<ClockOffset> {
        let mut seq = self.next_seq.lock().await;
        let mut samples = Vec::with_capacity(self.config.samples);
        for i in 0..self.config.samples {
            if i > 0 {
                tokio::time::sleep(self.config.sample_spacing()).await;
            }
            *seq = seq.wrapping_add(1);
            match self.exchange(*seq, master.addr).await {
                Ok(Some(sample)) => samples.push(sample),
                Ok(None) => debug!(seq = *seq, "Sync sample lost"),
                Err(e) => warn!(seq = *seq, error = %e, "Sync exchange failed"),
            }
        }
        debug!(
            received = samples.len(),
            requested = self.config.samples,
            "Sampling round finished"
        );
        mean_offset(&samples)
    }

    async fn exchange(
        &self,
        seq: u32,
        master: SocketAddr,
    ) -> std::result::Result<Option<SyncSample>, TransportError> {
        let t1 = self.time.now();
        self.transport
            .send_to(&ClockMessage::SyncRequest { seq, origin: t1 }, master)
            .await?;

        let deadline = Instant::now() + self.config.sample_timeout();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            match self.transport.recv_timeout(remaining).await? {
                Some((
                    ClockMessage::SyncResponse {
                        seq: answered,
                        receive,
                        transmit,
                    },
                    _,
                )) if answered == seq => {
                    let t4 = self.time.now();
                    return Ok(Some(SyncSample {
                        t1,
                        t2: receive,
                        t3: transmit,
                        t4,
                    }));
                }
                Some(_) => {}
                None => return Ok(None),
            }
        }
    }
}
