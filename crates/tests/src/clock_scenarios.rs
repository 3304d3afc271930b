//! Clock sync scenarios over the in-memory broadcast network

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use house_audio_core::domain::config::ClockConfig;
use house_audio_core::domain::{
    ClockMessage, ClockOffset, ClockSyncEngine, ClockTransport, NodeId, Role, SyncState,
    Timestamp,
};
use house_audio_core::testing::{ManualTimeSource, MemoryClockNetwork};
use tokio::task::JoinHandle;

const MASTER_ID: NodeId = NodeId(1);

/// Per-request offsets in milliseconds; `None` drops the request
type Script = Arc<Mutex<VecDeque<Option<i64>>>>;

fn clock_config(samples: usize) -> ClockConfig {
    ClockConfig {
        samples,
        ..ClockConfig::default()
    }
}

/// A master that answers announcements and replies to sync requests as if
/// its clock were ahead by the scripted offset
///
/// Local time never advances, so t1 == t4 and the sample offset equals the
/// scripted one.
async fn spawn_scripted_master(network: &MemoryClockNetwork, script: Script) -> JoinHandle<()> {
    let transport = network.endpoint();
    transport
        .bind(ClockConfig::default().port)
        .await
        .expect("master binds");

    tokio::spawn(async move {
        while let Ok(Some((message, peer))) = transport.recv_timeout(Duration::from_secs(60)).await {
            match message {
                ClockMessage::Announce { node_id, .. } if node_id != MASTER_ID => {
                    let reply = ClockMessage::Announce {
                        node_id: MASTER_ID,
                        instance: 42,
                    };
                    let _ = transport.send_to(&reply, peer).await;
                }
                ClockMessage::SyncRequest { seq, origin } => {
                    let next = script.lock().unwrap().pop_front().flatten();
                    let Some(ms) = next else {
                        continue;
                    };
                    let at = Timestamp(origin.as_nanos() + ClockOffset::from_millis(ms).as_nanos());
                    let reply = ClockMessage::SyncResponse {
                        seq,
                        receive: at,
                        transmit: at,
                    };
                    let _ = transport.send_to(&reply, peer).await;
                }
                _ => {}
            }
        }
    })
}

fn script(offsets: &[Option<i64>]) -> Script {
    Arc::new(Mutex::new(offsets.iter().copied().collect()))
}

#[tokio::test(start_paused = true)]
async fn test_slave_adopts_mean_offset_without_lost_samples() {
    let network = MemoryClockNetwork::new();
    let offsets = script(&[Some(10), None, Some(10), Some(12), Some(8)]);
    let master = spawn_scripted_master(&network, offsets).await;

    let slave = ClockSyncEngine::new(
        NodeId(5),
        clock_config(5),
        Arc::new(network.endpoint()),
        Arc::new(ManualTimeSource::new(1_000_000_000)),
    );
    assert_eq!(slave.setup().await.unwrap(), Role::Slave);

    let node = slave.status().await;
    assert_eq!(node.master.map(|m| m.id), Some(MASTER_ID));
    assert_eq!(node.clock_offset, ClockOffset::from_millis(10));
    assert_eq!(node.sync_state, SyncState::Synced);
    assert_eq!(node.last_sync_at, Some(Timestamp(1_000_000_000)));

    slave.cleanup().await;
    master.abort();
}

#[tokio::test(start_paused = true)]
async fn test_drift_is_measured_against_aligned_offset() {
    let network = MemoryClockNetwork::new();
    let offsets = script(&[Some(10), Some(10)]);
    let master = spawn_scripted_master(&network, offsets.clone()).await;

    let time = Arc::new(ManualTimeSource::new(0));
    let slave = ClockSyncEngine::new(
        NodeId(5),
        clock_config(2),
        Arc::new(network.endpoint()),
        time.clone(),
    );
    slave.setup().await.unwrap();

    offsets.lock().unwrap().extend([Some(11), Some(11)]);
    time.advance(Duration::from_secs(10));
    let drift = slave.check_drift().await.unwrap();

    assert_eq!(drift, ClockOffset::from_millis(1));
    let node = slave.status().await;
    assert_eq!(node.clock_offset, ClockOffset::from_millis(10));
    assert!((node.drift_rate - 1e-4).abs() < 1e-9);

    offsets.lock().unwrap().extend([Some(11), Some(11)]);
    assert!(slave.realign().await.unwrap());
    assert_eq!(slave.status().await.clock_offset, ClockOffset::from_millis(11));

    slave.cleanup().await;
    master.abort();
}

#[tokio::test(start_paused = true)]
async fn test_silent_master_leaves_slave_stale() {
    let network = MemoryClockNetwork::new();
    let offsets = script(&[Some(10), Some(10)]);
    let master = spawn_scripted_master(&network, offsets).await;

    let slave = ClockSyncEngine::new(
        NodeId(5),
        clock_config(2),
        Arc::new(network.endpoint()),
        Arc::new(ManualTimeSource::new(0)),
    );
    slave.setup().await.unwrap();

    // Script exhausted: every further request is dropped
    let drift = slave.check_drift().await.unwrap();
    assert_eq!(drift, ClockOffset::ZERO);
    let node = slave.status().await;
    assert_eq!(node.sync_state, SyncState::Stale);
    assert_eq!(node.clock_offset, ClockOffset::from_millis(10));

    slave.cleanup().await;
    master.abort();
}

#[tokio::test(start_paused = true)]
async fn test_three_nodes_elect_lowest_and_slaves_sync() {
    let network = MemoryClockNetwork::new();
    let time = Arc::new(ManualTimeSource::new(0));

    let mut handles = Vec::new();
    for id in [5u64, 3, 9] {
        let engine = Arc::new(ClockSyncEngine::new(
            NodeId(id),
            clock_config(3),
            Arc::new(network.endpoint()),
            time.clone(),
        ));
        handles.push(tokio::spawn(async move {
            let role = engine.setup().await.expect("setup succeeds");
            if role == Role::Master {
                // Answer the slaves' first sampling round
                for _ in 0..8 {
                    engine
                        .serve(Duration::from_millis(250))
                        .await
                        .expect("serve succeeds");
                }
            }
            let node = engine.status().await;
            engine.cleanup().await;
            node
        }));
    }

    let mut nodes = Vec::new();
    for handle in handles {
        nodes.push(handle.await.unwrap());
    }

    let masters: Vec<_> = nodes.iter().filter(|n| n.role == Role::Master).collect();
    assert_eq!(masters.len(), 1);
    assert_eq!(masters[0].id, NodeId(3));

    for slave in nodes.iter().filter(|n| n.role == Role::Slave) {
        assert_eq!(slave.master.map(|m| m.id), Some(NodeId(3)));
        assert_eq!(slave.sync_state, SyncState::Synced);
        assert_eq!(slave.clock_offset, ClockOffset::ZERO);
    }
}

#[tokio::test(start_paused = true)]
async fn test_late_binder_learns_earlier_master() {
    let network = MemoryClockNetwork::new();
    let time = Arc::new(ManualTimeSource::new(0));

    let early = Arc::new(ClockSyncEngine::new(
        NodeId(3),
        clock_config(2),
        Arc::new(network.endpoint()),
        time.clone(),
    ));
    let master = {
        let early = early.clone();
        tokio::spawn(async move {
            let role = early.setup().await.expect("setup succeeds");
            for _ in 0..8 {
                early
                    .serve(Duration::from_millis(250))
                    .await
                    .expect("serve succeeds");
            }
            role
        })
    };

    // Bind only after the early node has broadcast its announcement
    tokio::time::sleep(Duration::from_millis(200)).await;
    let late = ClockSyncEngine::new(
        NodeId(9),
        clock_config(2),
        Arc::new(network.endpoint()),
        time.clone(),
    );
    assert_eq!(late.setup().await.unwrap(), Role::Slave);
    let node = late.status().await;
    assert_eq!(node.master.map(|m| m.id), Some(NodeId(3)));
    assert_eq!(node.sync_state, SyncState::Synced);

    assert_eq!(master.await.unwrap(), Role::Master);
    late.cleanup().await;
    early.cleanup().await;
}
