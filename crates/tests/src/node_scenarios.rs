//! Node lifecycle and monitor scenarios
//!
//! Every test runs on paused tokio time so the stabilization delay, the
//! connect timeout and the monitor intervals elapse instantly.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use house_audio_core::domain::{
    BackendError, Channel, ChannelLink, DeviceAction, DeviceId, HandoffAdvisor, MacAddress, Mode,
    NetworkStats, NodeAddress, NodeError, NodePhase, Role, RoutingError, Subsystem,
};
use house_audio_core::testing::{
    MemoryAudioBackend, MemoryBluetoothStack, MemoryClockNetwork, MemoryNetworkProbe,
};
use house_audio_tests::{build, config, mac, phone_info, standalone_node, stereo, PHONE};

fn lounge() -> DeviceId {
    DeviceId::new("lounge")
}

/// Advises a move to the same peer every time and counts the questions
#[derive(Default)]
struct AlwaysMove {
    asked: AtomicUsize,
}

#[async_trait]
impl HandoffAdvisor for AlwaysMove {
    async fn evaluate(&self, _mac: &MacAddress, _rssi: Option<i16>) -> Option<NodeAddress> {
        self.asked.fetch_add(1, Ordering::SeqCst);
        Some(NodeAddress::new("10.0.0.9:319"))
    }
}

// ============================================================================
// LIFECYCLE
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_start_makes_node_discoverable_and_running() {
    let t = standalone_node();
    t.node.start().await.unwrap();

    assert_eq!(t.node.phase().await, NodePhase::Running);
    assert_eq!(t.bluetooth.discoverable(), Some(true));

    let state = t.node.state().await;
    assert!(state.running);
    assert_eq!(state.mode, Mode::Standalone);
    assert_eq!(state.outputs.len(), 2);
    assert_eq!(state.devices.len(), 1);
    assert_eq!(state.node.role, Role::Undetermined);

    t.node.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_commands_require_running_node() {
    let t = standalone_node();
    let result = t
        .node
        .handle_bluetooth_device(&mac(PHONE), DeviceAction::Connect)
        .await;
    assert!(matches!(result, Err(NodeError::NotRunning(NodePhase::Stopped))));
    assert!(matches!(
        t.node.set_volume(&lounge(), 0.5).await,
        Err(NodeError::NotRunning(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_second_start_is_rejected() {
    let t = standalone_node();
    t.node.start().await.unwrap();
    assert!(matches!(
        t.node.start().await,
        Err(NodeError::AlreadyStarted(NodePhase::Running))
    ));
    t.node.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_stop_releases_everything_and_is_idempotent() {
    let t = standalone_node();
    t.node.start().await.unwrap();
    let phone = mac(PHONE);
    t.node
        .handle_bluetooth_device(&phone, DeviceAction::Connect)
        .await
        .unwrap();

    t.node.stop().await.unwrap();
    t.node.stop().await.unwrap();

    assert_eq!(t.node.phase().await, NodePhase::Stopped);
    assert!(t.audio.active_links().is_empty());
    assert_eq!(t.audio.volume(&lounge()), Some(0.0));
    assert_eq!(t.bluetooth.discoverable(), Some(false));
    assert_eq!(t.bluetooth.disconnected(), vec![phone]);
    assert!(!t.node.state().await.running);
}

#[tokio::test(start_paused = true)]
async fn test_failed_setup_returns_to_stopped() {
    let audio = Arc::new(MemoryAudioBackend::new(vec![stereo("lounge")]));
    audio.script_outputs(
        (0..3)
            .map(|_| Err(BackendError::Unavailable("no graph".to_string())))
            .collect(),
    );
    let t = build(config(Mode::Standalone), audio, Arc::new(MemoryBluetoothStack::new()), |c| c);

    let result = t.node.start().await;
    assert!(matches!(result, Err(NodeError::Routing(RoutingError::Backend(_)))));
    assert_eq!(t.node.phase().await, NodePhase::Stopped);

    let state = t.node.state().await;
    assert!(state.last_errors.contains_key(&Subsystem::Routing));
    assert_eq!(t.bluetooth.discoverable(), Some(false));
}

#[tokio::test(start_paused = true)]
async fn test_run_stops_on_shutdown_signal() {
    let t = standalone_node();
    let node = t.node.clone();
    node.run(tokio::time::sleep(Duration::from_secs(3))).await.unwrap();
    assert_eq!(t.node.phase().await, NodePhase::Stopped);
}

// ============================================================================
// CONNECT / DISCONNECT
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_connect_routes_to_default_output_at_default_volume() {
    let t = standalone_node();
    t.node.start().await.unwrap();
    let phone = mac(PHONE);

    let route = t
        .node
        .handle_bluetooth_device(&phone, DeviceAction::Connect)
        .await
        .unwrap()
        .expect("connect returns the new route");

    assert!(t.bluetooth.is_connected(&phone));
    assert_eq!(t.audio.active_links().len(), 2);
    assert_eq!(t.audio.volume(&lounge()), Some(0.7));

    let state = t.node.refresh_state().await;
    assert_eq!(state.routes.len(), 1);
    assert_eq!(state.routes[0].id, route);
    assert_eq!(state.routes[0].primary_target(), Some(&lounge()));

    t.node.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_connect_timeout_creates_no_route() {
    let t = standalone_node();
    t.bluetooth.set_connect_delay(Duration::from_secs(45));
    t.node.start().await.unwrap();

    let result = t
        .node
        .handle_bluetooth_device(&mac(PHONE), DeviceAction::Connect)
        .await;

    assert!(matches!(result, Err(NodeError::ConnectTimeout { .. })));
    let state = t.node.refresh_state().await;
    assert!(state.routes.is_empty());
    assert!(state.last_errors.contains_key(&Subsystem::Bluetooth));
    t.node.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_refused_connect_creates_no_route() {
    let t = standalone_node();
    t.bluetooth.refuse_connect(&mac(PHONE));
    t.node.start().await.unwrap();

    let result = t
        .node
        .handle_bluetooth_device(&mac(PHONE), DeviceAction::Connect)
        .await;

    assert!(matches!(result, Err(NodeError::ConnectRefused(_))));
    assert!(t.audio.active_links().is_empty());
    t.node.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_failed_default_volume_removes_the_new_route() {
    let t = standalone_node();
    t.audio.fail_volume_writes(&lounge());
    t.node.start().await.unwrap();

    let result = t
        .node
        .handle_bluetooth_device(&mac(PHONE), DeviceAction::Connect)
        .await;

    assert!(matches!(result, Err(NodeError::Routing(RoutingError::Backend(_)))));
    assert!(t.node.refresh_state().await.routes.is_empty());
    assert!(t.audio.active_links().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_keeps_routes() {
    let t = standalone_node();
    t.node.start().await.unwrap();
    let phone = mac(PHONE);
    t.node
        .handle_bluetooth_device(&phone, DeviceAction::Connect)
        .await
        .unwrap();

    let result = t
        .node
        .handle_bluetooth_device(&phone, DeviceAction::Disconnect)
        .await
        .unwrap();

    assert_eq!(result, None);
    assert!(!t.bluetooth.is_connected(&phone));
    assert_eq!(t.node.refresh_state().await.routes.len(), 1);
    t.node.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_volume_commands_accept_default_alias() {
    let t = standalone_node();
    t.node.start().await.unwrap();

    t.node.set_volume(&DeviceId::new("default"), 0.25).await.unwrap();
    assert_eq!(t.audio.volume(&lounge()), Some(0.25));
    assert!(matches!(
        t.node.set_volume(&lounge(), 1.5).await,
        Err(NodeError::Routing(RoutingError::InvalidArgument(_)))
    ));
    assert_eq!(t.audio.volume(&lounge()), Some(0.25));
    t.node.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_handoff_without_route_is_rejected() {
    let t = standalone_node();
    t.node.start().await.unwrap();

    let result = t.node.handoff(&mac(PHONE), NodeAddress::new("10.0.0.9:319")).await;
    assert!(matches!(
        result,
        Err(NodeError::Routing(RoutingError::NoRouteForSource(_)))
    ));
    t.node.stop().await.unwrap();
}

// ============================================================================
// MONITORS
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_route_health_monitor_repairs_dropped_links() {
    let t = standalone_node();
    t.node.start().await.unwrap();
    let phone = mac(PHONE);
    t.node
        .handle_bluetooth_device(&phone, DeviceAction::Connect)
        .await
        .unwrap();

    t.audio
        .drop_link(&ChannelLink::new(phone, lounge(), Channel::FrontRight));
    assert_eq!(t.audio.active_links().len(), 1);

    tokio::time::sleep(Duration::from_secs(6)).await;

    assert_eq!(t.audio.active_links().len(), 2);
    t.node.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_state_refresh_monitor_updates_snapshot() {
    let t = standalone_node();
    t.node.start().await.unwrap();
    t.node
        .handle_bluetooth_device(&mac(PHONE), DeviceAction::Connect)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(6)).await;

    assert_eq!(t.node.state().await.routes.len(), 1);
    t.node.stop().await.unwrap();
}

fn distributed_node(
    network: &MemoryClockNetwork,
    probe: Arc<MemoryNetworkProbe>,
    advisor: Arc<AlwaysMove>,
) -> house_audio_tests::TestNode {
    let audio = Arc::new(MemoryAudioBackend::new(vec![stereo("lounge")]));
    let bluetooth = Arc::new(MemoryBluetoothStack::new());
    bluetooth.add_device(mac(PHONE), phone_info());
    let transport = Arc::new(network.endpoint());
    build(config(Mode::Distributed), audio, bluetooth, move |c| {
        c.with_clock_transport(transport)
            .with_network_probe(probe)
            .with_handoff_advisor(advisor)
    })
}

#[tokio::test(start_paused = true)]
async fn test_lone_distributed_node_becomes_master() {
    let network = MemoryClockNetwork::new();
    let t = distributed_node(
        &network,
        Arc::new(MemoryNetworkProbe::default()),
        Arc::new(AlwaysMove::default()),
    );
    t.node.start().await.unwrap();

    let state = t.node.state().await;
    assert_eq!(state.node.role, Role::Master);
    t.node.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_network_monitor_adjusts_buffer_on_jitter() {
    let network = MemoryClockNetwork::new();
    let probe = Arc::new(MemoryNetworkProbe::default());
    probe.set_stats(Some(NetworkStats {
        latency: Duration::from_millis(20),
        jitter: Duration::from_millis(8),
    }));
    let t = distributed_node(&network, probe.clone(), Arc::new(AlwaysMove::default()));
    t.node.start().await.unwrap();

    tokio::time::sleep(Duration::from_millis(5500)).await;

    assert_eq!(probe.adjustments().len(), 1);
    assert_eq!(probe.adjustments()[0].jitter, Duration::from_millis(8));
    t.node.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_network_monitor_ignores_low_jitter() {
    let network = MemoryClockNetwork::new();
    let probe = Arc::new(MemoryNetworkProbe::default());
    probe.set_stats(Some(NetworkStats {
        latency: Duration::from_millis(20),
        jitter: Duration::from_millis(2),
    }));
    let t = distributed_node(&network, probe.clone(), Arc::new(AlwaysMove::default()));
    t.node.start().await.unwrap();

    tokio::time::sleep(Duration::from_secs(11)).await;

    assert!(probe.adjustments().is_empty());
    t.node.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_poor_signal_consults_advisor_in_distributed_mode() {
    let network = MemoryClockNetwork::new();
    let advisor = Arc::new(AlwaysMove::default());
    let t = distributed_node(&network, Arc::new(MemoryNetworkProbe::default()), advisor.clone());
    t.node.start().await.unwrap();
    let phone = mac(PHONE);
    t.node
        .handle_bluetooth_device(&phone, DeviceAction::Connect)
        .await
        .unwrap();
    t.bluetooth.set_rssi(&phone, Some(-90));

    tokio::time::sleep(Duration::from_millis(1500)).await;

    assert!(advisor.asked.load(Ordering::SeqCst) >= 1);
    let state = t.node.refresh_state().await;
    // The single-node phases decline at prepare, so the stream stays put
    assert!(state.last_errors.contains_key(&Subsystem::Handoff));
    assert_eq!(state.routes.len(), 1);
    assert_eq!(t.audio.active_links().len(), 2);
    t.node.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_poor_signal_is_only_logged_when_standalone() {
    let advisor = Arc::new(AlwaysMove::default());
    let audio = Arc::new(MemoryAudioBackend::new(vec![stereo("lounge")]));
    audio.set_default_output(Some(lounge()));
    let bluetooth = Arc::new(MemoryBluetoothStack::new());
    let handle = advisor.clone();
    let t = build(config(Mode::Standalone), audio, bluetooth, move |c| {
        c.with_handoff_advisor(handle)
    });
    t.node.start().await.unwrap();
    let phone = mac(PHONE);
    t.node
        .handle_bluetooth_device(&phone, DeviceAction::Connect)
        .await
        .unwrap();
    t.bluetooth.set_rssi(&phone, Some(-95));

    tokio::time::sleep(Duration::from_secs(11)).await;

    assert_eq!(advisor.asked.load(Ordering::SeqCst), 0);
    assert!(!t
        .node
        .refresh_state()
        .await
        .last_errors
        .contains_key(&Subsystem::Handoff));
    t.node.stop().await.unwrap();
}
