//! Routing scenarios against the in-memory audio graph
//!
//! These exercise the routing engine the way a node uses it over a whole
//! session: fan-out, a graph restart, removal and shutdown.

use std::sync::Arc;

use house_audio_core::domain::routing::{RoutingEngine, RoutingError};
use house_audio_core::domain::{BackendError, Channel, ChannelLink, DeviceId, RetryPolicy, Volume};
use house_audio_core::testing::MemoryAudioBackend;
use house_audio_tests::{mac, mono, stereo, PHONE, TABLET};

fn engine(backend: &Arc<MemoryAudioBackend>) -> RoutingEngine {
    RoutingEngine::new(backend.clone(), RetryPolicy::default())
}

fn lounge() -> DeviceId {
    DeviceId::new("lounge")
}

fn kitchen() -> DeviceId {
    DeviceId::new("kitchen")
}

// ============================================================================
// FAN-OUT
// ============================================================================

#[tokio::test]
async fn test_stereo_then_mono_fan_out_uses_three_links() {
    let backend = Arc::new(MemoryAudioBackend::new(vec![stereo("lounge"), mono("kitchen")]));
    let routing = engine(&backend);
    routing.discover_outputs().await.unwrap();

    let phone = mac(PHONE);
    let id = routing.create_route(&phone, &lounge()).await.unwrap();
    assert_eq!(routing.add_output(&phone, &kitchen()).await.unwrap(), id);

    let route = routing.route(id).await.unwrap();
    assert_eq!(route.targets, vec![lounge(), kitchen()]);
    assert_eq!(route.links.len(), 3);
    assert_eq!(route.links_to(&kitchen()).count(), 1);
    assert_eq!(backend.active_links().len(), 3);
    assert!(routing.verify_route(id).await.unwrap());
}

#[tokio::test]
async fn test_two_sources_share_an_output() {
    let backend = Arc::new(MemoryAudioBackend::new(vec![stereo("lounge")]));
    let routing = engine(&backend);
    routing.discover_outputs().await.unwrap();

    let a = routing.create_route(&mac(PHONE), &lounge()).await.unwrap();
    let b = routing.create_route(&mac(TABLET), &lounge()).await.unwrap();
    assert_ne!(a, b);
    assert_eq!(backend.active_links().len(), 4);

    routing.remove_route(a).await.unwrap();
    assert!(routing.verify_route(b).await.unwrap());
    assert_eq!(backend.active_links().len(), 2);
}

#[tokio::test]
async fn test_failed_second_channel_leaves_no_partial_links() {
    let backend = Arc::new(MemoryAudioBackend::new(vec![stereo("lounge"), stereo("porch")]));
    backend.fail_link(&DeviceId::new("porch"), Channel::FrontRight);
    let routing = engine(&backend);
    routing.discover_outputs().await.unwrap();

    let phone = mac(PHONE);
    let id = routing.create_route(&phone, &lounge()).await.unwrap();
    let result = routing.add_output(&phone, &DeviceId::new("porch")).await;

    assert!(matches!(result, Err(RoutingError::Backend(BackendError::CommandFailed(_)))));
    let route = routing.route(id).await.unwrap();
    assert_eq!(route.targets, vec![lounge()]);
    assert_eq!(backend.active_links().len(), 2);
}

// ============================================================================
// GRAPH RESTART
// ============================================================================

#[tokio::test]
async fn test_graph_restart_is_detected_and_repaired() {
    let backend = Arc::new(MemoryAudioBackend::new(vec![stereo("lounge"), mono("kitchen")]));
    let routing = engine(&backend);
    routing.discover_outputs().await.unwrap();

    let phone = mac(PHONE);
    let id = routing.create_route(&phone, &lounge()).await.unwrap();
    routing.add_output(&phone, &kitchen()).await.unwrap();

    backend.clear_links();
    let report = routing.check_health().await.unwrap();
    assert_eq!(report.len(), 1);
    assert!(!report[0].healthy);
    assert!(!routing.route(id).await.unwrap().healthy);

    assert!(routing.repair_route(id).await.unwrap());
    let route = routing.route(id).await.unwrap();
    assert!(route.healthy);
    assert_eq!(route.primary_target(), Some(&lounge()));
    assert_eq!(route.targets, vec![lounge(), kitchen()]);
    assert_eq!(backend.active_links().len(), 3);
}

#[tokio::test]
async fn test_single_dropped_link_fails_verification() {
    let backend = Arc::new(MemoryAudioBackend::new(vec![stereo("lounge")]));
    let routing = engine(&backend);
    routing.discover_outputs().await.unwrap();

    let phone = mac(PHONE);
    let id = routing.create_route(&phone, &lounge()).await.unwrap();
    backend.drop_link(&ChannelLink::new(phone, lounge(), Channel::FrontRight));

    assert!(!routing.verify_route(id).await.unwrap());
}

// ============================================================================
// VOLUME AND SHUTDOWN
// ============================================================================

#[tokio::test]
async fn test_volume_survives_unreadable_graph() {
    let backend = Arc::new(MemoryAudioBackend::new(vec![stereo("lounge")]));
    let routing = engine(&backend);
    routing.discover_outputs().await.unwrap();

    routing.set_volume(&lounge(), 0.4).await.unwrap();
    backend.fail_volume_reads(true);
    assert_eq!(routing.get_volume(&lounge()).await, Volume::new(0.4));
}

#[tokio::test]
async fn test_cleanup_unlinks_everything_and_mutes() {
    let backend = Arc::new(MemoryAudioBackend::new(vec![stereo("lounge"), mono("kitchen")]));
    let routing = engine(&backend);
    routing.discover_outputs().await.unwrap();

    let phone = mac(PHONE);
    routing.create_route(&phone, &lounge()).await.unwrap();
    routing.add_output(&phone, &kitchen()).await.unwrap();
    routing.set_volume(&lounge(), 0.9).await.unwrap();

    routing.cleanup().await;

    assert!(backend.active_links().is_empty());
    assert!(routing.routes().await.is_empty());
    assert_eq!(backend.volume(&lounge()), Some(0.0));
    assert_eq!(backend.volume(&kitchen()), Some(0.0));
}

#[tokio::test(start_paused = true)]
async fn test_discovery_waits_for_late_outputs() {
    let backend = Arc::new(MemoryAudioBackend::new(vec![stereo("lounge")]));
    backend.script_outputs(vec![Ok(Vec::new()), Ok(Vec::new())]);
    let routing = engine(&backend);

    let outputs = routing.discover_outputs().await.unwrap();
    assert_eq!(outputs.len(), 1);
    assert_eq!(backend.list_calls(), 3);
}
