//! Shared fixtures for the scenario tests

use std::sync::Arc;

use house_audio_core::domain::{
    ChannelCount, Collaborators, DeviceId, DeviceInfo, MacAddress, Mode, NodeConfig, NodeId,
    NodeOrchestrator, OutputDevice,
};
use house_audio_core::testing::{MemoryAudioBackend, MemoryBluetoothStack};

pub const PHONE: &str = "AA:BB:CC:DD:EE:FF";
pub const TABLET: &str = "11:22:33:44:55:66";

pub fn mac(s: &str) -> MacAddress {
    s.parse().expect("valid MAC literal")
}

pub fn stereo(id: &str) -> OutputDevice {
    OutputDevice::new(DeviceId::new(id), id, ChannelCount::Stereo)
}

pub fn mono(id: &str) -> OutputDevice {
    OutputDevice::new(DeviceId::new(id), id, ChannelCount::Mono)
}

pub fn phone_info() -> DeviceInfo {
    DeviceInfo {
        name: Some("Pixel 7".to_string()),
        uuids: vec!["Audio Source".to_string()],
        paired: true,
        trusted: true,
        ..DeviceInfo::default()
    }
}

/// A node under test with handles to its in-memory collaborators
pub struct TestNode {
    pub node: NodeOrchestrator,
    pub audio: Arc<MemoryAudioBackend>,
    pub bluetooth: Arc<MemoryBluetoothStack>,
}

pub fn config(mode: Mode) -> NodeConfig {
    NodeConfig {
        mode,
        ..NodeConfig::default()
    }
}

/// Standalone node with a stereo `lounge` (the graph default) and a mono `kitchen`
pub fn standalone_node() -> TestNode {
    let audio = Arc::new(MemoryAudioBackend::new(vec![stereo("lounge"), mono("kitchen")]));
    audio.set_default_output(Some(DeviceId::new("lounge")));
    let bluetooth = Arc::new(MemoryBluetoothStack::new());
    bluetooth.add_device(mac(PHONE), phone_info());
    build(config(Mode::Standalone), audio, bluetooth, |c| c)
}

pub fn build(
    config: NodeConfig,
    audio: Arc<MemoryAudioBackend>,
    bluetooth: Arc<MemoryBluetoothStack>,
    customize: impl FnOnce(Collaborators) -> Collaborators,
) -> TestNode {
    let collaborators = customize(Collaborators::new(audio.clone(), bluetooth.clone()));
    let node = NodeOrchestrator::new(NodeId(1), config, collaborators).expect("node builds");
    TestNode {
        node,
        audio,
        bluetooth,
    }
}
