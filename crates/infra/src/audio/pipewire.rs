//! PipeWire audio backend over the command line tools
//!
//! Outputs come from `pw-dump`, links are managed with `pw-link` and volume
//! goes through `wpctl` with `pw-cli` as fallback. Bluetooth sources appear
//! as `bluez_source.<MAC>` nodes exposing `monitor_FL`/`monitor_FR` ports;
//! sinks expose `playback_FL`/`playback_FR`.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use house_audio_core::domain::audio::{
    AudioBackend, BackendError, BackendResult, Channel, ChannelCount, ChannelLink, DeviceId,
    OutputDevice, SampleRate, SourceChannel, TargetChannel, Volume,
};
use house_audio_core::domain::bluetooth::MacAddress;

use crate::command::{CommandOutput, CommandRunner, TokioCommandRunner};

const DEFAULT_CHANNELS: u16 = 2;
const DEFAULT_RATE: u32 = 44100;

/// A sink node as reported by `pw-dump`
#[derive(Debug, Clone, PartialEq)]
pub struct PwSink {
    pub id: u32,
    pub name: String,
    pub description: String,
    pub channels: u16,
    pub rate: u32,
}

impl PwSink {
    fn to_output(&self) -> OutputDevice {
        let mut output = OutputDevice::new(
            DeviceId::new(self.name.clone()),
            self.description.clone(),
            ChannelCount::from_count(self.channels),
        );
        output.sample_rate = SampleRate::from_hz(self.rate);
        output
    }
}

/// Audio sinks (`media.class == "Audio/Sink"`) in a `pw-dump` document
pub fn parse_sinks(dump: &str) -> BackendResult<Vec<PwSink>> {
    let objects: Vec<Value> =
        serde_json::from_str(dump).map_err(|e| BackendError::Parse(format!("pw-dump: {e}")))?;

    let sinks = objects
        .iter()
        .filter(|obj| obj["type"] == "PipeWire:Interface:Node")
        .filter_map(|obj| {
            let props = &obj["info"]["props"];
            if props["media.class"] != "Audio/Sink" {
                return None;
            }
            let id = obj["id"].as_u64().and_then(|id| u32::try_from(id).ok())?;
            let name = props["node.name"].as_str()?.to_string();
            let description = props["node.description"]
                .as_str()
                .unwrap_or(&name)
                .to_string();
            let channels = props["audio.channels"]
                .as_u64()
                .and_then(|c| u16::try_from(c).ok())
                .unwrap_or(DEFAULT_CHANNELS);
            let rate = props["audio.rate"]
                .as_u64()
                .and_then(|r| u32::try_from(r).ok())
                .unwrap_or(DEFAULT_RATE);
            Some(PwSink {
                id,
                name,
                description,
                channels,
                rate,
            })
        })
        .collect();
    Ok(sinks)
}

/// Name of the default sink from the `default` metadata object
pub fn parse_default_sink(dump: &str) -> Option<String> {
    let objects: Vec<Value> = serde_json::from_str(dump).ok()?;
    objects
        .iter()
        .filter(|obj| obj["type"] == "PipeWire:Interface:Metadata")
        .filter(|obj| obj["props"]["metadata.name"] == "default")
        .filter_map(|obj| obj["metadata"].as_array())
        .flatten()
        .find(|entry| entry["key"] == "default.audio.sink")
        .and_then(|entry| entry["value"]["name"].as_str())
        .map(str::to_string)
}

pub fn source_port(source: &SourceChannel) -> String {
    format!(
        "bluez_source.{}:monitor_{}",
        source.mac.underscored(),
        source.channel.suffix()
    )
}

pub fn target_port(target: &TargetChannel) -> String {
    format!("{}:playback_{}", target.device, target.channel.suffix())
}

fn parse_source_port(port: &str) -> Option<SourceChannel> {
    let rest = port.strip_prefix("bluez_source.")?;
    let (mac, channel) = rest.split_once(":monitor_")?;
    Some(SourceChannel {
        mac: mac.parse::<MacAddress>().ok()?,
        channel: Channel::from_suffix(channel)?,
    })
}

fn parse_target_port(port: &str) -> Option<TargetChannel> {
    let (device, channel) = port.rsplit_once(":playback_")?;
    Some(TargetChannel {
        device: DeviceId::new(device),
        channel: Channel::from_suffix(channel)?,
    })
}

/// Bluetooth-source links in `pw-link -l` output
///
/// Each port line is followed by indented `|->` (outgoing) and `|<-`
/// (incoming) lines; only outgoing links from Bluetooth monitors are kept.
pub fn parse_links(listing: &str) -> HashSet<ChannelLink> {
    let mut links = HashSet::new();
    let mut current: Option<SourceChannel> = None;
    for line in listing.lines() {
        if !line.starts_with(char::is_whitespace) {
            current = parse_source_port(line.trim());
            continue;
        }
        let Some(peer) = line.trim().strip_prefix("|->") else {
            continue;
        };
        if let (Some(source), Some(target)) = (&current, parse_target_port(peer.trim())) {
            links.insert(ChannelLink {
                source: source.clone(),
                target,
            });
        }
    }
    links
}

/// `Volume: 0.75` or `Volume: 0.40 [MUTED]`
pub fn parse_wpctl_volume(output: &str) -> Option<f32> {
    output
        .lines()
        .find_map(|line| line.trim().strip_prefix("Volume:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|value| value.parse().ok())
}

/// [`AudioBackend`] driving PipeWire through its command line tools
pub struct PipeWireCli {
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
    node_ids: Mutex<HashMap<String, u32>>,
}

impl PipeWireCli {
    pub fn new() -> Self {
        Self::with_runner(Arc::new(TokioCommandRunner))
    }

    pub fn with_runner(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            timeout: Duration::from_secs(5),
            node_ids: Mutex::new(HashMap::new()),
        }
    }

    /// Upper bound for each tool invocation
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn run(&self, program: &str, args: &[&str]) -> BackendResult<CommandOutput> {
        self.runner.run(program, args, self.timeout).await
    }

    async fn dump(&self) -> BackendResult<String> {
        let output = self.run("pw-dump", &[]).await?;
        if !output.success {
            return Err(BackendError::CommandFailed(format!("pw-dump: {}", output.stderr.trim())));
        }
        Ok(output.stdout)
    }

    /// Numeric node id for `wpctl`/`pw-cli`, refreshing the map once on a miss
    async fn node_id(&self, device: &DeviceId) -> BackendResult<String> {
        if let Some(id) = self.cached_node_id(device) {
            return Ok(id.to_string());
        }
        self.list_outputs().await?;
        self.cached_node_id(device)
            .map(|id| id.to_string())
            .ok_or_else(|| BackendError::CommandFailed(format!("no PipeWire node named {device}")))
    }

    fn cached_node_id(&self, device: &DeviceId) -> Option<u32> {
        self.node_ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(device.as_str())
            .copied()
    }
}

impl Default for PipeWireCli {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AudioBackend for PipeWireCli {
    #[instrument(skip(self))]
    async fn list_outputs(&self) -> BackendResult<Vec<OutputDevice>> {
        let sinks = parse_sinks(&self.dump().await?)?;
        {
            let mut ids = self.node_ids.lock().unwrap_or_else(PoisonError::into_inner);
            ids.clear();
            ids.extend(sinks.iter().map(|sink| (sink.name.clone(), sink.id)));
        }
        debug!(count = sinks.len(), "PipeWire sinks listed");
        Ok(sinks.iter().map(PwSink::to_output).collect())
    }

    async fn link(&self, link: &ChannelLink) -> BackendResult<()> {
        let source = source_port(&link.source);
        let target = target_port(&link.target);
        let output = self.run("pw-link", &[&source, &target]).await?;
        if output.success || output.combined().contains("File exists") {
            debug!(%source, %target, "Linked");
            return Ok(());
        }
        Err(BackendError::CommandFailed(format!(
            "pw-link {source} {target}: {}",
            output.stderr.trim()
        )))
    }

    async fn unlink(&self, link: &ChannelLink) -> BackendResult<()> {
        let source = source_port(&link.source);
        let target = target_port(&link.target);
        let output = self.run("pw-link", &["-d", &source, &target]).await?;
        if output.success || output.combined().contains("No such") {
            return Ok(());
        }
        Err(BackendError::CommandFailed(format!(
            "pw-link -d {source} {target}: {}",
            output.stderr.trim()
        )))
    }

    async fn list_active_links(&self) -> BackendResult<HashSet<ChannelLink>> {
        let output = self.run("pw-link", &["-l"]).await?;
        if !output.success {
            return Err(BackendError::CommandFailed(format!("pw-link -l: {}", output.stderr.trim())));
        }
        Ok(parse_links(&output.stdout))
    }

    async fn set_volume(&self, device: &DeviceId, volume: Volume) -> BackendResult<()> {
        let id = self.node_id(device).await?;
        let level = format!("{:.2}", volume.get());
        let output = self.run("wpctl", &["set-volume", &id, &level]).await?;
        if output.success {
            return Ok(());
        }

        warn!(device = %device, stderr = %output.stderr.trim(), "wpctl failed, trying pw-cli");
        let props = format!("{{ volume: {level} }}");
        let fallback = self.run("pw-cli", &["set-param", &id, "Props", &props]).await?;
        if fallback.success {
            info!(device = %device, "Volume set through pw-cli");
            Ok(())
        } else {
            Err(BackendError::CommandFailed(format!(
                "cannot set volume of {device}: {}",
                fallback.stderr.trim()
            )))
        }
    }

    async fn get_volume(&self, device: &DeviceId) -> BackendResult<Option<f32>> {
        let id = self.node_id(device).await?;
        let output = self.run("wpctl", &["get-volume", &id]).await?;
        if !output.success {
            return Err(BackendError::CommandFailed(format!(
                "wpctl get-volume {id}: {}",
                output.stderr.trim()
            )));
        }
        Ok(parse_wpctl_volume(&output.stdout))
    }

    async fn default_output(&self) -> BackendResult<Option<DeviceId>> {
        Ok(parse_default_sink(&self.dump().await?).map(DeviceId::new))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::scripted::ScriptedRunner;

    const DUMP: &str = r#"[
        {"id": 31, "type": "PipeWire:Interface:Metadata",
         "props": {"metadata.name": "default"},
         "metadata": [
            {"subject": 0, "key": "default.audio.sink", "type": "Spa:String:JSON",
             "value": {"name": "alsa_output.hifiberry"}}
         ]},
        {"id": 42, "type": "PipeWire:Interface:Node",
         "info": {"props": {"media.class": "Audio/Sink",
                            "node.name": "alsa_output.hifiberry",
                            "node.description": "HiFiBerry DAC",
                            "audio.channels": 2, "audio.rate": 48000}}},
        {"id": 43, "type": "PipeWire:Interface:Node",
         "info": {"props": {"media.class": "Audio/Sink",
                            "node.name": "kitchen_mono",
                            "audio.channels": 1}}},
        {"id": 50, "type": "PipeWire:Interface:Node",
         "info": {"props": {"media.class": "Audio/Source",
                            "node.name": "bluez_source.AA_BB_CC_DD_EE_FF"}}}
    ]"#;

    const LINKS: &str = "\
bluez_source.AA_BB_CC_DD_EE_FF:monitor_FL
  |-> alsa_output.hifiberry:playback_FL
  |-> kitchen_mono:playback_FL
bluez_source.AA_BB_CC_DD_EE_FF:monitor_FR
  |-> alsa_output.hifiberry:playback_FR
alsa_output.hifiberry:playback_FL
  |<- bluez_source.AA_BB_CC_DD_EE_FF:monitor_FL
some_app:output_FL
  |-> alsa_output.hifiberry:playback_FL
";

    fn mac() -> MacAddress {
        "AA:BB:CC:DD:EE:FF".parse().unwrap()
    }

    #[test]
    fn test_parse_sinks_applies_defaults() {
        let sinks = parse_sinks(DUMP).unwrap();
        assert_eq!(sinks.len(), 2);
        assert_eq!(sinks[0].description, "HiFiBerry DAC");
        assert_eq!(sinks[0].rate, 48000);
        assert_eq!(sinks[1].description, "kitchen_mono");
        assert_eq!(sinks[1].channels, 1);
        assert_eq!(sinks[1].rate, DEFAULT_RATE);
        assert!(sinks[1].to_output().is_mono());
    }

    #[test]
    fn test_parse_sinks_rejects_garbage() {
        assert!(matches!(parse_sinks("not json"), Err(BackendError::Parse(_))));
    }

    #[test]
    fn test_parse_default_sink() {
        assert_eq!(parse_default_sink(DUMP).as_deref(), Some("alsa_output.hifiberry"));
        assert_eq!(parse_default_sink("[]"), None);
    }

    #[test]
    fn test_parse_links_keeps_bluetooth_sources() {
        let links = parse_links(LINKS);
        assert_eq!(links.len(), 3);
        assert!(links.contains(&ChannelLink::new(
            mac(),
            DeviceId::new("kitchen_mono"),
            Channel::FrontLeft
        )));
        assert!(links.contains(&ChannelLink::new(
            mac(),
            DeviceId::new("alsa_output.hifiberry"),
            Channel::FrontRight
        )));
    }

    #[test]
    fn test_port_names() {
        let link = ChannelLink::new(mac(), DeviceId::new("alsa_output.hifiberry"), Channel::FrontRight);
        assert_eq!(source_port(&link.source), "bluez_source.AA_BB_CC_DD_EE_FF:monitor_FR");
        assert_eq!(target_port(&link.target), "alsa_output.hifiberry:playback_FR");
    }

    #[test]
    fn test_parse_wpctl_volume() {
        assert_eq!(parse_wpctl_volume("Volume: 0.75\n"), Some(0.75));
        assert_eq!(parse_wpctl_volume("Volume: 0.40 [MUTED]"), Some(0.40));
        assert_eq!(parse_wpctl_volume("error"), None);
    }

    #[tokio::test]
    async fn test_existing_link_counts_as_success() {
        let runner = Arc::new(ScriptedRunner::default());
        runner.answer(
            "pw-link bluez_source.AA_BB_CC_DD_EE_FF:monitor_FL kitchen_mono:playback_FL",
            CommandOutput::failed("failed to link ports: File exists"),
        );
        let backend = PipeWireCli::with_runner(runner.clone());

        let link = ChannelLink::new(mac(), DeviceId::new("kitchen_mono"), Channel::FrontLeft);
        assert!(backend.link(&link).await.is_ok());
    }

    #[tokio::test]
    async fn test_volume_falls_back_to_pw_cli() {
        let runner = Arc::new(ScriptedRunner::default());
        runner.answer("pw-dump", CommandOutput::ok(DUMP));
        runner.answer("wpctl set-volume 42 0.70", CommandOutput::failed("not supported"));
        let backend = PipeWireCli::with_runner(runner.clone());

        let device = DeviceId::new("alsa_output.hifiberry");
        backend
            .set_volume(&device, Volume::new(0.7).unwrap())
            .await
            .unwrap();
        assert_eq!(
            runner.calls(),
            vec![
                "pw-dump".to_string(),
                "wpctl set-volume 42 0.70".to_string(),
                "pw-cli set-param 42 Props { volume: 0.70 }".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_unknown_node_volume_fails() {
        let runner = Arc::new(ScriptedRunner::default());
        runner.answer("pw-dump", CommandOutput::ok(DUMP));
        let backend = PipeWireCli::with_runner(runner);

        let result = backend.get_volume(&DeviceId::new("attic")).await;
        assert!(matches!(result, Err(BackendError::CommandFailed(_))));
    }
}
