//! Audio output abstractions and the routing backend capability
//!
//! This module defines the platform-agnostic view of speaker outputs and the
//! channel links between a Bluetooth source and those outputs. The graph engine
//! that actually carries the audio (PipeWire on a typical node) lives in the
//! `infra` crate behind [`AudioBackend`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::domain::bluetooth::MacAddress;

/// Errors raised by an external collaborator (audio graph or Bluetooth stack)
#[derive(Debug, Error)]
pub enum BackendError {
    /// The collaborator rejected the request
    #[error("Command failed: {0}")]
    CommandFailed(String),

    /// The collaborator answered with something we could not interpret
    #[error("Unexpected backend output: {0}")]
    Parse(String),

    /// The collaborator did not answer in time
    #[error("Backend call timed out after {0:?}")]
    Timeout(Duration),

    /// Input/Output error at the OS level
    #[error("OS error: {0}")]
    Io(#[from] std::io::Error),

    /// The collaborator is not reachable at all
    #[error("Backend unavailable: {0}")]
    Unavailable(String),
}

pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Unique identifier for an output device
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Audio sample rate in Hz
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleRate {
    Hz44100,
    Hz48000,
    Hz96000,
    Custom(u32),
}

impl SampleRate {
    pub fn hz(&self) -> u32 {
        match self {
            SampleRate::Hz44100 => 44100,
            SampleRate::Hz48000 => 48000,
            SampleRate::Hz96000 => 96000,
            SampleRate::Custom(hz) => *hz,
        }
    }

    pub fn from_hz(hz: u32) -> Self {
        match hz {
            44100 => SampleRate::Hz44100,
            48000 => SampleRate::Hz48000,
            96000 => SampleRate::Hz96000,
            hz => SampleRate::Custom(hz),
        }
    }
}

/// Number of audio channels an output accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelCount {
    Mono,
    Stereo,
    Surround(u16),
}

impl ChannelCount {
    pub fn count(&self) -> u16 {
        match self {
            ChannelCount::Mono => 1,
            ChannelCount::Stereo => 2,
            ChannelCount::Surround(n) => *n,
        }
    }

    pub fn from_count(count: u16) -> Self {
        match count {
            1 => ChannelCount::Mono,
            2 => ChannelCount::Stereo,
            n => ChannelCount::Surround(n),
        }
    }
}

/// Logical channel position carried by a link
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Channel {
    FrontLeft,
    FrontRight,
}

impl Channel {
    /// Short positional suffix used by graph engines (`FL`, `FR`)
    pub fn suffix(&self) -> &'static str {
        match self {
            Channel::FrontLeft => "FL",
            Channel::FrontRight => "FR",
        }
    }

    pub fn from_suffix(suffix: &str) -> Option<Self> {
        match suffix {
            "FL" => Some(Channel::FrontLeft),
            "FR" => Some(Channel::FrontRight),
            _ => None,
        }
    }
}

/// One channel of a Bluetooth source
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SourceChannel {
    pub mac: MacAddress,
    pub channel: Channel,
}

/// One channel of an output device
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TargetChannel {
    pub device: DeviceId,
    pub channel: Channel,
}

/// A single source-channel to target-channel link in the audio graph
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChannelLink {
    pub source: SourceChannel,
    pub target: TargetChannel,
}

impl ChannelLink {
    pub fn new(mac: MacAddress, device: DeviceId, channel: Channel) -> Self {
        Self {
            source: SourceChannel { mac, channel },
            target: TargetChannel { device, channel },
        }
    }
}

impl fmt::Display for ChannelLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{}",
            self.source.mac,
            self.source.channel.suffix(),
            self.target.device,
            self.target.channel.suffix()
        )
    }
}

/// Linear output volume, always within `0.0..=1.0`
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct Volume(f32);

impl Volume {
    pub const MUTE: Volume = Volume(0.0);
    pub const FULL: Volume = Volume(1.0);

    /// Returns `None` for values outside `0.0..=1.0` (including NaN)
    pub fn new(value: f32) -> Option<Self> {
        (0.0..=1.0).contains(&value).then_some(Self(value))
    }

    /// Pull an out-of-range reading back into `0.0..=1.0`; NaN becomes mute
    pub fn clamped(value: f32) -> Self {
        if value.is_nan() {
            Self::MUTE
        } else {
            Self(value.clamp(0.0, 1.0))
        }
    }

    pub fn get(&self) -> f32 {
        self.0
    }
}

/// A speaker output known to the audio graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputDevice {
    pub id: DeviceId,
    pub display_name: String,
    pub channels: ChannelCount,
    pub sample_rate: SampleRate,
    pub current_volume: Volume,
}

impl OutputDevice {
    pub fn new(id: DeviceId, display_name: impl Into<String>, channels: ChannelCount) -> Self {
        Self {
            id,
            display_name: display_name.into(),
            channels,
            sample_rate: SampleRate::Hz48000,
            current_volume: Volume::FULL,
        }
    }

    pub fn channel_count(&self) -> u16 {
        self.channels.count()
    }

    pub fn is_mono(&self) -> bool {
        self.channel_count() == 1
    }
}

/// Capability interface of the audio graph engine
///
/// Implementations must be safe to call from several monitor tasks at once;
/// the routing engine serializes its own mutations.
#[async_trait]
pub trait AudioBackend: Send + Sync {
    /// List every output (sink) currently present in the graph
    async fn list_outputs(&self) -> BackendResult<Vec<OutputDevice>>;

    /// Create a link between a source channel and a target channel
    async fn link(&self, link: &ChannelLink) -> BackendResult<()>;

    /// Remove a link; removing an absent link is not an error
    async fn unlink(&self, link: &ChannelLink) -> BackendResult<()>;

    /// Every source-to-output link currently active in the graph
    async fn list_active_links(&self) -> BackendResult<HashSet<ChannelLink>>;

    async fn set_volume(&self, device: &DeviceId, volume: Volume) -> BackendResult<()>;

    /// `Ok(None)` when the graph has no volume information for the device
    async fn get_volume(&self, device: &DeviceId) -> BackendResult<Option<f32>>;

    /// The output the graph routes to when nothing else is requested
    async fn default_output(&self) -> BackendResult<Option<DeviceId>> {
        Ok(None)
    }
}
