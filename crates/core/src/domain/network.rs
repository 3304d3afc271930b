//! Network condition probing for distributed nodes

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::domain::audio::BackendResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkStats {
    pub latency: Duration,
    pub jitter: Duration,
}

/// Source of latency/jitter figures and owner of the playback buffer size
#[async_trait]
pub trait NetworkProbe: Send + Sync {
    /// `Ok(None)` when no statistics are available yet
    async fn stats(&self) -> BackendResult<Option<NetworkStats>>;

    /// Resize the playback buffer for the observed conditions
    async fn adjust_buffer(&self, stats: NetworkStats) -> BackendResult<()>;
}

/// Reports nothing and ignores adjustment requests
#[derive(Debug, Clone, Copy, Default)]
pub struct NullNetworkProbe;

#[async_trait]
impl NetworkProbe for NullNetworkProbe {
    async fn stats(&self) -> BackendResult<Option<NetworkStats>> {
        Ok(None)
    }

    async fn adjust_buffer(&self, _stats: NetworkStats) -> BackendResult<()> {
        Ok(())
    }
}
