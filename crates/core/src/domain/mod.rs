//! Domain entities and business rules

pub mod audio;
pub mod bluetooth;
pub mod clock;
pub mod config;
pub mod directory;
pub mod handoff;
pub mod network;
pub mod node;
pub mod routing;

// Re-export specific items to avoid ambiguous glob imports
pub use audio::{
    AudioBackend, BackendError, BackendResult, Channel, ChannelCount, ChannelLink, DeviceId,
    OutputDevice, SampleRate, Volume,
};
pub use bluetooth::{
    BluetoothDevice, BluetoothStack, ConnectionState, DeviceInfo, MacAddress, SignalQuality,
};
pub use clock::{
    ClockMessage, ClockOffset, ClockSyncEngine, ClockTransport, Node, NodeId, Role, SyncError,
    SyncState, SystemTimeSource, TimeSource, Timestamp, TransportError,
};
pub use config::{ConfigError, ConfigManager, Mode, NodeConfig, RetryPolicy};
pub use directory::{DeviceDirectory, DirectoryError};
pub use handoff::{
    HandoffAdvisor, HandoffError, HandoffOutcome, HandoffPhases, HandoffStage, NoHandoff,
    NodeAddress, SingleNodeHandoff,
};
pub use network::{NetworkProbe, NetworkStats, NullNetworkProbe};
pub use node::{
    Collaborators, DeviceAction, NodeError, NodeOrchestrator, NodePhase, NodeState, Subsystem,
};
pub use routing::{Route, RouteHealth, RouteId, RoutingEngine, RoutingError};
