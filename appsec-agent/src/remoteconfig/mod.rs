//! Remote configuration distribution: polling transport, TUF-style
//! verification, per-product callback dispatch and apply-state tracking.

pub mod client;
pub mod poller;
pub mod protocol;
pub mod publishers;
pub mod transport;

pub use client::RemoteConfigClient;
pub use poller::RemoteConfigPoller;
pub use protocol::{ApplyState, ConfigMetadata, TargetFile};
pub use publishers::ProductListener;
pub use transport::{AgentInfo, AgentTransport, ConfigTransport};

/// Agent endpoint serving configuration payloads.
pub const REMOTE_CONFIG_AGENT_ENDPOINT: &str = "v0.7/config";

/// Well-known product names.
pub mod products {
    pub const ASM: &str = "ASM";
    pub const ASM_DATA: &str = "ASM_DATA";
    pub const ASM_DD: &str = "ASM_DD";
    pub const ASM_FEATURES: &str = "ASM_FEATURES";
}
