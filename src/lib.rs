// Client library for the MCP orchestration platform

pub mod api;
pub mod config;
pub mod logging;
pub mod orchestration;
pub mod stream;
#[cfg(feature = "testing")]
pub mod testing;

// Re-export common types and structures
pub use api::{ApiClient, ApiError, DeployMethod, ServerFilter, ServerInfo, ServerStatus};
pub use config::{ConfigError, DashConfig};
pub use orchestration::{OrchestrationEvent, TaskPhase, TaskProgress, TaskTracker};
pub use stream::{
    ConnectionState, EventStream, ReadyState, ReconnectPolicy, StateSnapshot, StreamClient,
    StreamError, StreamEvent, StreamMessage, StreamOptions, StreamTarget,
};
