//! story-sync library: the tokio side of the sync engine.
//!
//! Push channel, REST backend and the per-project session that ties them to
//! the runtime-agnostic core in `story_core`. The binary is a thin CLI over
//! [`ProjectSession`].

pub mod channel;
pub mod config;
pub mod reconnect;
pub mod rest;
pub mod session;

// Re-export key types for convenience
pub use channel::{ChannelError, ChannelEvent, ChannelInput, ChannelState, RealtimeSyncChannel, SubscriptionId};
pub use config::{ConfigError, SyncConfig};
pub use reconnect::{ReconnectConfig, ReconnectState, calculate_backoff};
pub use rest::HttpBackend;
pub use session::{ProjectSession, SessionConfig, SessionError};
