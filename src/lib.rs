//! Live election results for the student voting client.
//!
//! Watches one election at a time: seeds results from an HTTP snapshot,
//! keeps them current over a reconnecting WebSocket subscription, and falls
//! back to polling while the live channel is down. See [`LiveTally`].

pub mod channel;
pub mod config;
pub mod error;
pub mod models;
pub mod snapshot;
pub mod store;
pub mod subscription;
pub mod tasks;
pub mod voting;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{ChannelError, ConfigError, FetchError};
pub use models::{ConnectionStatus, Credentials, LiveView, ResultEntry, ResultSet, WatchTarget};
pub use subscription::{LiveTally, Lifecycle, TallySettings};
