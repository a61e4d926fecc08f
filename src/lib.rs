//! Hyperliquid WebSocket gateway
//!
//! Fans market and user events out to many downstream WebSocket sessions from
//! one of two sources: a relayed upstream feed, or events reconstructed from a
//! local node's action log.

pub mod assets;
pub mod config;
pub mod error;
pub mod gateway;
pub mod hub;
pub mod ingest;
pub mod protocol;
pub mod server;
pub mod session;
pub mod stats;
pub mod upstream;

pub use assets::{AssetRecord, AssetResolver};
pub use config::{Config, Network, SourceMode};
pub use error::{GatewayError, Result};
pub use gateway::Gateway;
pub use hub::{EventSource, Hub, SessionHandle, SessionId};
pub use ingest::{IngestEngine, MarketCache};
pub use protocol::{ChannelEvent, SubscriptionKey, SubscriptionSpec};
pub use stats::GatewayStats;
pub use upstream::{UpstreamConnector, UpstreamEvent, UpstreamSettings};
