//! Local ingestion source
//!
//! Tails the node's action log and turns order actions into the same
//! `trades` and `allMids` pushes the upstream feed produces.

pub mod block;
pub mod cache;
pub mod discovery;
pub mod engine;
pub mod tail;

pub use block::{AssetLookup, BlockDecoder};
pub use cache::MarketCache;
pub use engine::{IngestEngine, IngestSettings, ScanReport};
pub use tail::LogTailer;
