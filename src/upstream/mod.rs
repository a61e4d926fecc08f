//! Upstream feed connection

mod client;
mod connector;
mod pending;

pub use client::{dial, WsStream};
pub use connector::{ConnectionState, UpstreamConnector, UpstreamEvent, UpstreamSettings};
pub use pending::{PendingRequests, PendingSlot};
