//! Gateway counters
//!
//! Written by the hub, the upstream pump and the ingestion engine; read only
//! by the HTTP stats/metrics endpoints.

use chrono::{DateTime, Utc};
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use serde::Serialize;

use crate::error::{GatewayError, Result};

/// Counters exported to the stats sink
pub struct GatewayStats {
    registry: Registry,
    pub sessions: IntGauge,
    pub subscriptions: IntGauge,
    pub source_live: IntGauge,
    pub messages_processed: IntCounter,
    pub messages_forwarded: IntCounter,
    pub post_requests: IntCounter,
    pub sessions_evicted: IntCounter,
    pub trades_derived: IntCounter,
    pub lines_skipped: IntCounter,
    started_at: DateTime<Utc>,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub connected_clients: i64,
    pub active_subscriptions: i64,
    pub source_live: bool,
    pub messages_processed: u64,
    pub messages_forwarded: u64,
    pub post_requests_handled: u64,
    pub sessions_evicted: u64,
    pub trades_derived: u64,
    pub lines_skipped: u64,
    pub start_time: i64,
    pub uptime_seconds: i64,
}

impl GatewayStats {
    pub fn new() -> Result<Self> {
        let registry = Registry::new_custom(Some("gateway".to_string()), None)?;

        let sessions = IntGauge::new("sessions", "Connected downstream sessions")?;
        let subscriptions = IntGauge::new("subscriptions", "Live registry entries")?;
        let source_live = IntGauge::new("source_live", "1 while the event source is live")?;
        let messages_processed =
            IntCounter::new("messages_processed_total", "Events offered to the hub")?;
        let messages_forwarded =
            IntCounter::new("messages_forwarded_total", "Frames queued to sessions")?;
        let post_requests = IntCounter::new("post_requests_total", "Post requests handled")?;
        let sessions_evicted =
            IntCounter::new("sessions_evicted_total", "Sessions dropped for backpressure")?;
        let trades_derived =
            IntCounter::new("trades_derived_total", "Synthetic trades derived from the node log")?;
        let lines_skipped =
            IntCounter::new("lines_skipped_total", "Node log lines that failed to decode")?;

        registry.register(Box::new(sessions.clone()))?;
        registry.register(Box::new(subscriptions.clone()))?;
        registry.register(Box::new(source_live.clone()))?;
        registry.register(Box::new(messages_processed.clone()))?;
        registry.register(Box::new(messages_forwarded.clone()))?;
        registry.register(Box::new(post_requests.clone()))?;
        registry.register(Box::new(sessions_evicted.clone()))?;
        registry.register(Box::new(trades_derived.clone()))?;
        registry.register(Box::new(lines_skipped.clone()))?;

        Ok(Self {
            registry,
            sessions,
            subscriptions,
            source_live,
            messages_processed,
            messages_forwarded,
            post_requests,
            sessions_evicted,
            trades_derived,
            lines_skipped,
            started_at: Utc::now(),
        })
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let now = Utc::now();
        StatsSnapshot {
            connected_clients: self.sessions.get(),
            active_subscriptions: self.subscriptions.get(),
            source_live: self.source_live.get() > 0,
            messages_processed: self.messages_processed.get(),
            messages_forwarded: self.messages_forwarded.get(),
            post_requests_handled: self.post_requests.get(),
            sessions_evicted: self.sessions_evicted.get(),
            trades_derived: self.trades_derived.get(),
            lines_skipped: self.lines_skipped.get(),
            start_time: self.started_at.timestamp(),
            uptime_seconds: (now - self.started_at).num_seconds(),
        }
    }

    /// Prometheus text exposition of every counter
    pub fn encode(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| GatewayError::Metrics(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let stats = GatewayStats::new().unwrap();
        stats.sessions.inc();
        stats.messages_forwarded.inc_by(3);

        let snap = stats.snapshot();
        assert_eq!(snap.connected_clients, 1);
        assert_eq!(snap.messages_forwarded, 3);
        assert!(!snap.source_live);
    }

    #[test]
    fn test_encode_uses_namespace() {
        let stats = GatewayStats::new().unwrap();
        let text = stats.encode().unwrap();
        assert!(text.contains("gateway_sessions"));
        assert!(text.contains("gateway_post_requests_total"));
    }
}
