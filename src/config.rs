//! Configuration module for the gateway

use serde::Deserialize;
use std::time::Duration;

use crate::error::{GatewayError, Result};

/// Prefix of the environment variables read by [`Config::load`]
const ENV_PREFIX: &str = "GATEWAY";

/// Which event source feeds the hub
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceMode {
    /// Relay from the remote live feed
    Upstream,
    /// Reconstruct events from the local node's action log
    Local,
}

/// Upstream network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Mainnet,
    Testnet,
}

/// Application configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address the WebSocket/HTTP server binds to
    pub listen_addr: String,

    /// Active event source
    pub source: SourceMode,

    /// Upstream endpoints
    pub network: Network,
    pub mainnet_url: String,
    pub testnet_url: String,

    /// Metadata (`meta` / `spotMeta`) endpoint
    pub info_url: String,

    /// Reconnection settings
    pub reconnect_interval_ms: u64,
    pub max_reconnect_attempts: u32,

    /// Application heartbeat towards the upstream feed
    pub heartbeat_interval_secs: u64,

    /// Upper bound for an upstream post request
    pub request_timeout_secs: u64,

    /// Root of the node's action log (`{root}/{session}/{date}/{height}`)
    pub node_data_path: String,
    pub scan_interval_ms: u64,
    pub max_chunk_bytes: u64,
    pub trade_ring_capacity: usize,
    pub snapshot_trades: usize,
    pub start_at_tail: bool,

    /// Asset metadata refresh period
    pub asset_refresh_secs: u64,

    /// Spot token index whose pairs are rendered as `BASE/QUOTE`
    pub spot_quote_base_token: u32,

    /// Downstream session limits
    pub max_clients: usize,
    pub session_queue_capacity: usize,
    pub max_inbound_frame_bytes: usize,
    pub ping_interval_secs: u64,
    pub pong_timeout_secs: u64,
}

impl Config {
    /// Load configuration from `.env` and `GATEWAY_*` environment variables
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config: Config = config::Config::builder()
            .add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the gateway cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.max_clients == 0 {
            return Err(GatewayError::ConfigError("max_clients must be positive".into()));
        }
        if self.session_queue_capacity == 0 {
            return Err(GatewayError::ConfigError(
                "session_queue_capacity must be positive".into(),
            ));
        }
        if self.source == SourceMode::Local && self.node_data_path.trim().is_empty() {
            return Err(GatewayError::ConfigError(
                "node_data_path is required in local mode".into(),
            ));
        }
        if self.ping_interval_secs >= self.pong_timeout_secs {
            return Err(GatewayError::ConfigError(format!(
                "ping interval ({}s) must be shorter than pong timeout ({}s)",
                self.ping_interval_secs, self.pong_timeout_secs
            )));
        }
        // each of these drives a tokio interval, which rejects a zero period
        let periods = [
            ("heartbeat_interval_secs", self.heartbeat_interval_secs),
            ("ping_interval_secs", self.ping_interval_secs),
            ("scan_interval_ms", self.scan_interval_ms),
            ("asset_refresh_secs", self.asset_refresh_secs),
        ];
        if let Some((name, _)) = periods.iter().find(|(_, value)| *value == 0) {
            return Err(GatewayError::ConfigError(format!("{} must be positive", name)));
        }
        Ok(())
    }

    /// WebSocket URL of the selected upstream network
    pub fn upstream_url(&self) -> &str {
        match self.network {
            Network::Mainnet => &self.mainnet_url,
            Network::Testnet => &self.testnet_url,
        }
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    pub fn asset_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.asset_refresh_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            source: SourceMode::Upstream,
            network: Network::Mainnet,
            mainnet_url: "wss://api.hyperliquid.xyz/ws".to_string(),
            testnet_url: "wss://api.hyperliquid-testnet.xyz/ws".to_string(),
            info_url: "https://api.hyperliquid.xyz/info".to_string(),
            reconnect_interval_ms: 5_000,
            max_reconnect_attempts: 5,
            heartbeat_interval_secs: 50,
            request_timeout_secs: 30,
            node_data_path: "/home/hluser/hl/data/replica_cmds".to_string(),
            scan_interval_ms: 1_000,
            max_chunk_bytes: 100 * 1024 * 1024,
            trade_ring_capacity: 100,
            snapshot_trades: 5,
            start_at_tail: false,
            asset_refresh_secs: 300,
            spot_quote_base_token: 1,
            max_clients: 1_000,
            session_queue_capacity: 256,
            max_inbound_frame_bytes: 4_096,
            ping_interval_secs: 54,
            pong_timeout_secs: 60,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.upstream_url(), "wss://api.hyperliquid.xyz/ws");
    }

    #[test]
    fn test_testnet_selects_testnet_url() {
        let config = Config {
            network: Network::Testnet,
            ..Config::default()
        };
        assert_eq!(config.upstream_url(), "wss://api.hyperliquid-testnet.xyz/ws");
    }

    #[test]
    fn test_validate_rejects_ping_after_deadline() {
        let config = Config {
            ping_interval_secs: 60,
            pong_timeout_secs: 60,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(GatewayError::ConfigError(_))));
    }

    #[test]
    fn test_validate_requires_node_path_in_local_mode() {
        let config = Config {
            source: SourceMode::Local,
            node_data_path: "  ".to_string(),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_periods() {
        let cases = [
            ("heartbeat_interval_secs", Config { heartbeat_interval_secs: 0, ..Config::default() }),
            ("ping_interval_secs", Config { ping_interval_secs: 0, ..Config::default() }),
            ("scan_interval_ms", Config { scan_interval_ms: 0, ..Config::default() }),
            ("asset_refresh_secs", Config { asset_refresh_secs: 0, ..Config::default() }),
        ];
        for (field, config) in cases {
            match config.validate() {
                Err(GatewayError::ConfigError(message)) => assert!(message.contains(field), "{}", message),
                other => panic!("{} = 0 was accepted: {:?}", field, other),
            }
        }
    }
}
