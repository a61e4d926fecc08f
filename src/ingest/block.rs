//! Block record decoding
//!
//! One log line is one block. Bundles and actions are decoded one at a time
//! so a single bad element never costs the rest of the block.

use chrono::{DateTime, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

use crate::error::Result;
use crate::protocol::{TradeSide, WsTrade};

/// Resolves numeric asset ids to display symbols
#[cfg_attr(test, mockall::automock)]
pub trait AssetLookup: Send + Sync {
    /// Symbol for `asset_id`; unknown ids yield a placeholder, never an error
    fn symbol(&self, asset_id: u32) -> String;
}

#[derive(Debug, Deserialize)]
pub struct BlockRecord {
    pub abci_block: AbciBlock,
}

#[derive(Debug, Deserialize)]
pub struct AbciBlock {
    #[serde(default)]
    pub time: Option<String>,
    #[serde(default)]
    pub round: u64,
    /// Each element should be `[hash, body]`; kept raw and checked per bundle
    #[serde(default)]
    pub signed_action_bundles: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct BundleBody {
    #[serde(default)]
    signed_actions: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct SignedAction {
    action: Action,
}

/// Node actions keyed by their `type` field
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum Action {
    #[serde(rename = "order")]
    Order {
        #[serde(default)]
        orders: Vec<OrderWire>,
    },
    #[serde(rename = "cancel")]
    Cancel,
    #[serde(rename = "cancelByCloid")]
    CancelByCloid,
    #[serde(rename = "noop")]
    Noop,
    #[serde(rename = "scheduleCancel")]
    ScheduleCancel,
    #[serde(other)]
    Ignored,
}

/// Order as written by the node
#[derive(Debug, Clone, Deserialize)]
pub struct OrderWire {
    #[serde(alias = "asset")]
    pub a: u32,
    pub b: bool,
    pub p: String,
    pub s: String,
}

/// Turns block lines into synthetic trades
pub struct BlockDecoder {
    assets: Arc<dyn AssetLookup>,
    next_tid: AtomicU64,
}

impl BlockDecoder {
    pub fn new(assets: Arc<dyn AssetLookup>) -> Self {
        let seed = Utc::now().timestamp_nanos_opt().unwrap_or_default().max(0) as u64;
        Self {
            assets,
            next_tid: AtomicU64::new(seed),
        }
    }

    /// Decode one line. Only a line that is not a block at all is an error;
    /// malformed bundles, actions and orders inside it are skipped.
    pub fn decode_line(&self, line: &str) -> Result<Vec<WsTrade>> {
        let record: BlockRecord = serde_json::from_str(line)?;
        let block = record.abci_block;
        let time = block_time_millis(block.time.as_deref());

        let mut trades = Vec::new();
        for bundle in &block.signed_action_bundles {
            self.decode_bundle(bundle, time, &mut trades);
        }
        trace!(round = block.round, trades = trades.len(), "Decoded block");
        Ok(trades)
    }

    fn decode_bundle(&self, bundle: &Value, time: i64, out: &mut Vec<WsTrade>) {
        let (hash, body) = match bundle.as_array().map(Vec::as_slice) {
            Some([hash, body, ..]) => (hash.as_str().unwrap_or_default(), body),
            _ => {
                debug!("Skipping bundle that is not a [hash, body] pair");
                return;
            }
        };

        let body = match BundleBody::deserialize(body) {
            Ok(body) => body,
            Err(e) => {
                debug!(error = %e, "Skipping undecodable bundle body");
                return;
            }
        };

        for raw in &body.signed_actions {
            match SignedAction::deserialize(raw) {
                Ok(SignedAction {
                    action: Action::Order { orders },
                }) => {
                    for order in &orders {
                        if let Some(trade) = self.order_to_trade(order, hash, time) {
                            out.push(trade);
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => debug!(error = %e, "Skipping undecodable action"),
            }
        }
    }

    fn order_to_trade(&self, order: &OrderWire, hash: &str, time: i64) -> Option<WsTrade> {
        if Decimal::from_str(&order.p).is_err() || Decimal::from_str(&order.s).is_err() {
            debug!(asset = order.a, px = %order.p, sz = %order.s, "Skipping order with non-decimal price or size");
            return None;
        }

        let tid = self.next_tid.fetch_add(1, Ordering::Relaxed);
        Some(WsTrade {
            coin: self.assets.symbol(order.a),
            side: if order.b { TradeSide::Buy } else { TradeSide::Sell },
            px: order.p.clone(),
            sz: order.s.clone(),
            hash: if hash.is_empty() {
                format!("{:x}", tid)
            } else {
                hash.to_string()
            },
            time,
            tid,
            users: [String::new(), String::new()],
        })
    }
}

/// Block time in epoch millis. Times without an offset are read as UTC;
/// anything unreadable becomes the current time.
pub fn block_time_millis(raw: Option<&str>) -> i64 {
    let Some(raw) = raw else {
        return Utc::now().timestamp_millis();
    };
    if let Ok(t) = DateTime::parse_from_rfc3339(raw) {
        return t.timestamp_millis();
    }
    if let Ok(t) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
        return t.and_utc().timestamp_millis();
    }
    Utc::now().timestamp_millis()
}
