//! Latest prices and recent trades derived from the node log

use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, VecDeque};

use crate::protocol::{self, Channel, SubscriptionSpec, WsTrade};

#[derive(Default)]
struct CacheState {
    prices: BTreeMap<String, String>,
    trades: HashMap<String, VecDeque<WsTrade>>,
}

/// Price cache plus a bounded trade ring per symbol
pub struct MarketCache {
    state: RwLock<CacheState>,
    ring_capacity: usize,
    snapshot_trades: usize,
}

impl MarketCache {
    pub fn new(ring_capacity: usize, snapshot_trades: usize) -> Self {
        Self {
            state: RwLock::new(CacheState::default()),
            ring_capacity: ring_capacity.max(1),
            snapshot_trades,
        }
    }

    /// Update the symbol's price and push the trade, evicting the oldest
    pub fn record_trade(&self, trade: WsTrade) {
        let mut state = self.state.write();
        state.prices.insert(trade.coin.clone(), trade.px.clone());

        let ring = state
            .trades
            .entry(trade.coin.clone())
            .or_insert_with(|| VecDeque::with_capacity(self.ring_capacity));
        if ring.len() == self.ring_capacity {
            ring.pop_front();
        }
        ring.push_back(trade);
    }

    pub fn price(&self, coin: &str) -> Option<String> {
        self.state.read().prices.get(coin).cloned()
    }

    pub fn prices(&self) -> BTreeMap<String, String> {
        self.state.read().prices.clone()
    }

    /// Up to `limit` most recent trades for `coin`, oldest first
    pub fn recent_trades(&self, coin: &str, limit: usize) -> Vec<WsTrade> {
        let state = self.state.read();
        state
            .trades
            .get(coin)
            .map(|ring| {
                let skip = ring.len().saturating_sub(limit);
                ring.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default()
    }

    pub fn symbol_count(&self) -> usize {
        self.state.read().prices.len()
    }

    /// First frame a new local subscriber receives: the full price map for
    /// `allMids`, the last few trades for a coin's `trades` feed.
    pub fn initial_snapshot(&self, spec: &SubscriptionSpec) -> Option<Bytes> {
        match spec.channel {
            Channel::AllMids => Some(protocol::all_mids_frame(&self.prices())),
            Channel::Trades => {
                let coin = spec.coin.as_deref().filter(|c| !c.is_empty())?;
                let trades = self.recent_trades(coin, self.snapshot_trades);
                if trades.is_empty() {
                    None
                } else {
                    Some(protocol::trades_frame(&trades))
                }
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::TradeSide;
    use serde_json::Value;

    fn trade(coin: &str, px: &str, tid: u64) -> WsTrade {
        WsTrade {
            coin: coin.to_string(),
            side: TradeSide::Sell,
            px: px.to_string(),
            sz: "1".to_string(),
            hash: String::new(),
            time: 0,
            tid,
            users: [String::new(), String::new()],
        }
    }

    #[test]
    fn test_ring_evicts_oldest() {
        let cache = MarketCache::new(3, 2);
        for tid in 0..5 {
            cache.record_trade(trade("BTC", &format!("{}", 100 + tid), tid));
        }

        let tids: Vec<u64> = cache.recent_trades("BTC", 10).iter().map(|t| t.tid).collect();
        assert_eq!(tids, vec![2, 3, 4]);
        assert_eq!(cache.price("BTC").as_deref(), Some("104"));
    }

    #[test]
    fn test_trade_snapshot_is_last_k() {
        let cache = MarketCache::new(10, 2);
        for tid in 0..4 {
            cache.record_trade(trade("ETH", "10", tid));
        }

        let spec = SubscriptionSpec::new(Channel::Trades).with_coin("ETH");
        let frame: Value = serde_json::from_slice(&cache.initial_snapshot(&spec).unwrap()).unwrap();
        let tids: Vec<u64> = frame["data"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["tid"].as_u64().unwrap())
            .collect();
        assert_eq!(tids, vec![2, 3]);

        let unknown = SubscriptionSpec::new(Channel::Trades).with_coin("DOGE");
        assert!(cache.initial_snapshot(&unknown).is_none());
    }

    #[test]
    fn test_mids_snapshot_always_present() {
        let cache = MarketCache::new(10, 2);
        let spec = SubscriptionSpec::new(Channel::AllMids);
        let frame: Value = serde_json::from_slice(&cache.initial_snapshot(&spec).unwrap()).unwrap();
        assert_eq!(frame["channel"], "allMids");
        assert!(frame["data"]["mids"].as_object().unwrap().is_empty());
    }
}
