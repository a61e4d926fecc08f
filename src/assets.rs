//! Asset id to symbol resolution
//!
//! Perp ids are positions in the `meta` universe. Spot ids are the pair index
//! offset by [`SPOT_ID_OFFSET`]. Tables are rebuilt from scratch on every
//! successful refresh and swapped in whole; a failed refresh keeps the old set.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{GatewayError, Result};
use crate::ingest::AssetLookup;

/// First spot asset id
pub const SPOT_ID_OFFSET: u32 = 10_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssetRecord {
    pub id: u32,
    pub symbol: String,
    pub is_spot: bool,
    pub size_decimals: u32,
    pub max_leverage: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct MetaResponse {
    pub universe: Vec<PerpMeta>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerpMeta {
    pub name: String,
    #[serde(default)]
    pub sz_decimals: u32,
    #[serde(default)]
    pub max_leverage: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct SpotMetaResponse {
    pub tokens: Vec<SpotToken>,
    pub universe: Vec<SpotPair>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpotToken {
    pub name: String,
    pub index: u32,
    #[serde(default)]
    pub sz_decimals: u32,
}

#[derive(Debug, Deserialize)]
pub struct SpotPair {
    pub name: String,
    #[serde(default)]
    pub tokens: Vec<u32>,
    pub index: u32,
}

#[derive(Debug, Default)]
pub struct AssetTables {
    perps: HashMap<u32, Arc<AssetRecord>>,
    spots: HashMap<u32, Arc<AssetRecord>>,
    by_symbol: HashMap<String, Arc<AssetRecord>>,
    updated_at: Option<DateTime<Utc>>,
}

impl AssetTables {
    /// Build all three tables from the two metadata responses
    pub fn build(meta: &MetaResponse, spot: &SpotMetaResponse, special_base: u32) -> Self {
        let mut tables = AssetTables {
            updated_at: Some(Utc::now()),
            ..Default::default()
        };

        for (index, perp) in meta.universe.iter().enumerate() {
            let record = Arc::new(AssetRecord {
                id: index as u32,
                symbol: perp.name.clone(),
                is_spot: false,
                size_decimals: perp.sz_decimals,
                max_leverage: perp.max_leverage,
            });
            tables.by_symbol.insert(record.symbol.clone(), Arc::clone(&record));
            tables.perps.insert(record.id, record);
        }

        let tokens: HashMap<u32, &SpotToken> = spot.tokens.iter().map(|t| (t.index, t)).collect();
        for pair in &spot.universe {
            let base = pair.tokens.first().and_then(|i| tokens.get(i));
            let record = Arc::new(AssetRecord {
                id: SPOT_ID_OFFSET + pair.index,
                symbol: spot_symbol(pair, &tokens, special_base),
                is_spot: true,
                size_decimals: base.map(|t| t.sz_decimals).unwrap_or_default(),
                max_leverage: None,
            });
            tables.by_symbol.insert(record.symbol.clone(), Arc::clone(&record));
            tables.spots.insert(record.id, record);
        }

        tables
    }

    fn by_id(&self, id: u32) -> Option<&Arc<AssetRecord>> {
        self.perps.get(&id).or_else(|| self.spots.get(&id))
    }
}

/// Display name of a spot pair. Pairs based on `special_base` read as
/// `BASE/QUOTE`; pairs based on the quote token keep their listed name;
/// everything else is `@index`.
fn spot_symbol(pair: &SpotPair, tokens: &HashMap<u32, &SpotToken>, special_base: u32) -> String {
    let (Some(&base), Some(&quote)) = (pair.tokens.first(), pair.tokens.get(1)) else {
        return pair.name.clone();
    };

    if base == special_base {
        if let (Some(b), Some(q)) = (tokens.get(&base), tokens.get(&quote)) {
            return format!("{}/{}", b.name, q.name);
        }
        return pair.name.clone();
    }
    if base == 0 {
        return pair.name.clone();
    }
    format!("@{}", pair.index)
}

/// Symbol shown for an id missing from both tables
pub fn placeholder_symbol(id: u32) -> String {
    if id >= SPOT_ID_OFFSET {
        format!("@{}", id - SPOT_ID_OFFSET)
    } else {
        format!("ASSET_{}", id)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AssetStats {
    pub perp_assets: usize,
    pub spot_assets: usize,
    pub total_assets: usize,
    pub last_updated: Option<DateTime<Utc>>,
}

pub struct AssetResolver {
    client: reqwest::Client,
    info_url: String,
    refresh_interval: Duration,
    special_base: u32,
    tables: RwLock<Arc<AssetTables>>,
}

impl AssetResolver {
    pub fn new(info_url: impl Into<String>, refresh_interval: Duration, special_base: u32) -> Self {
        Self {
            client: reqwest::Client::new(),
            info_url: info_url.into(),
            refresh_interval,
            special_base,
            tables: RwLock::new(Arc::new(AssetTables::default())),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.info_url.clone(),
            config.asset_refresh_interval(),
            config.spot_quote_base_token,
        )
    }

    /// Fetch both universes and swap in fresh tables
    pub async fn refresh(&self) -> Result<()> {
        let meta: MetaResponse = self.query("meta").await?;
        let spot: SpotMetaResponse = self.query("spotMeta").await?;

        let tables = AssetTables::build(&meta, &spot, self.special_base);
        info!(
            perp_assets = tables.perps.len(),
            spot_assets = tables.spots.len(),
            total_assets = tables.by_symbol.len(),
            "Asset metadata refreshed"
        );
        self.install(tables);
        Ok(())
    }

    /// Replace the live tables
    pub fn install(&self, tables: AssetTables) {
        *self.tables.write() = Arc::new(tables);
    }

    async fn query<T: for<'de> Deserialize<'de>>(&self, kind: &str) -> Result<T> {
        debug!(url = %self.info_url, kind, "Querying asset metadata");
        let response = self
            .client
            .post(&self.info_url)
            .json(&serde_json::json!({ "type": kind }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(GatewayError::RestApiError(format!(
                "{} query returned status {}",
                kind, status
            )));
        }
        Ok(response.json::<T>().await?)
    }

    fn snapshot(&self) -> Arc<AssetTables> {
        Arc::clone(&self.tables.read())
    }

    pub fn by_id(&self, id: u32) -> Option<AssetRecord> {
        self.snapshot().by_id(id).map(|r| (**r).clone())
    }

    pub fn by_symbol(&self, symbol: &str) -> Option<AssetRecord> {
        self.snapshot().by_symbol.get(symbol).map(|r| (**r).clone())
    }

    /// Resolved symbol, or the placeholder for unknown ids
    pub fn symbol_for(&self, id: u32) -> String {
        self.snapshot()
            .by_id(id)
            .map(|r| r.symbol.clone())
            .unwrap_or_else(|| placeholder_symbol(id))
    }

    pub fn stats(&self) -> AssetStats {
        let tables = self.snapshot();
        AssetStats {
            perp_assets: tables.perps.len(),
            spot_assets: tables.spots.len(),
            total_assets: tables.by_symbol.len(),
            last_updated: tables.updated_at,
        }
    }

    /// Refresh on every tick until `shutdown` flips. The startup refresh is
    /// the caller's; the first tick here fires one interval later.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval_at(Instant::now() + self.refresh_interval, self.refresh_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.refresh().await {
                        warn!(error = %e, "Asset refresh failed, keeping previous tables");
                    }
                }
                _ = shutdown.changed() => return,
            }
        }
    }
}

impl AssetLookup for AssetResolver {
    fn symbol(&self, asset_id: u32) -> String {
        self.symbol_for(asset_id)
    }
}
