//! Scan loop of the local ingestion source

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::block::BlockDecoder;
use super::cache::MarketCache;
use super::discovery;
use super::tail::LogTailer;
use crate::config::Config;
use crate::error::Result;
use crate::hub::Hub;
use crate::protocol::{self, Channel, ChannelEvent, WsTrade};
use crate::stats::GatewayStats;

#[derive(Debug, Clone)]
pub struct IngestSettings {
    pub root: PathBuf,
    pub scan_interval: Duration,
    pub max_chunk_bytes: u64,
    pub start_at_tail: bool,
}

impl IngestSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            root: PathBuf::from(&config.node_data_path),
            scan_interval: config.scan_interval(),
            max_chunk_bytes: config.max_chunk_bytes,
            start_at_tail: config.start_at_tail,
        }
    }
}

/// Outcome of one scan tick
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanReport {
    pub files: usize,
    pub lines: usize,
    pub skipped: usize,
    pub trades: usize,
}

pub struct IngestEngine {
    settings: IngestSettings,
    tailer: LogTailer,
    decoder: BlockDecoder,
    cache: Arc<MarketCache>,
    hub: Arc<Hub>,
    stats: Arc<GatewayStats>,
}

impl IngestEngine {
    pub fn new(
        settings: IngestSettings,
        decoder: BlockDecoder,
        cache: Arc<MarketCache>,
        hub: Arc<Hub>,
        stats: Arc<GatewayStats>,
    ) -> Self {
        let tailer = LogTailer::new(settings.max_chunk_bytes, settings.start_at_tail);
        Self {
            settings,
            tailer,
            decoder,
            cache,
            hub,
            stats,
        }
    }

    /// Scan every tick until `shutdown` flips
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(root = %self.settings.root.display(), "Starting local ingestion");
        let mut ticker = interval(self.settings.scan_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.scan_once().await {
                        Ok(report) if report.trades > 0 || report.skipped > 0 => {
                            debug!(
                                files = report.files,
                                lines = report.lines,
                                skipped = report.skipped,
                                trades = report.trades,
                                "Scan complete"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "Scan failed"),
                    }
                }
                _ = shutdown.changed() => {
                    info!("Local ingestion stopped");
                    return;
                }
            }
        }
    }

    /// Read everything appended to the newest leaf directory since the last
    /// scan and publish what it yields
    pub async fn scan_once(&mut self) -> Result<ScanReport> {
        let mut report = ScanReport::default();
        let Some(leaf) = discovery::latest_leaf(&self.settings.root).await? else {
            return Ok(report);
        };
        let files = discovery::list_files(&leaf).await?;
        self.tailer.retain(&files);
        report.files = files.len();

        let mut by_coin: BTreeMap<String, Vec<WsTrade>> = BTreeMap::new();
        for file in &files {
            let lines = match self.tailer.read_new_lines(file).await {
                Ok(lines) => lines,
                Err(e) => {
                    warn!(file = %file.display(), error = %e, "Failed to read log file");
                    continue;
                }
            };

            for line in &lines {
                report.lines += 1;
                match self.decoder.decode_line(line) {
                    Ok(trades) => {
                        for trade in trades {
                            self.cache.record_trade(trade.clone());
                            by_coin.entry(trade.coin.clone()).or_default().push(trade);
                            report.trades += 1;
                        }
                    }
                    Err(e) => {
                        report.skipped += 1;
                        debug!(file = %file.display(), error = %e, "Skipping undecodable line");
                    }
                }
            }
        }

        self.stats.trades_derived.inc_by(report.trades as u64);
        self.stats.lines_skipped.inc_by(report.skipped as u64);

        if report.trades > 0 {
            for (coin, trades) in &by_coin {
                let event = ChannelEvent::new(Channel::Trades.as_str(), protocol::trades_frame(trades))
                    .with_coin(coin.clone());
                self.hub.publish(&event);
            }
            let mids = protocol::all_mids_frame(&self.cache.prices());
            self.hub.publish(&ChannelEvent::new(Channel::AllMids.as_str(), mids));
        }

        Ok(report)
    }
}
