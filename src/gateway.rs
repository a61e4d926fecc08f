//! Gateway orchestrator
//!
//! Builds the hub around exactly one event source, starts the background
//! tasks that source needs, and stops them again. Only two failures are
//! fatal: the log root cannot be opened (local mode), or the first upstream
//! connection cannot be made (upstream mode).

use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::assets::AssetResolver;
use crate::config::{Config, SourceMode};
use crate::error::Result;
use crate::hub::{EventSource, Hub};
use crate::ingest::{discovery, AssetLookup, BlockDecoder, IngestEngine, IngestSettings, MarketCache};
use crate::stats::GatewayStats;
use crate::upstream::{UpstreamConnector, UpstreamEvent, UpstreamSettings};

pub struct Gateway {
    mode: SourceMode,
    hub: Arc<Hub>,
    stats: Arc<GatewayStats>,
    assets: Option<Arc<AssetResolver>>,
    connector: Option<Arc<UpstreamConnector>>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Gateway {
    /// Start the configured source and everything it depends on
    pub async fn start(config: &Config) -> Result<Self> {
        let stats = Arc::new(GatewayStats::new()?);
        let (shutdown, _) = watch::channel(false);

        match config.source {
            SourceMode::Upstream => Self::start_upstream(config, stats, shutdown).await,
            SourceMode::Local => Self::start_local(config, stats, shutdown).await,
        }
    }

    async fn start_upstream(
        config: &Config,
        stats: Arc<GatewayStats>,
        shutdown: watch::Sender<bool>,
    ) -> Result<Self> {
        let settings = UpstreamSettings::from_config(config);
        info!(url = %settings.url, network = ?config.network, "Starting in upstream mode");

        let (connector, events) = UpstreamConnector::new(settings);
        let hub = Arc::new(Hub::new(
            EventSource::Upstream(Arc::clone(&connector)),
            Arc::clone(&stats),
        ));

        connector.start().await?;
        hub.set_source_live(true);

        let pump = tokio::spawn(pump_events(events, Arc::clone(&hub), shutdown.subscribe()));

        Ok(Self {
            mode: SourceMode::Upstream,
            hub,
            stats,
            assets: None,
            connector: Some(connector),
            shutdown,
            tasks: vec![pump],
        })
    }

    async fn start_local(
        config: &Config,
        stats: Arc<GatewayStats>,
        shutdown: watch::Sender<bool>,
    ) -> Result<Self> {
        let root = PathBuf::from(&config.node_data_path);
        info!(root = %root.display(), "Starting in local node mode");
        discovery::check_root(&root).await?;

        let assets = Arc::new(AssetResolver::from_config(config));
        if let Err(e) = assets.refresh().await {
            warn!(error = %e, "Initial asset fetch failed, unknown ids resolve to placeholders");
        }

        let cache = Arc::new(MarketCache::new(config.trade_ring_capacity, config.snapshot_trades));
        let hub = Arc::new(Hub::new(
            EventSource::Local(Arc::clone(&cache)),
            Arc::clone(&stats),
        ));

        let lookup: Arc<dyn AssetLookup> = Arc::clone(&assets) as Arc<dyn AssetLookup>;
        let engine = IngestEngine::new(
            IngestSettings::from_config(config),
            BlockDecoder::new(lookup),
            cache,
            Arc::clone(&hub),
            Arc::clone(&stats),
        );

        let tasks = vec![
            tokio::spawn(Arc::clone(&assets).run(shutdown.subscribe())),
            tokio::spawn(engine.run(shutdown.subscribe())),
        ];
        hub.set_source_live(true);

        Ok(Self {
            mode: SourceMode::Local,
            hub,
            stats,
            assets: Some(assets),
            connector: None,
            shutdown,
            tasks,
        })
    }

    pub fn mode(&self) -> SourceMode {
        self.mode
    }

    pub fn hub(&self) -> Arc<Hub> {
        Arc::clone(&self.hub)
    }

    pub fn stats(&self) -> Arc<GatewayStats> {
        Arc::clone(&self.stats)
    }

    pub fn assets(&self) -> Option<Arc<AssetResolver>> {
        self.assets.clone()
    }

    pub fn connector(&self) -> Option<Arc<UpstreamConnector>> {
        self.connector.clone()
    }

    /// Signal every background task and wait for them
    pub async fn shutdown(self) {
        info!("Shutting down gateway");
        self.shutdown.send_replace(true);
        if let Some(connector) = &self.connector {
            connector.shutdown();
        }
        self.hub.set_source_live(false);
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

/// Move connector events into the hub
async fn pump_events(
    mut events: mpsc::Receiver<UpstreamEvent>,
    hub: Arc<Hub>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = shutdown.changed() => break,
        };

        match event {
            Some(UpstreamEvent::Data(event)) => {
                hub.publish(&event);
            }
            Some(UpstreamEvent::Connected) => hub.set_source_live(true),
            Some(UpstreamEvent::Disconnected { reason }) => {
                debug!(reason = %reason, "Upstream went stale");
                hub.set_source_live(false);
            }
            Some(UpstreamEvent::GaveUp) => {
                error!("Upstream unavailable until the gateway is restarted");
                hub.set_source_live(false);
            }
            None => break,
        }
    }
}
