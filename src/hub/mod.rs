//! Subscription hub
//!
//! Tracks which sessions want which subscription keys and fans source events
//! out to them. The registry sits behind one reader/writer lock: fan-out takes
//! the shared side, every mutation takes the exclusive side, so publish never
//! sees an entry halfway through an update. Nothing awaits while the lock is
//! held; upstream calls and evictions happen after it is released.
//!
//! Upstream subscribe and unsubscribe intents are queued while the write
//! lock is held and drained by one task, so the connector sees them in the
//! same order the registry changed.

mod session;

pub use session::{DeliveryError, SessionHandle, SessionId};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{GatewayError, Result};
use crate::ingest::MarketCache;
use crate::protocol::{
    self, ChannelEvent, ClientCommand, PostRequest, PostResponseBody, SubscriptionKey,
    SubscriptionSpec,
};
use crate::stats::GatewayStats;
use crate::upstream::UpstreamConnector;

/// The source currently feeding the hub
#[derive(Clone)]
pub enum EventSource {
    Upstream(Arc<UpstreamConnector>),
    Local(Arc<MarketCache>),
}

impl EventSource {
    pub fn name(&self) -> &'static str {
        match self {
            EventSource::Upstream(_) => "upstream",
            EventSource::Local(_) => "local",
        }
    }
}

/// Last payload fanned out for an entry
#[derive(Debug, Clone)]
struct CachedPayload {
    payload: Bytes,
    updated_at: DateTime<Utc>,
}

/// One subscription key and the sessions that want it
pub struct RegistryEntry {
    spec: SubscriptionSpec,
    generation: u64,
    sessions: HashMap<SessionId, Arc<SessionHandle>>,
    last: Mutex<Option<CachedPayload>>,
}

impl RegistryEntry {
    fn new(spec: SubscriptionSpec, generation: u64) -> Self {
        Self {
            spec,
            generation,
            sessions: HashMap::new(),
            last: Mutex::new(None),
        }
    }

    fn store(&self, payload: Bytes) {
        *self.last.lock() = Some(CachedPayload {
            payload,
            updated_at: Utc::now(),
        });
    }

    fn cached(&self) -> Option<Bytes> {
        self.last.lock().as_ref().map(|c| c.payload.clone())
    }

    fn last_update(&self) -> Option<DateTime<Utc>> {
        self.last.lock().as_ref().map(|c| c.updated_at)
    }
}

/// Upstream work queued by registry changes
enum UpstreamOp {
    Subscribe {
        spec: SubscriptionSpec,
        generation: u64,
        origin: Arc<SessionHandle>,
    },
    Unsubscribe(SubscriptionSpec),
}

#[derive(Default)]
struct Registry {
    sessions: HashMap<SessionId, Arc<SessionHandle>>,
    entries: HashMap<SubscriptionKey, RegistryEntry>,
}

pub struct Hub {
    registry: RwLock<Registry>,
    source: EventSource,
    stats: Arc<GatewayStats>,
    next_session_id: AtomicU64,
    next_generation: AtomicU64,
    source_live: AtomicBool,
    upstream_ops: mpsc::UnboundedSender<UpstreamOp>,
    upstream_queue: Mutex<Option<mpsc::UnboundedReceiver<UpstreamOp>>>,
}

impl Hub {
    pub fn new(source: EventSource, stats: Arc<GatewayStats>) -> Self {
        let (upstream_ops, upstream_queue) = mpsc::unbounded_channel();
        Self {
            registry: RwLock::new(Registry::default()),
            source,
            stats,
            next_session_id: AtomicU64::new(1),
            next_generation: AtomicU64::new(1),
            source_live: AtomicBool::new(false),
            upstream_ops,
            upstream_queue: Mutex::new(Some(upstream_queue)),
        }
    }

    pub fn source(&self) -> &EventSource {
        &self.source
    }

    /// Create a session handle with a fresh id and register it
    pub fn open_session(&self, queue_capacity: usize) -> (Arc<SessionHandle>, mpsc::Receiver<Bytes>) {
        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let (handle, rx) = SessionHandle::new(id, queue_capacity);
        let handle = Arc::new(handle);
        self.register(Arc::clone(&handle));
        (handle, rx)
    }

    pub fn register(&self, session: Arc<SessionHandle>) {
        let mut registry = self.registry.write();
        let id = session.id();
        registry.sessions.insert(id, session);
        self.update_gauges(&registry);
        info!(session_id = id, total = registry.sessions.len(), "Session registered");
    }

    /// Remove a session from the active set and from every entry it belongs
    /// to, then fire its teardown signal. Safe to call more than once.
    pub fn unregister(&self, id: SessionId) -> bool {
        let session = {
            let mut guard = self.registry.write();
            let registry = &mut *guard;
            let Some(session) = registry.sessions.remove(&id) else {
                return false;
            };

            for key in session.take_keys() {
                let now_empty = match registry.entries.get_mut(&key) {
                    Some(entry) => {
                        entry.sessions.remove(&id);
                        entry.sessions.is_empty()
                    }
                    None => false,
                };
                if now_empty {
                    if let Some(entry) = registry.entries.remove(&key) {
                        self.queue_upstream(UpstreamOp::Unsubscribe(entry.spec));
                    }
                }
            }
            self.update_gauges(registry);
            session
        };

        session.close();
        info!(session_id = id, "Session unregistered");
        true
    }

    /// Add the session to the entry for `spec`, creating it on first use, and
    /// send the acknowledgement plus whatever the session should see first.
    pub fn subscribe(self: &Arc<Self>, session: &Arc<SessionHandle>, spec: SubscriptionSpec) -> Result<()> {
        let key = spec.key();
        self.ensure_upstream_worker();
        let (created, cached) = {
            let mut guard = self.registry.write();
            let registry = &mut *guard;
            if !registry.sessions.contains_key(&session.id()) {
                return Err(GatewayError::SessionClosed(session.id()));
            }

            let mut created = None;
            let entry = registry.entries.entry(key.clone()).or_insert_with(|| {
                let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                created = Some(generation);
                RegistryEntry::new(spec.clone(), generation)
            });
            if let Some(generation) = created {
                self.queue_upstream(UpstreamOp::Subscribe {
                    spec: spec.clone(),
                    generation,
                    origin: Arc::clone(session),
                });
            }
            entry.sessions.insert(session.id(), Arc::clone(session));
            session.add_key(key.clone());
            let cached = entry.cached();
            self.update_gauges(registry);
            (created, cached)
        };

        debug!(session_id = session.id(), key = %key, new_entry = created.is_some(), "Subscribed");
        self.reply(session, protocol::subscription_response("subscribe", &spec));

        match &self.source {
            EventSource::Upstream(_) => {
                if let Some(payload) = cached {
                    self.reply(session, payload);
                }
            }
            EventSource::Local(cache) => {
                if let Some(snapshot) = cache.initial_snapshot(&spec).or(cached) {
                    self.reply(session, snapshot);
                }
            }
        }
        Ok(())
    }

    pub fn unsubscribe(&self, session: &Arc<SessionHandle>, spec: &SubscriptionSpec) {
        let key = spec.key();
        let pruned = {
            let mut guard = self.registry.write();
            let registry = &mut *guard;
            session.remove_key(&key);
            let now_empty = match registry.entries.get_mut(&key) {
                Some(entry) => {
                    entry.sessions.remove(&session.id());
                    entry.sessions.is_empty()
                }
                None => false,
            };
            let mut pruned = false;
            if now_empty {
                if let Some(entry) = registry.entries.remove(&key) {
                    self.queue_upstream(UpstreamOp::Unsubscribe(entry.spec));
                    pruned = true;
                }
            }
            self.update_gauges(registry);
            pruned
        };

        debug!(session_id = session.id(), key = %key, pruned, "Unsubscribed");
        self.reply(session, protocol::subscription_response("unsubscribe", spec));
    }

    /// Offer an event to every matching entry. Sessions whose queue is full
    /// are evicted once the registry lock is released.
    pub fn publish(&self, event: &ChannelEvent) -> usize {
        self.stats.messages_processed.inc();

        let mut delivered = 0usize;
        let mut stalled: Vec<(SessionId, DeliveryError)> = Vec::new();
        {
            let registry = self.registry.read();
            for entry in registry.entries.values().filter(|e| event.matches(&e.spec)) {
                entry.store(event.payload.clone());
                for session in entry.sessions.values() {
                    match session.try_deliver(event.payload.clone()) {
                        Ok(()) => delivered += 1,
                        Err(reason) => stalled.push((session.id(), reason)),
                    }
                }
            }
        }

        self.stats.messages_forwarded.inc_by(delivered as u64);

        stalled.sort_unstable_by_key(|(id, _)| *id);
        stalled.dedup_by_key(|(id, _)| *id);
        for (id, reason) in stalled {
            if reason == DeliveryError::Full {
                warn!(session_id = id, channel = %event.channel, "Outbound queue full, evicting session");
                self.stats.sessions_evicted.inc();
            }
            self.unregister(id);
        }

        delivered
    }

    /// Relay a post request and answer with the client's own id
    pub async fn post(&self, session: &Arc<SessionHandle>, id: u64, request: PostRequest) {
        self.stats.post_requests.inc();

        let response = match &self.source {
            EventSource::Local(_) => PostResponseBody::error(
                GatewayError::Unsupported("POST requests in local node mode".into()).to_string(),
            ),
            EventSource::Upstream(connector) => match connector.post(&request).await {
                Ok(response) => response,
                Err(e) => {
                    warn!(session_id = session.id(), request_id = id, error = %e, "Post request failed");
                    PostResponseBody::error(e.to_string())
                }
            },
        };

        self.reply(session, protocol::post_response(id, &response));
    }

    /// Decode one inbound text frame and run it
    pub async fn handle_frame(self: &Arc<Self>, session: &Arc<SessionHandle>, raw: &str) {
        let command = match ClientCommand::parse(raw) {
            Ok(command) => command,
            Err(e) => {
                debug!(session_id = session.id(), error = %e, "Rejected client frame");
                let message = match e {
                    GatewayError::ParseError(message) => message,
                    other => other.to_string(),
                };
                self.reply(session, protocol::error_frame(&message));
                return;
            }
        };

        match command {
            ClientCommand::Subscribe(spec) => {
                if let Err(e) = self.subscribe(session, spec) {
                    debug!(session_id = session.id(), error = %e, "Subscribe on closed session");
                }
            }
            ClientCommand::Unsubscribe(spec) => self.unsubscribe(session, &spec),
            ClientCommand::Post { id, request } => self.post(session, id, request).await,
            ClientCommand::Ping => self.reply(session, protocol::pong_frame()),
        }
    }

    pub fn set_source_live(&self, live: bool) {
        let was = self.source_live.swap(live, Ordering::Relaxed);
        if was != live {
            info!(source = self.source.name(), live, "Source liveness changed");
        }
        self.stats.source_live.set(i64::from(live));
    }

    pub fn is_source_live(&self) -> bool {
        self.source_live.load(Ordering::Relaxed)
    }

    pub fn session_count(&self) -> usize {
        self.registry.read().sessions.len()
    }

    pub fn subscription_count(&self) -> usize {
        self.registry.read().entries.len()
    }

    /// Sessions subscribed to `key`, or None when no entry exists
    pub fn subscribers(&self, key: &SubscriptionKey) -> Option<Vec<SessionId>> {
        let registry = self.registry.read();
        registry.entries.get(key).map(|entry| {
            let mut ids: Vec<_> = entry.sessions.keys().copied().collect();
            ids.sort_unstable();
            ids
        })
    }

    /// Time the entry for `key` last fanned out a payload
    pub fn last_update(&self, key: &SubscriptionKey) -> Option<DateTime<Utc>> {
        self.registry.read().entries.get(key).and_then(RegistryEntry::last_update)
    }

    /// Specs of every live entry, ordered by key
    pub fn active_specs(&self) -> Vec<SubscriptionSpec> {
        let registry = self.registry.read();
        let mut entries: Vec<_> = registry.entries.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries.into_iter().map(|(_, e)| e.spec.clone()).collect()
    }

    /// Queue a direct reply; a session that cannot take it is torn down
    fn reply(&self, session: &Arc<SessionHandle>, frame: Bytes) {
        match session.try_deliver(frame) {
            Ok(()) => {}
            Err(DeliveryError::Full) => {
                warn!(session_id = session.id(), "Outbound queue full on reply, evicting session");
                self.stats.sessions_evicted.inc();
                self.unregister(session.id());
            }
            Err(DeliveryError::Closed) => {
                self.unregister(session.id());
            }
        }
    }

    /// Start draining queued upstream work. The first subscribe in
    /// upstream mode does this; later calls find the queue already taken.
    fn ensure_upstream_worker(self: &Arc<Self>) {
        let EventSource::Upstream(connector) = &self.source else {
            return;
        };
        let Some(queue) = self.upstream_queue.lock().take() else {
            return;
        };
        let connector = Arc::clone(connector);
        let hub = Arc::downgrade(self);
        tokio::spawn(drain_upstream_ops(hub, connector, queue));
    }

    /// Called with the registry write lock held so queue order matches
    /// registry order
    fn queue_upstream(&self, op: UpstreamOp) {
        if matches!(self.source, EventSource::Upstream(_)) && self.upstream_ops.send(op).is_err() {
            warn!("Upstream work queue closed");
        }
    }

    /// Delete the entry created at `generation`; a newer entry under the same
    /// key is left alone.
    fn rollback(&self, key: &SubscriptionKey, generation: u64) {
        let mut guard = self.registry.write();
        let registry = &mut *guard;
        let matches = registry
            .entries
            .get(key)
            .map(|entry| entry.generation == generation)
            .unwrap_or(false);
        if !matches {
            return;
        }
        if let Some(entry) = registry.entries.remove(key) {
            for session in entry.sessions.values() {
                session.remove_key(key);
            }
        }
        self.update_gauges(registry);
    }

    fn update_gauges(&self, registry: &Registry) {
        self.stats.sessions.set(registry.sessions.len() as i64);
        self.stats.subscriptions.set(registry.entries.len() as i64);
    }
}

async fn drain_upstream_ops(
    hub: Weak<Hub>,
    connector: Arc<UpstreamConnector>,
    mut queue: mpsc::UnboundedReceiver<UpstreamOp>,
) {
    while let Some(op) = queue.recv().await {
        match op {
            UpstreamOp::Subscribe { spec, generation, origin } => {
                let Err(e) = connector.subscribe(&spec).await else {
                    continue;
                };
                let key = spec.key();
                warn!(key = %key, error = %e, "Upstream subscribe failed, rolling back entry");
                let Some(hub) = hub.upgrade() else {
                    return;
                };
                hub.rollback(&key, generation);
                hub.reply(&origin, protocol::error_frame(&format!("Failed to subscribe: {}", e)));
            }
            UpstreamOp::Unsubscribe(spec) => {
                if let Err(e) = connector.unsubscribe(&spec).await {
                    warn!(key = %spec.key(), error = %e, "Upstream unsubscribe failed");
                }
            }
        }
    }
    debug!("Upstream work queue drained");
}
