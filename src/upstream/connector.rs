//! Resilient connection to the upstream feed
//!
//! One supervisor task owns the socket. Each connection runs a writer
//! (outbound queue plus heartbeat) and a reader (classification and
//! response correlation); the first of them to fail ends the connection.
//! Tracked subscriptions survive disconnects and are replayed on every
//! reconnect.

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, sleep, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, error, info, trace, warn};

use super::client::{dial, WsStream};
use super::pending::PendingRequests;
use crate::config::Config;
use crate::error::{GatewayError, Result};
use crate::protocol::{
    self, ChannelEvent, PostRequest, PostResponseBody, SubscriptionKey, SubscriptionSpec,
    UpstreamFrame, HEARTBEAT_FRAME,
};

const EVENT_QUEUE_CAPACITY: usize = 4_096;
const OUTBOUND_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct UpstreamSettings {
    pub url: String,
    pub reconnect_interval: Duration,
    pub max_reconnect_attempts: u32,
    pub heartbeat_interval: Duration,
    pub request_timeout: Duration,
    pub send_timeout: Duration,
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            url: "wss://api.hyperliquid.xyz/ws".to_string(),
            reconnect_interval: Duration::from_secs(5),
            max_reconnect_attempts: 5,
            heartbeat_interval: Duration::from_secs(50),
            request_timeout: Duration::from_secs(30),
            send_timeout: Duration::from_secs(5),
        }
    }
}

impl UpstreamSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            url: config.upstream_url().to_string(),
            reconnect_interval: config.reconnect_interval(),
            max_reconnect_attempts: config.max_reconnect_attempts,
            heartbeat_interval: config.heartbeat_interval(),
            request_timeout: config.request_timeout(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// What the connector reports to whoever pumps its events
#[derive(Debug)]
pub enum UpstreamEvent {
    Connected,
    Disconnected { reason: String },
    Data(ChannelEvent),
    /// Reconnect attempts exhausted; stays down until restarted
    GaveUp,
}

pub struct UpstreamConnector {
    settings: UpstreamSettings,
    state: RwLock<ConnectionState>,
    outbound: Mutex<Option<mpsc::Sender<Message>>>,
    tracked: Mutex<BTreeMap<SubscriptionKey, SubscriptionSpec>>,
    pending: Arc<PendingRequests>,
    next_request_id: AtomicU64,
    events: mpsc::Sender<UpstreamEvent>,
    shutdown: watch::Sender<bool>,
}

impl UpstreamConnector {
    pub fn new(settings: UpstreamSettings) -> (Arc<Self>, mpsc::Receiver<UpstreamEvent>) {
        let (events, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let (shutdown, _) = watch::channel(false);
        let connector = Arc::new(Self {
            settings,
            state: RwLock::new(ConnectionState::Disconnected),
            outbound: Mutex::new(None),
            tracked: Mutex::new(BTreeMap::new()),
            pending: Arc::new(PendingRequests::new()),
            next_request_id: AtomicU64::new(1),
            events,
            shutdown,
        });
        (connector, rx)
    }

    /// Make the first connection and hand the socket to the supervisor.
    /// Failing to connect here is fatal for the caller.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let stream = self.connect_once().await?;
        let this = Arc::clone(self);
        tokio::spawn(async move { this.supervise(stream).await });
        Ok(())
    }

    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
        self.outbound.lock().take();
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Specs replayed on the next reconnect, ordered by key
    pub fn tracked_specs(&self) -> Vec<SubscriptionSpec> {
        self.tracked.lock().values().cloned().collect()
    }

    /// Subscribe upstream and track the spec for replay
    pub async fn subscribe(&self, spec: &SubscriptionSpec) -> Result<()> {
        if !self.is_connected() {
            return Err(GatewayError::UpstreamNotConnected);
        }
        let key = spec.key();
        let frame = protocol::subscribe_frame(spec)?;

        self.tracked.lock().insert(key.clone(), spec.clone());
        if let Err(e) = self.send(Message::Text(frame)).await {
            self.tracked.lock().remove(&key);
            return Err(e);
        }
        info!(key = %key, "Subscribed upstream");
        Ok(())
    }

    /// Stop tracking the spec and unsubscribe if connected. While
    /// disconnected there is nothing to undo: it simply won't be replayed.
    pub async fn unsubscribe(&self, spec: &SubscriptionSpec) -> Result<()> {
        let key = spec.key();
        if self.tracked.lock().remove(&key).is_none() {
            return Ok(());
        }
        if !self.is_connected() {
            debug!(key = %key, "Dropped tracked subscription while disconnected");
            return Ok(());
        }
        self.send(Message::Text(protocol::unsubscribe_frame(spec)?)).await?;
        info!(key = %key, "Unsubscribed upstream");
        Ok(())
    }

    /// Correlated request/response, bounded by the request timeout
    pub async fn post(&self, request: &PostRequest) -> Result<PostResponseBody> {
        if !self.is_connected() {
            return Err(GatewayError::UpstreamNotConnected);
        }
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let slot = self.pending.open(id);
        self.send(Message::Text(protocol::post_frame(id, request)?)).await?;
        debug!(request_id = id, kind = %request.kind, "Post sent upstream");
        slot.wait(self.settings.request_timeout).await
    }

    async fn send(&self, message: Message) -> Result<()> {
        let sender = self
            .outbound
            .lock()
            .clone()
            .ok_or(GatewayError::UpstreamNotConnected)?;
        match timeout(self.settings.send_timeout, sender.send(message)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(GatewayError::UpstreamNotConnected),
            Err(_) => Err(GatewayError::SendTimeout),
        }
    }

    async fn connect_once(&self) -> Result<WsStream> {
        *self.state.write() = ConnectionState::Connecting;
        match dial(&self.settings.url).await {
            Ok(stream) => Ok(stream),
            Err(e) => {
                *self.state.write() = ConnectionState::Disconnected;
                Err(e)
            }
        }
    }

    async fn supervise(self: Arc<Self>, first: WsStream) {
        let mut shutdown = self.shutdown.subscribe();
        let mut stream = Some(first);

        while let Some(ws) = stream.take() {
            let reason = self.run_connection(ws, &mut shutdown).await;
            self.on_disconnect(reason).await;
            if *shutdown.borrow() {
                info!("Upstream connector stopped");
                return;
            }
            stream = self.reconnect(&mut shutdown).await;
        }
    }

    /// Linear backoff: attempt N waits N x the base interval
    async fn reconnect(&self, shutdown: &mut watch::Receiver<bool>) -> Option<WsStream> {
        let max = self.settings.max_reconnect_attempts;
        for attempt in 1..=max {
            let delay = self.settings.reconnect_interval * attempt;
            warn!(attempt, max, delay_ms = delay.as_millis() as u64, "Reconnecting to upstream");

            tokio::select! {
                _ = sleep(delay) => {}
                _ = shutdown.changed() => return None,
            }
            if *shutdown.borrow() {
                return None;
            }

            match self.connect_once().await {
                Ok(stream) => return Some(stream),
                Err(e) => warn!(attempt, error = %e, "Reconnect attempt failed"),
            }
        }

        error!(attempts = max, error = %GatewayError::MaxReconnectAttemptsExceeded, "Giving up on upstream");
        self.emit(UpstreamEvent::GaveUp).await;
        None
    }

    async fn run_connection(&self, ws: WsStream, shutdown: &mut watch::Receiver<bool>) -> String {
        let (mut sink, mut source) = ws.split();
        let (tx, mut rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE_CAPACITY);

        // replay before going live so no subscribe can interleave with it
        let replay = self.tracked_specs();
        for spec in &replay {
            let frame = match protocol::subscribe_frame(spec) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(key = %spec.key(), error = %e, "Failed to encode resubscribe");
                    continue;
                }
            };
            if let Err(e) = sink.send(Message::Text(frame)).await {
                return format!("resubscribe failed: {}", e);
            }
        }

        *self.outbound.lock() = Some(tx);
        *self.state.write() = ConnectionState::Connected;
        info!(url = %self.settings.url, resubscribed = replay.len(), "Upstream connected");
        self.emit(UpstreamEvent::Connected).await;

        let period = self.settings.heartbeat_interval;
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let writer = async {
            loop {
                tokio::select! {
                    message = rx.recv() => match message {
                        Some(message) => {
                            if let Err(e) = sink.send(message).await {
                                return format!("write failed: {}", e);
                            }
                        }
                        None => return "outbound queue closed".to_string(),
                    },
                    _ = heartbeat.tick() => {
                        if let Err(e) = sink.send(Message::Text(HEARTBEAT_FRAME.to_string())).await {
                            return format!("heartbeat failed: {}", e);
                        }
                        trace!("Heartbeat sent");
                    }
                }
            }
        };

        let reader = async {
            while let Some(message) = source.next().await {
                match message {
                    Ok(Message::Text(text)) => self.handle_text(text).await,
                    Ok(Message::Binary(data)) => {
                        self.handle_text(String::from_utf8_lossy(&data).into_owned()).await
                    }
                    Ok(Message::Close(frame)) => return format!("closed by upstream: {:?}", frame),
                    Ok(_) => {}
                    Err(e) => return format!("read failed: {}", e),
                }
            }
            "stream ended".to_string()
        };

        tokio::select! {
            reason = writer => reason,
            reason = reader => reason,
            _ = shutdown.changed() => "shutdown".to_string(),
        }
    }

    async fn handle_text(&self, text: String) {
        match protocol::classify_upstream(&text) {
            Ok(UpstreamFrame::Pong) => trace!("Heartbeat acknowledged"),
            Ok(UpstreamFrame::SubscriptionAck) => debug!("Upstream subscription acknowledged"),
            Ok(UpstreamFrame::PostResponse { id, response }) => {
                if !self.pending.complete(id, response) {
                    debug!(request_id = id, "Response for unknown or expired request");
                }
            }
            Ok(UpstreamFrame::Data { channel, coin, user }) => {
                let event = ChannelEvent {
                    channel,
                    coin,
                    user,
                    payload: Bytes::from(text),
                };
                self.emit(UpstreamEvent::Data(event)).await;
            }
            Err(e) => debug!(error = %e, "Ignoring unclassifiable upstream frame"),
        }
    }

    async fn on_disconnect(&self, reason: String) {
        *self.state.write() = ConnectionState::Disconnected;
        self.outbound.lock().take();
        let abandoned = self.pending.abandon_all();
        warn!(reason = %reason, abandoned, "Upstream connection lost");
        self.emit(UpstreamEvent::Disconnected { reason }).await;
    }

    async fn emit(&self, event: UpstreamEvent) {
        if self.events.send(event).await.is_err() {
            trace!("Upstream event receiver dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Channel;
    use serde_json::{json, Value};
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    /// Local feed. Records every text frame as (connection number, frame),
    /// answers posts when asked to, and closes the first connection after
    /// `drop_first_after` frames.
    async fn feed(answer_posts: bool, drop_first_after: Option<usize>) -> (String, mpsc::UnboundedReceiver<(usize, Value)>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut connection = 0usize;
            while let Ok((socket, _)) = listener.accept().await {
                connection += 1;
                let n = connection;
                let tx = tx.clone();
                tokio::spawn(async move {
                    let Ok(mut ws) = accept_async(socket).await else {
                        return;
                    };
                    let mut seen = 0usize;
                    while let Some(Ok(message)) = ws.next().await {
                        let Message::Text(text) = message else {
                            continue;
                        };
                        let frame: Value = serde_json::from_str(&text).unwrap();
                        seen += 1;

                        if answer_posts && frame["method"] == "post" {
                            let reply = json!({
                                "channel": "post",
                                "data": {"id": frame["id"], "response": {"type": "info", "payload": {"echo": true}}}
                            });
                            let _ = ws.send(Message::Text(reply.to_string())).await;
                        }
                        let _ = tx.send((n, frame));

                        if n == 1 && Some(seen) == drop_first_after {
                            let _ = ws.close(None).await;
                            return;
                        }
                    }
                });
            }
        });

        (format!("ws://{}", addr), rx)
    }

    fn settings(url: String) -> UpstreamSettings {
        UpstreamSettings {
            url,
            reconnect_interval: Duration::from_millis(20),
            max_reconnect_attempts: 3,
            heartbeat_interval: Duration::from_secs(3600),
            request_timeout: Duration::from_secs(5),
            send_timeout: Duration::from_secs(1),
        }
    }

    async fn next_frame(rx: &mut mpsc::UnboundedReceiver<(usize, Value)>) -> (usize, Value) {
        timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_first_connect_failure_is_fatal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        drop(listener);

        let (connector, _events) = UpstreamConnector::new(settings(url));
        assert!(connector.start().await.is_err());
        assert_eq!(connector.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_subscribe_requires_connection() {
        let (connector, _events) = UpstreamConnector::new(UpstreamSettings::default());
        let spec = SubscriptionSpec::new(Channel::AllMids);
        assert!(matches!(
            connector.subscribe(&spec).await,
            Err(GatewayError::UpstreamNotConnected)
        ));
        assert!(connector.tracked_specs().is_empty());
    }

    #[tokio::test]
    async fn test_reconnect_resubscribes_each_spec_once() {
        let (url, mut frames) = feed(false, Some(2)).await;
        let (connector, mut events) = UpstreamConnector::new(settings(url));
        connector.start().await.unwrap();

        let mids = SubscriptionSpec::new(Channel::AllMids);
        let eth = SubscriptionSpec::new(Channel::Trades).with_coin("ETH");
        connector.subscribe(&mids).await.unwrap();
        connector.subscribe(&eth).await.unwrap();

        let mut first = Vec::new();
        while first.len() < 2 {
            let (n, frame) = next_frame(&mut frames).await;
            assert_eq!(n, 1);
            first.push(frame);
        }

        let mut replayed = Vec::new();
        while replayed.len() < 2 {
            let (n, frame) = next_frame(&mut frames).await;
            assert_eq!(n, 2);
            assert_eq!(frame["method"], "subscribe");
            replayed.push(frame["subscription"]["type"].as_str().unwrap().to_string());
        }
        replayed.sort();
        assert_eq!(replayed, vec!["allMids", "trades"]);

        // nothing else arrives on the new connection
        assert!(timeout(Duration::from_millis(100), frames.recv()).await.is_err());

        let mut saw_disconnect = false;
        while let Ok(Some(event)) = timeout(Duration::from_millis(50), events.recv()).await {
            if matches!(event, UpstreamEvent::Disconnected { .. }) {
                saw_disconnect = true;
            }
        }
        assert!(saw_disconnect);
        assert!(connector.is_connected());
        connector.shutdown();
    }

    #[tokio::test]
    async fn test_post_is_correlated() {
        let (url, _frames) = feed(true, None).await;
        let (connector, _events) = UpstreamConnector::new(settings(url));
        connector.start().await.unwrap();

        let request = PostRequest {
            kind: "info".to_string(),
            payload: json!({"type": "meta"}),
        };
        let response = connector.post(&request).await.unwrap();
        assert_eq!(response.kind, "info");
        assert_eq!(response.payload["echo"], true);
        assert_eq!(connector.pending_count(), 0);
        connector.shutdown();
    }

    #[tokio::test]
    async fn test_post_timeout_releases_slot() {
        let (url, _frames) = feed(false, None).await;
        let mut config = settings(url);
        config.request_timeout = Duration::from_millis(50);
        let (connector, _events) = UpstreamConnector::new(config);
        connector.start().await.unwrap();

        let request = PostRequest {
            kind: "info".to_string(),
            payload: json!({"type": "meta"}),
        };
        let result = connector.post(&request).await;
        assert!(matches!(result, Err(GatewayError::RequestTimeout(_))));
        assert_eq!(connector.pending_count(), 0);
        connector.shutdown();
    }

    #[tokio::test]
    async fn test_disconnect_abandons_in_flight_posts() {
        let (url, _frames) = feed(false, Some(1)).await;
        let (connector, _events) = UpstreamConnector::new(settings(url));
        connector.start().await.unwrap();

        let request = PostRequest {
            kind: "info".to_string(),
            payload: json!({"type": "meta"}),
        };
        let started = Instant::now();
        let result = connector.post(&request).await;
        assert!(matches!(result, Err(GatewayError::RequestAbandoned(_))));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(connector.pending_count(), 0);
        connector.shutdown();
    }

    #[tokio::test]
    async fn test_heartbeat_is_sent() {
        let (url, mut frames) = feed(false, None).await;
        let mut config = settings(url);
        config.heartbeat_interval = Duration::from_millis(20);
        let (connector, _events) = UpstreamConnector::new(config);
        connector.start().await.unwrap();

        let (_, frame) = next_frame(&mut frames).await;
        assert_eq!(frame, json!({"method": "ping"}));
        connector.shutdown();
    }
}
