//! Downstream session network loops
//!
//! Each connection gets a reader task and a writer task. They share nothing
//! but the hub-side handle: the bounded outbound queue and the teardown
//! signal. Whichever side stops first unregisters the session, which wakes
//! the other.

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::hub::{Hub, SessionHandle};

/// Frames merged into one write at most
pub const COALESCE_LIMIT: usize = 64;

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub queue_capacity: usize,
    pub max_frame_bytes: usize,
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
    pub coalesce_limit: usize,
}

impl SessionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            queue_capacity: config.session_queue_capacity,
            max_frame_bytes: config.max_inbound_frame_bytes,
            ping_interval: Duration::from_secs(config.ping_interval_secs),
            pong_timeout: Duration::from_secs(config.pong_timeout_secs),
            coalesce_limit: COALESCE_LIMIT,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Drive one upgraded connection until either side ends it
pub async fn serve_session(socket: WebSocket, hub: Arc<Hub>, settings: SessionSettings) {
    let (session, rx) = hub.open_session(settings.queue_capacity);
    let id = session.id();
    info!(session_id = id, "Client connected");

    let (sink, stream) = socket.split();
    let writer = tokio::spawn(write_loop(
        sink,
        rx,
        Arc::clone(&hub),
        Arc::clone(&session),
        settings.clone(),
    ));
    let reader = tokio::spawn(read_loop(stream, Arc::clone(&hub), Arc::clone(&session), settings));

    let _ = tokio::join!(writer, reader);
    hub.unregister(id);
    info!(session_id = id, "Client disconnected");
}

async fn read_loop(
    mut stream: SplitStream<WebSocket>,
    hub: Arc<Hub>,
    session: Arc<SessionHandle>,
    settings: SessionSettings,
) {
    let id = session.id();
    let mut closed = session.shutdown_signal();
    if session.is_closed() {
        return;
    }

    loop {
        let message = tokio::select! {
            message = stream.next() => message,
            _ = closed.changed() => break,
        };
        let message = match message {
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                debug!(session_id = id, error = %e, "Read failed");
                break;
            }
            None => break,
        };
        session.touch();

        let text = match message {
            Message::Text(text) => text,
            Message::Binary(data) => String::from_utf8_lossy(&data).into_owned(),
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(_) => break,
        };

        if text.len() > settings.max_frame_bytes {
            warn!(
                session_id = id,
                size = text.len(),
                limit = settings.max_frame_bytes,
                "Inbound frame over size cap, closing session"
            );
            break;
        }
        hub.handle_frame(&session, &text).await;
    }

    hub.unregister(id);
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Bytes>,
    hub: Arc<Hub>,
    session: Arc<SessionHandle>,
    settings: SessionSettings,
) {
    let id = session.id();
    let mut closed = session.shutdown_signal();
    let mut ping = interval_at(Instant::now() + settings.ping_interval, settings.ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    while !session.is_closed() {
        let deadline = settings.pong_timeout.saturating_sub(session.idle_for());
        tokio::select! {
            frame = rx.recv() => {
                let Some(first) = frame else { break };
                let mut batch = vec![first];
                while batch.len() < settings.coalesce_limit {
                    match rx.try_recv() {
                        Ok(frame) => batch.push(frame),
                        Err(_) => break,
                    }
                }
                if let Err(e) = sink.send(Message::Text(coalesce(&batch))).await {
                    debug!(session_id = id, error = %e, "Write failed");
                    break;
                }
            }
            _ = ping.tick() => {
                if let Err(e) = sink.send(Message::Ping(Vec::new())).await {
                    debug!(session_id = id, error = %e, "Ping failed");
                    break;
                }
            }
            _ = sleep(deadline) => {
                if session.idle_for() >= settings.pong_timeout {
                    warn!(session_id = id, "No liveness response before deadline, closing session");
                    break;
                }
            }
            _ = closed.changed() => break,
        }
    }

    let _ = sink.close().await;
    hub.unregister(id);
}

/// One write carrying several queued frames, newline-delimited
pub fn coalesce(frames: &[Bytes]) -> String {
    let mut out = String::with_capacity(frames.iter().map(|f| f.len() + 1).sum());
    for (i, frame) in frames.iter().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        out.push_str(&String::from_utf8_lossy(frame));
    }
    out
}
