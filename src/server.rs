//! HTTP front door: WebSocket upgrade plus health, stats and metrics

use axum::{
    extract::{ws::WebSocketUpgrade, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::warn;

use crate::assets::AssetResolver;
use crate::config::Config;
use crate::gateway::Gateway;
use crate::hub::Hub;
use crate::session::{serve_session, SessionSettings};
use crate::stats::GatewayStats;
use crate::upstream::UpstreamConnector;

/// Shared state handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<Hub>,
    pub stats: Arc<GatewayStats>,
    pub assets: Option<Arc<AssetResolver>>,
    pub connector: Option<Arc<UpstreamConnector>>,
    pub session: SessionSettings,
    pub max_clients: usize,
    /// One permit per connected client, held for the life of the session
    pub slots: Arc<Semaphore>,
}

impl AppState {
    pub fn new(gateway: &Gateway, config: &Config) -> Self {
        Self {
            hub: gateway.hub(),
            stats: gateway.stats(),
            assets: gateway.assets(),
            connector: gateway.connector(),
            session: SessionSettings::from_config(config),
            max_clients: config.max_clients,
            slots: Arc::new(Semaphore::new(config.max_clients)),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/metrics", get(metrics))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let Ok(permit) = Arc::clone(&state.slots).try_acquire_owned() else {
        warn!(
            connected = state.hub.session_count(),
            limit = state.max_clients,
            "Rejecting connection, client limit reached"
        );
        return (StatusCode::SERVICE_UNAVAILABLE, "Too many connections").into_response();
    };

    let hub = Arc::clone(&state.hub);
    let settings = state.session.clone();
    ws.max_message_size(settings.max_frame_bytes)
        .on_upgrade(move |socket| async move {
            serve_session(socket, hub, settings).await;
            drop(permit);
        })
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let live = state.hub.is_source_live();
    Json(json!({
        "status": if live { "healthy" } else { "degraded" },
        "source": state.hub.source().name(),
        "source_live": live,
        "connected_clients": state.hub.session_count(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn stats(State(state): State<AppState>) -> Json<Value> {
    let upstream = state.connector.as_ref().map(|c| {
        json!({
            "state": format!("{:?}", c.state()),
            "tracked_subscriptions": c.tracked_specs().len(),
            "pending_requests": c.pending_count(),
        })
    });

    Json(json!({
        "gateway": state.stats.snapshot(),
        "subscriptions": state.hub.subscription_count(),
        "assets": state.assets.as_ref().map(|a| a.stats()),
        "upstream": upstream,
    }))
}

async fn metrics(State(state): State<AppState>) -> Response {
    match state.stats.encode() {
        Ok(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::EventSource;
    use crate::ingest::MarketCache;
    use futures_util::{SinkExt, StreamExt};
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::time::timeout;
    use tokio_tungstenite::{connect_async, tungstenite::Message};

    async fn spawn_server(max_clients: usize) -> (String, Arc<Hub>) {
        let stats = Arc::new(GatewayStats::new().unwrap());
        let cache = Arc::new(MarketCache::new(100, 5));
        let hub = Arc::new(Hub::new(EventSource::Local(cache), Arc::clone(&stats)));
        hub.set_source_live(true);

        let state = AppState {
            hub: Arc::clone(&hub),
            stats,
            assets: None,
            connector: None,
            session: SessionSettings::default(),
            max_clients,
            slots: Arc::new(Semaphore::new(max_clients)),
        };

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, router(state)).await;
        });
        (format!("127.0.0.1:{}", addr.port()), hub)
    }

    async fn next_text<S>(ws: &mut S) -> Value
    where
        S: futures_util::Stream<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>>
            + Unpin,
    {
        loop {
            let message = timeout(Duration::from_secs(5), ws.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            if let Message::Text(text) = message {
                return serde_json::from_str(text.lines().next().unwrap()).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_subscribe_and_ping_over_websocket() {
        let (addr, hub) = spawn_server(10).await;
        let (mut ws, _) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();

        ws.send(Message::Text(r#"{"method":"ping"}"#.to_string())).await.unwrap();
        assert_eq!(next_text(&mut ws).await["channel"], "pong");

        ws.send(Message::Text(
            r#"{"method":"subscribe","subscription":{"type":"trades","coin":"ETH"}}"#.to_string(),
        ))
        .await
        .unwrap();
        let ack = next_text(&mut ws).await;
        assert_eq!(ack["channel"], "subscriptionResponse");
        assert_eq!(ack["data"]["subscription"]["coin"], "ETH");
        assert_eq!(hub.subscription_count(), 1);

        ws.close(None).await.unwrap();
        timeout(Duration::from_secs(5), async {
            while hub.session_count() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(hub.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_oversized_frame_closes_session() {
        let (addr, hub) = spawn_server(10).await;
        let (mut ws, _) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();

        let huge = format!(r#"{{"method":"ping","pad":"{}"}}"#, "x".repeat(8_192));
        let _ = ws.send(Message::Text(huge)).await;

        let closed = timeout(Duration::from_secs(5), async {
            loop {
                match ws.next().await {
                    None | Some(Err(_)) | Some(Ok(Message::Close(_))) => return,
                    Some(Ok(_)) => continue,
                }
            }
        })
        .await;
        assert!(closed.is_ok());

        timeout(Duration::from_secs(5), async {
            while hub.session_count() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_client_limit_returns_503() {
        let (addr, hub) = spawn_server(1).await;
        let (_first, _) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();

        timeout(Duration::from_secs(5), async {
            while hub.session_count() < 1 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        match connect_async(format!("ws://{}/ws", addr)).await {
            Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
                assert_eq!(response.status(), 503);
            }
            other => panic!("expected 503, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_upgrades_respect_client_limit() {
        let (addr, hub) = spawn_server(2).await;
        let url = format!("ws://{}/ws", addr);

        let attempts: Vec<_> = (0..8)
            .map(|_| tokio::spawn(connect_async(url.clone())))
            .collect();
        let mut accepted = Vec::new();
        let mut rejected = 0;
        for attempt in attempts {
            match attempt.await.unwrap() {
                Ok((ws, _)) => accepted.push(ws),
                Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
                    assert_eq!(response.status(), 503);
                    rejected += 1;
                }
                Err(e) => panic!("unexpected connect error: {}", e),
            }
        }
        assert_eq!(accepted.len(), 2);
        assert_eq!(rejected, 6);

        // closing one client frees its slot for the next
        let mut first = accepted.remove(0);
        first.close(None).await.unwrap();
        let reconnected = timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(pair) = connect_async(url.clone()).await {
                    return pair;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(reconnected.is_ok());
        assert!(hub.session_count() <= 2);
    }

    #[tokio::test]
    async fn test_health_and_metrics_endpoints() {
        let (addr, _hub) = spawn_server(10).await;

        let health: Value = reqwest::get(format!("http://{}/health", addr))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["status"], "healthy");
        assert_eq!(health["source"], "local");

        let stats: Value = reqwest::get(format!("http://{}/stats", addr))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(stats["gateway"]["connected_clients"], 0);

        let metrics = reqwest::get(format!("http://{}/metrics", addr))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(metrics.contains("gateway_sessions"));
    }
}
