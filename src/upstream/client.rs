//! Dialing the upstream feed

use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::info;

use crate::error::{GatewayError, Result};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Open a WebSocket to `url`
pub async fn dial(url: &str) -> Result<WsStream> {
    info!(url = %url, "Connecting to upstream WebSocket");

    let (stream, response) = connect_async(url).await.map_err(|e| {
        GatewayError::WebSocketConnection(format!("Failed to connect to {}: {}", url, e))
    })?;

    info!(status = ?response.status(), "Upstream WebSocket connected");
    Ok(stream)
}
