//! Wire protocol shared by downstream sessions and the upstream feed
//!
//! Both directions use the same JSON frame shape: requests carry a `method`,
//! pushes carry a `channel` and its `data`.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use tracing::warn;

use crate::error::{GatewayError, Result};

/// Application heartbeat sent to the upstream feed
pub const HEARTBEAT_FRAME: &str = r#"{"method":"ping"}"#;

/// Channel types a subscription can target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Channel {
    AllMids,
    L2Book,
    Trades,
    Candle,
    Bbo,
    Notification,
    WebData2,
    OrderUpdates,
    UserEvents,
    UserFills,
    UserFundings,
    UserNonFundingLedgerUpdates,
    ActiveAssetCtx,
    ActiveAssetData,
    UserTwapSliceFills,
    UserTwapHistory,
}

impl Channel {
    /// Name used on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::AllMids => "allMids",
            Channel::L2Book => "l2Book",
            Channel::Trades => "trades",
            Channel::Candle => "candle",
            Channel::Bbo => "bbo",
            Channel::Notification => "notification",
            Channel::WebData2 => "webData2",
            Channel::OrderUpdates => "orderUpdates",
            Channel::UserEvents => "userEvents",
            Channel::UserFills => "userFills",
            Channel::UserFundings => "userFundings",
            Channel::UserNonFundingLedgerUpdates => "userNonFundingLedgerUpdates",
            Channel::ActiveAssetCtx => "activeAssetCtx",
            Channel::ActiveAssetData => "activeAssetData",
            Channel::UserTwapSliceFills => "userTwapSliceFills",
            Channel::UserTwapHistory => "userTwapHistory",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a session asks to receive
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionSpec {
    #[serde(rename = "type")]
    pub channel: Channel,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coin: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dex: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n_sig_figs: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mantissa: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregate_by_time: Option<bool>,
}

impl SubscriptionSpec {
    pub fn new(channel: Channel) -> Self {
        Self {
            channel,
            user: None,
            coin: None,
            interval: None,
            dex: None,
            n_sig_figs: None,
            mantissa: None,
            aggregate_by_time: None,
        }
    }

    pub fn with_coin(mut self, coin: impl Into<String>) -> Self {
        self.coin = Some(coin.into());
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_interval(mut self, interval: impl Into<String>) -> Self {
        self.interval = Some(interval.into());
        self
    }

    /// Registry key: present fields joined in a fixed order, type first
    pub fn key(&self) -> SubscriptionKey {
        let mut parts: Vec<String> = vec![self.channel.as_str().to_string()];
        for field in [&self.user, &self.coin, &self.interval, &self.dex] {
            if let Some(value) = field.as_deref().filter(|v| !v.is_empty()) {
                parts.push(value.to_string());
            }
        }
        if let Some(n) = self.n_sig_figs {
            parts.push(format!("nSigFigs={}", n));
        }
        if let Some(m) = self.mantissa {
            parts.push(format!("mantissa={}", m));
        }
        if let Some(a) = self.aggregate_by_time {
            parts.push(format!("aggregateByTime={}", a));
        }
        SubscriptionKey(parts.join(":"))
    }
}

/// Deterministic identity of a [`SubscriptionSpec`]
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionKey(String);

impl SubscriptionKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Request half of a post exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostRequest {
    /// "info" or "action"
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: Value,
}

/// Response half of a post exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostResponseBody {
    /// "info", "action" or "error"
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: Value,
}

impl PostResponseBody {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            kind: "error".to_string(),
            payload: Value::String(message.into()),
        }
    }
}

/// Raw client frame before validation
#[derive(Debug, Deserialize)]
struct ClientFrame {
    method: String,
    #[serde(default)]
    subscription: Option<SubscriptionSpec>,
    #[serde(default)]
    request: Option<PostRequest>,
    #[serde(default)]
    id: Option<u64>,
}

/// Validated downstream command
#[derive(Debug, Clone, PartialEq)]
pub enum ClientCommand {
    Subscribe(SubscriptionSpec),
    Unsubscribe(SubscriptionSpec),
    Post { id: u64, request: PostRequest },
    Ping,
}

impl ClientCommand {
    /// Decode a client frame; the error text is what the client gets back
    pub fn parse(raw: &str) -> Result<Self> {
        let frame: ClientFrame = serde_json::from_str(raw)
            .map_err(|e| GatewayError::ParseError(format!("Invalid message format: {}", e)))?;

        match frame.method.as_str() {
            "subscribe" => frame
                .subscription
                .map(ClientCommand::Subscribe)
                .ok_or_else(|| GatewayError::ParseError("Missing subscription details".into())),
            "unsubscribe" => frame
                .subscription
                .map(ClientCommand::Unsubscribe)
                .ok_or_else(|| GatewayError::ParseError("Missing subscription details".into())),
            "post" => match (frame.id, frame.request) {
                (Some(id), Some(request)) => Ok(ClientCommand::Post { id, request }),
                _ => Err(GatewayError::ParseError("Invalid POST request format".into())),
            },
            "ping" => Ok(ClientCommand::Ping),
            other => Err(GatewayError::ParseError(format!("Unknown method: {}", other))),
        }
    }
}

#[derive(Serialize)]
struct MethodFrame<'a> {
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    subscription: Option<&'a SubscriptionSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    request: Option<&'a PostRequest>,
}

/// Upstream `subscribe` request
pub fn subscribe_frame(spec: &SubscriptionSpec) -> Result<String> {
    method_frame("subscribe", spec)
}

/// Upstream `unsubscribe` request
pub fn unsubscribe_frame(spec: &SubscriptionSpec) -> Result<String> {
    method_frame("unsubscribe", spec)
}

fn method_frame(method: &str, spec: &SubscriptionSpec) -> Result<String> {
    Ok(serde_json::to_string(&MethodFrame {
        method,
        subscription: Some(spec),
        id: None,
        request: None,
    })?)
}

/// Upstream `post` request carrying the connector's correlation id
pub fn post_frame(id: u64, request: &PostRequest) -> Result<String> {
    Ok(serde_json::to_string(&MethodFrame {
        method: "post",
        subscription: None,
        id: Some(id),
        request: Some(request),
    })?)
}

#[derive(Serialize)]
struct DataFrame<'a, T: Serialize> {
    channel: &'a str,
    data: T,
}

#[derive(Serialize)]
struct SubscriptionAck<'a> {
    method: &'a str,
    subscription: &'a SubscriptionSpec,
}

#[derive(Serialize)]
struct PostReply<'a> {
    id: u64,
    response: &'a PostResponseBody,
}

#[derive(Serialize)]
struct ErrorFrame<'a> {
    error: &'a str,
    time: i64,
}

#[derive(Serialize)]
struct AllMids<'a> {
    mids: &'a BTreeMap<String, String>,
}

fn encode<T: Serialize>(frame: &T) -> Bytes {
    match serde_json::to_vec(frame) {
        Ok(buf) => Bytes::from(buf),
        Err(e) => {
            warn!(error = %e, "Failed to encode frame");
            Bytes::from_static(b"{}")
        }
    }
}

/// `{"channel":"subscriptionResponse","data":{"method":..,"subscription":..}}`
pub fn subscription_response(method: &str, spec: &SubscriptionSpec) -> Bytes {
    encode(&DataFrame {
        channel: "subscriptionResponse",
        data: SubscriptionAck {
            method,
            subscription: spec,
        },
    })
}

/// `{"channel":"post","data":{"id":..,"response":{..}}}`
pub fn post_response(id: u64, response: &PostResponseBody) -> Bytes {
    encode(&DataFrame {
        channel: "post",
        data: PostReply { id, response },
    })
}

/// `{"error":..,"time":..}`
pub fn error_frame(message: &str) -> Bytes {
    encode(&ErrorFrame {
        error: message,
        time: chrono::Utc::now().timestamp(),
    })
}

/// Reply to a client `ping`
pub fn pong_frame() -> Bytes {
    Bytes::from_static(br#"{"channel":"pong"}"#)
}

/// `allMids` push built from a symbol -> price map
pub fn all_mids_frame(mids: &BTreeMap<String, String>) -> Bytes {
    encode(&DataFrame {
        channel: Channel::AllMids.as_str(),
        data: AllMids { mids },
    })
}

/// `trades` push; the upstream sends trades as an array
pub fn trades_frame(trades: &[WsTrade]) -> Bytes {
    encode(&DataFrame {
        channel: Channel::Trades.as_str(),
        data: trades,
    })
}

/// Aggressor side of a trade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Buy,
    Sell,
}

/// Trade as pushed on the `trades` channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WsTrade {
    pub coin: String,
    pub side: TradeSide,
    pub px: String,
    pub sz: String,
    pub hash: String,
    pub time: i64,
    pub tid: u64,
    pub users: [String; 2],
}

/// One event offered to the hub for fan-out
#[derive(Debug, Clone)]
pub struct ChannelEvent {
    pub channel: String,
    /// Coin the event concerns, when it concerns exactly one
    pub coin: Option<String>,
    /// User the event concerns, when it concerns exactly one
    pub user: Option<String>,
    /// Complete frame delivered to sessions
    pub payload: Bytes,
}

impl ChannelEvent {
    pub fn new(channel: impl Into<String>, payload: Bytes) -> Self {
        Self {
            channel: channel.into(),
            coin: None,
            user: None,
            payload,
        }
    }

    pub fn with_coin(mut self, coin: impl Into<String>) -> Self {
        self.coin = Some(coin.into());
        self
    }

    /// Whether an entry subscribed with `spec` should receive this event
    pub fn matches(&self, spec: &SubscriptionSpec) -> bool {
        spec.channel.as_str() == self.channel
            && scope_matches(spec.coin.as_deref(), self.coin.as_deref(), false)
            && scope_matches(spec.user.as_deref(), self.user.as_deref(), true)
    }
}

fn scope_matches(wanted: Option<&str>, actual: Option<&str>, ignore_case: bool) -> bool {
    match (wanted.filter(|w| !w.is_empty()), actual) {
        (Some(w), Some(a)) if ignore_case => w.eq_ignore_ascii_case(a),
        (Some(w), Some(a)) => w == a,
        _ => true,
    }
}

/// Upstream frame after classification
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamFrame {
    /// Reply to our heartbeat; ignored
    Pong,
    /// Acknowledgement of a subscribe/unsubscribe; the hub already answered
    SubscriptionAck,
    PostResponse { id: u64, response: PostResponseBody },
    Data {
        channel: String,
        coin: Option<String>,
        user: Option<String>,
    },
}

#[derive(Deserialize)]
struct UpstreamEnvelope {
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    data: Option<Value>,
}

#[derive(Deserialize)]
struct UpstreamPostData {
    id: u64,
    response: PostResponseBody,
}

/// Classify a raw upstream text frame
pub fn classify_upstream(raw: &str) -> Result<UpstreamFrame> {
    let envelope: UpstreamEnvelope = serde_json::from_str(raw)?;

    if envelope.method.as_deref() == Some("pong") || envelope.channel.as_deref() == Some("pong") {
        return Ok(UpstreamFrame::Pong);
    }

    let channel = envelope
        .channel
        .ok_or_else(|| GatewayError::ParseError("Upstream frame without channel".into()))?;

    match channel.as_str() {
        "subscriptionResponse" => Ok(UpstreamFrame::SubscriptionAck),
        "post" => {
            let data = envelope
                .data
                .ok_or_else(|| GatewayError::ParseError("Post response without data".into()))?;
            let post: UpstreamPostData = serde_json::from_value(data)?;
            Ok(UpstreamFrame::PostResponse {
                id: post.id,
                response: post.response,
            })
        }
        _ => {
            let (coin, user) = envelope
                .data
                .as_ref()
                .map(|data| scope_of(&channel, data))
                .unwrap_or((None, None));
            Ok(UpstreamFrame::Data {
                channel,
                coin,
                user,
            })
        }
    }
}

/// Coin and user named by a push payload (first element for array payloads)
fn scope_of(channel: &str, data: &Value) -> (Option<String>, Option<String>) {
    let target = match data {
        Value::Array(items) => match items.first() {
            Some(first) => first,
            None => return (None, None),
        },
        other => other,
    };

    let field = |name: &str| target.get(name).and_then(Value::as_str).map(str::to_string);
    let coin = field("coin").or_else(|| {
        if channel == Channel::Candle.as_str() {
            field("s")
        } else {
            None
        }
    });
    (coin, field("user"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_orders_fields_type_first() {
        let spec: SubscriptionSpec = serde_json::from_str(
            r#"{"type":"candle","interval":"1m","coin":"BTC","user":"0xabc"}"#,
        )
        .unwrap();
        assert_eq!(spec.key().as_str(), "candle:0xabc:BTC:1m");
    }

    #[test]
    fn test_key_skips_empty_fields() {
        let a: SubscriptionSpec =
            serde_json::from_str(r#"{"type":"trades","coin":"ETH","user":""}"#).unwrap();
        let b = SubscriptionSpec::new(Channel::Trades).with_coin("ETH");
        assert_eq!(a.key(), b.key());
        assert_eq!(a.key().as_str(), "trades:ETH");
    }

    #[test]
    fn test_key_distinguishes_book_precision() {
        let coarse: SubscriptionSpec =
            serde_json::from_str(r#"{"type":"l2Book","coin":"BTC","nSigFigs":3}"#).unwrap();
        let full: SubscriptionSpec =
            serde_json::from_str(r#"{"type":"l2Book","coin":"BTC"}"#).unwrap();
        assert_ne!(coarse.key(), full.key());
    }

    #[test]
    fn test_parse_subscribe_command() {
        let cmd =
            ClientCommand::parse(r#"{"method":"subscribe","subscription":{"type":"allMids"}}"#)
                .unwrap();
        assert_eq!(cmd, ClientCommand::Subscribe(SubscriptionSpec::new(Channel::AllMids)));
    }

    #[test]
    fn test_parse_rejects_unknown_channel_and_method() {
        assert!(ClientCommand::parse(
            r#"{"method":"subscribe","subscription":{"type":"nope"}}"#
        )
        .is_err());

        let err = ClientCommand::parse(r#"{"method":"dance"}"#).unwrap_err();
        assert!(err.to_string().contains("Unknown method: dance"));
    }

    #[test]
    fn test_parse_post_requires_id() {
        let err = ClientCommand::parse(
            r#"{"method":"post","request":{"type":"info","payload":{"type":"meta"}}}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("Invalid POST request format"));
    }

    #[test]
    fn test_classify_upstream_frames() {
        assert_eq!(classify_upstream(r#"{"channel":"pong"}"#).unwrap(), UpstreamFrame::Pong);
        assert_eq!(classify_upstream(r#"{"method":"pong"}"#).unwrap(), UpstreamFrame::Pong);

        let post = classify_upstream(
            r#"{"channel":"post","data":{"id":7,"response":{"type":"info","payload":{"ok":1}}}}"#,
        )
        .unwrap();
        assert!(matches!(post, UpstreamFrame::PostResponse { id: 7, .. }));

        let trades = classify_upstream(
            r#"{"channel":"trades","data":[{"coin":"ETH","side":"B","px":"1","sz":"2"}]}"#,
        )
        .unwrap();
        assert_eq!(
            trades,
            UpstreamFrame::Data {
                channel: "trades".into(),
                coin: Some("ETH".into()),
                user: None
            }
        );

        let candle = classify_upstream(r#"{"channel":"candle","data":{"s":"SOL","i":"1m"}}"#)
            .unwrap();
        assert!(matches!(candle, UpstreamFrame::Data { coin: Some(ref c), .. } if c == "SOL"));
    }

    #[test]
    fn test_event_scope_matching() {
        let eth = SubscriptionSpec::new(Channel::Trades).with_coin("ETH");
        let any = SubscriptionSpec::new(Channel::Trades);
        let event = ChannelEvent::new("trades", Bytes::new()).with_coin("BTC");

        assert!(!event.matches(&eth));
        assert!(event.matches(&any));
        assert!(!event.matches(&SubscriptionSpec::new(Channel::AllMids)));
    }

    #[test]
    fn test_frames_render_expected_shape() {
        let spec = SubscriptionSpec::new(Channel::Trades).with_coin("BTC");
        let ack: Value = serde_json::from_slice(&subscription_response("subscribe", &spec)).unwrap();
        assert_eq!(ack["channel"], "subscriptionResponse");
        assert_eq!(ack["data"]["subscription"]["coin"], "BTC");

        let reply: Value =
            serde_json::from_slice(&post_response(3, &PostResponseBody::error("nope"))).unwrap();
        assert_eq!(reply["data"]["id"], 3);
        assert_eq!(reply["data"]["response"]["type"], "error");

        let err: Value = serde_json::from_slice(&error_frame("bad")).unwrap();
        assert_eq!(err["error"], "bad");
        assert!(err["time"].is_i64());
    }
}
