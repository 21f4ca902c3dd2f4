use serde::{Deserialize, Serialize};

/// A chat message relayed from the gateway stream
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Message {
    /// Message body, matched against the prefix filter
    pub text: String,
    pub channel: String,
    pub username: String,
    pub userid: String,
    pub avatar: String,
    pub account: String,
    pub protocol: String,
    pub gateway: String,
    pub parent_id: String,
    pub timestamp: String,
    pub id: String,
}

/// One decoded line of the gateway stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayRecord {
    /// A normal chat message, eligible for forwarding
    Chat(Message),
    /// A control event such as `api_connected` or a join/leave notice
    Event(String),
}

/// Record shape as it appears on the wire, where `event` discriminates
/// chat messages from control events.
#[derive(Deserialize)]
struct WireRecord {
    #[serde(flatten)]
    message: Message,
    #[serde(default)]
    event: String,
}

/// Outbound shape sent to the webhook. Carries the same field set the
/// gateway emits, with `event` always empty.
#[derive(Serialize)]
struct OutboundRecord<'a> {
    #[serde(flatten)]
    message: &'a Message,
    event: &'static str,
}

impl GatewayRecord {
    /// Decode a single NDJSON line
    pub fn decode(line: &[u8]) -> serde_json::Result<Self> {
        let wire: WireRecord = serde_json::from_slice(line)?;
        if wire.event.is_empty() {
            Ok(GatewayRecord::Chat(wire.message))
        } else {
            Ok(GatewayRecord::Event(wire.event))
        }
    }
}

impl Message {
    /// Encode as the webhook body: a JSON array holding just this message
    pub fn to_webhook_body(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(&[OutboundRecord {
            message: self,
            event: "",
        }])
    }
}
