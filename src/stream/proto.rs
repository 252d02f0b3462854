//! JSON events pushed by the node over the payments websocket.

use serde::{Deserialize, Serialize};

/// Incoming payment notification pushed by the node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PaymentReceived {
    /// Settlement time as reported by the node.
    pub timestamp: i64,
    /// Amount received, in satoshis.
    pub amount_sat: i64,
    /// Hex-encoded payment hash.
    pub payment_hash: String,
    /// Caller-supplied id attached to the invoice, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
}

/// Event envelope, discriminated by the `type` field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeEvent {
    /// An invoice was paid.
    PaymentReceived(PaymentReceived),
    /// Any event type this crate does not model.
    #[serde(other)]
    Unknown,
}

impl NodeEvent {
    /// Parses one text payload.
    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Serializes back to the wire JSON.
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Routing key used by downstream relays.
    pub fn external_id(&self) -> Option<&str> {
        match self {
            Self::PaymentReceived(payment) => payment.external_id.as_deref(),
            Self::Unknown => None,
        }
    }
}
