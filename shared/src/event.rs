//! Real-time `{type, data, timestamp}` frames pushed over the WebSocket.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::catalog::Message;
use crate::model::{OrderId, OrderStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Chat,
    OrderUpdate,
    System,
    Matching,
    Other,
}

impl EventKind {
    pub fn from_wire(kind: &str) -> Self {
        match kind {
            "chat" => Self::Chat,
            "order_update" => Self::OrderUpdate,
            "system" => Self::System,
            "matching" => Self::Matching,
            _ => Self::Other,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::OrderUpdate => "order_update",
            Self::System => "system",
            Self::Matching => "matching",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderUpdate {
    #[serde(alias = "id")]
    pub order_id: OrderId,
    #[serde(default)]
    pub status: Option<OrderStatus>,
    #[serde(default)]
    pub order_no: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemNotice {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    Chat(Message),
    OrderUpdate(OrderUpdate),
    System(SystemNotice),
    Matching(serde_json::Value),
    /// A type this client does not know, kept verbatim.
    Other {
        kind: String,
        data: serde_json::Value,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventError {
    #[error("frame is not a JSON envelope: {0}")]
    NotAnEnvelope(String),
    #[error("'{kind}' event has malformed data: {reason}")]
    MalformedData { kind: String, reason: String },
}

#[derive(Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Serialize)]
struct OutboundFrame<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    data: &'a serde_json::Value,
}

impl ServerEvent {
    pub fn parse(frame: &str) -> Result<Self, EventError> {
        let raw: RawFrame =
            serde_json::from_str(frame).map_err(|e| EventError::NotAnEnvelope(e.to_string()))?;

        let kind = EventKind::from_wire(&raw.kind);
        let malformed = |e: serde_json::Error| EventError::MalformedData {
            kind: raw.kind.clone(),
            reason: e.to_string(),
        };
        let event = match kind {
            EventKind::Chat => Self::Chat(serde_json::from_value(raw.data).map_err(malformed)?),
            EventKind::OrderUpdate => {
                Self::OrderUpdate(serde_json::from_value(raw.data).map_err(malformed)?)
            }
            EventKind::System => {
                Self::System(serde_json::from_value(raw.data).map_err(malformed)?)
            }
            EventKind::Matching => Self::Matching(raw.data),
            EventKind::Other => Self::Other {
                kind: raw.kind,
                data: raw.data,
            },
        };
        Ok(event)
    }

    pub fn kind(&self) -> EventKind {
        match self {
            Self::Chat(_) => EventKind::Chat,
            Self::OrderUpdate(_) => EventKind::OrderUpdate,
            Self::System(_) => EventKind::System,
            Self::Matching(_) => EventKind::Matching,
            Self::Other { .. } => EventKind::Other,
        }
    }
}

/// Serializes an outbound `{type, data}` frame.
pub fn encode_frame(kind: &str, data: &serde_json::Value) -> Result<String, serde_json::Error> {
    serde_json::to_string(&OutboundFrame { kind, data })
}
