//! Message shapes exchanged with the monitor.
//!
//! Outbound traffic is always a [`Command`]. Inbound objects are classified
//! by their discriminating key: `QMP` for the greeting, `return` or `error`
//! for responses and `event` for asynchronous events.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::capability::CapabilitySet;
use crate::error::{FramingError, PeerError};
use crate::events::Event;
use crate::state::MessageKind;
use crate::types::VersionInfo;

/// Outbound command.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Command {
    /// Command name.
    pub execute: String,
    /// Command arguments.
    pub arguments: Map<String, Value>,
    /// Correlation identifier, present only in out-of-band mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
}

/// Server greeting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Greeting {
    /// Version of the monitored process.
    pub version: VersionInfo,
    /// Capabilities the server offers.
    #[serde(default)]
    pub capabilities: CapabilitySet,
}

/// Command response.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// Echoed correlation identifier, if any.
    pub id: Option<Value>,
    /// Success payload or the monitor's error object.
    pub outcome: Result<Value, PeerError>,
}

/// Classified inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Server greeting.
    Greeting(Greeting),
    /// Command response.
    Response(Response),
    /// Asynchronous event.
    Event(Event),
}

impl Inbound {
    /// Classifies a decoded JSON object.
    ///
    /// # Errors
    ///
    /// Returns [`FramingError::UnknownShape`] when no discriminating key is
    /// present and [`FramingError::Malformed`] when the body of a recognised
    /// message does not parse.
    pub fn classify(mut message: Map<String, Value>) -> Result<Self, FramingError> {
        if let Some(body) = message.remove("QMP") {
            return serde_json::from_value(body)
                .map(Self::Greeting)
                .map_err(|source| FramingError::Malformed {
                    kind: MessageKind::Greeting,
                    source,
                });
        }

        if let Some(payload) = message.remove("return") {
            return Ok(Self::Response(Response {
                id: message.remove("id"),
                outcome: Ok(payload),
            }));
        }

        if let Some(error) = message.remove("error") {
            let peer = serde_json::from_value(error).map_err(|source| FramingError::Malformed {
                kind: MessageKind::Response,
                source,
            })?;
            return Ok(Self::Response(Response {
                id: message.remove("id"),
                outcome: Err(peer),
            }));
        }

        if message.contains_key("event") {
            return serde_json::from_value(Value::Object(message))
                .map(Self::Event)
                .map_err(|source| FramingError::Malformed {
                    kind: MessageKind::Event,
                    source,
                });
        }

        let keys = message.keys().map(String::as_str).collect::<Vec<_>>().join(", ");
        Err(FramingError::UnknownShape { keys })
    }

    /// Kind of the message.
    #[must_use]
    pub const fn kind(&self) -> MessageKind {
        match self {
            Self::Greeting(_) => MessageKind::Greeting,
            Self::Response(_) => MessageKind::Response,
            Self::Event(_) => MessageKind::Event,
        }
    }
}
