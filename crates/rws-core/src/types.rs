//! Wire-format envelopes.
//!
//! Every frame is a JSON object. Inbound frames are routed by their `to`
//! field; outbound frames always carry `from`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::{Result, RwsError};

/// A single wire frame.
pub type Envelope = Map<String, Value>;

/// Address of the server itself, used as `from` on server-originated frames.
pub const SYSTEM_ADDRESS: &str = "sys";
/// Address that fans a frame out to every other session.
pub const BROADCAST_ADDRESS: &str = "all";
/// Prefix of a multicast group address.
pub const GROUP_PREFIX: char = '#';

/// Envelope field names.
pub mod fields {
    /// Routing target.
    pub const TO: &str = "to";
    /// Sender, stamped on every outbound frame.
    pub const FROM: &str = "from";
    /// Correlation id of a call, or handler id of an event.
    pub const ID: &str = "id";
    /// Target object of a call.
    pub const OBJECT: &str = "object";
    /// Operation of a call.
    pub const METHOD: &str = "method";
    /// Ordered call arguments.
    pub const PARAMS: &str = "params";
    /// Successful call result.
    pub const RESULT: &str = "result";
    /// Failed call description.
    pub const EXCEPTION: &str = "exception";
    /// Event payload.
    pub const EVENT: &str = "event";
}

/// Where an inbound envelope is headed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Route {
    /// Local call dispatch.
    System,
    /// Every other live session.
    Broadcast,
    /// Every other member of a multicast group.
    Group(String),
    /// A single session by id.
    Direct(String),
}

impl Route {
    /// Derive the route from the envelope's `to` field.
    pub fn of(envelope: &Envelope) -> Result<Self> {
        match envelope.get(fields::TO) {
            None | Some(Value::Null) => Ok(Self::System),
            Some(Value::String(to)) => Ok(Self::parse(to)),
            Some(other) => Err(RwsError::InvalidEnvelope {
                message: format!("'to' must be a string, got {other}"),
            }),
        }
    }

    /// Parse a textual address.
    pub fn parse(to: &str) -> Self {
        if to == SYSTEM_ADDRESS {
            Self::System
        } else if to == BROADCAST_ADDRESS {
            Self::Broadcast
        } else if let Some(group) = to.strip_prefix(GROUP_PREFIX) {
            Self::Group(group.to_owned())
        } else {
            Self::Direct(to.to_owned())
        }
    }
}

/// A call extracted from an envelope addressed to the server.
#[derive(Clone, Debug, PartialEq)]
pub struct CallRequest {
    /// Correlation id; `None` means the caller does not want a reply.
    pub id: Option<Value>,
    /// Target object name.
    pub object: Option<String>,
    /// Operation name.
    pub method: Option<String>,
    /// Ordered arguments.
    pub params: Vec<Value>,
}

impl CallRequest {
    /// Extract a call from an envelope.
    ///
    /// Never fails: missing object/method are reported at dispatch so the
    /// caller still gets an exception reply when it supplied an id. A
    /// `params` value that is not an array means "no arguments".
    pub fn from_envelope(envelope: &Envelope) -> Self {
        let id = envelope.get(fields::ID).filter(|v| !v.is_null()).cloned();
        let object = envelope
            .get(fields::OBJECT)
            .and_then(Value::as_str)
            .map(str::to_owned);
        let method = envelope
            .get(fields::METHOD)
            .and_then(Value::as_str)
            .map(str::to_owned);
        let params = match envelope.get(fields::PARAMS) {
            Some(Value::Array(items)) => items.clone(),
            _ => Vec::new(),
        };
        Self {
            id,
            object,
            method,
            params,
        }
    }
}

/// Client-chosen event subscription.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionSpec {
    /// Id echoed back on every event frame.
    pub handler_id: String,
    /// Object exposing the event.
    pub object: String,
    /// Event name.
    pub event: String,
    /// Action within the event.
    pub action: String,
}

/// Build `{id, result}`.
pub fn call_result(id: Value, result: Value) -> Envelope {
    let mut env = Envelope::new();
    let _ = env.insert(fields::ID.into(), id);
    let _ = env.insert(fields::RESULT.into(), result);
    env
}

/// Build `{id, exception}`.
pub fn call_exception(id: Value, description: impl Into<String>) -> Envelope {
    let mut env = Envelope::new();
    let _ = env.insert(fields::ID.into(), id);
    let _ = env.insert(fields::EXCEPTION.into(), Value::String(description.into()));
    env
}

/// Build `{id: handlerId, event}`.
pub fn event_message(handler_id: &str, data: Value) -> Envelope {
    let mut env = Envelope::new();
    let _ = env.insert(fields::ID.into(), Value::String(handler_id.to_owned()));
    let _ = env.insert(fields::EVENT.into(), data);
    env
}
