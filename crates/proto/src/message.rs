//! Wire messages between client and relay.
//!
//! Client to relay: EVENT, REQ, CLOSE, AUTH.
//! Relay to client: EVENT, OK, EOSE, CLOSED, NOTICE, AUTH.
//! All messages are JSON arrays whose first element names the type.

use crate::event::Event;
use crate::filter::Filter;
use serde_json::Value;
use thiserror::Error;

/// Errors from parsing or building wire messages.
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("invalid message format: {0}")]
    InvalidFormat(String),

    #[error("unknown message type: {0}")]
    UnknownType(String),

    #[error("missing field: {0}")]
    MissingField(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Messages sent from client to relay.
#[derive(Debug, Clone)]
pub enum ClientMessage {
    /// `["EVENT", <event>]`
    Event(Event),

    /// `["REQ", <subscription_id>, <filter>...]`
    Req {
        subscription_id: String,
        filters: Vec<Filter>,
    },

    /// `["CLOSE", <subscription_id>]`
    Close { subscription_id: String },

    /// `["AUTH", <signed auth event>]` (NIP-42)
    Auth(Event),
}

impl ClientMessage {
    /// Serialize to the JSON array form sent on the wire.
    pub fn to_json(&self) -> Result<String, MessageError> {
        let value = match self {
            ClientMessage::Event(event) => serde_json::json!(["EVENT", event]),
            ClientMessage::Req {
                subscription_id,
                filters,
            } => {
                let mut arr: Vec<Value> = vec![
                    Value::String("REQ".to_string()),
                    Value::String(subscription_id.clone()),
                ];
                for filter in filters {
                    arr.push(serde_json::to_value(filter)?);
                }
                Value::Array(arr)
            }
            ClientMessage::Close { subscription_id } => {
                serde_json::json!(["CLOSE", subscription_id])
            }
            ClientMessage::Auth(event) => serde_json::json!(["AUTH", event]),
        };
        Ok(value.to_string())
    }
}

/// Messages sent from relay to client.
#[derive(Debug, Clone)]
pub enum RelayMessage {
    /// `["EVENT", <subscription_id>, <event>]`
    Event {
        subscription_id: String,
        event: Event,
    },

    /// `["OK", <event_id>, <accepted>, <message>]`
    Ok {
        event_id: String,
        accepted: bool,
        message: String,
    },

    /// `["EOSE", <subscription_id>]` — end of stored events
    Eose { subscription_id: String },

    /// `["CLOSED", <subscription_id>, <message>]` — relay ended a subscription
    Closed {
        subscription_id: String,
        message: String,
    },

    /// `["NOTICE", <message>]`
    Notice { message: String },

    /// `["AUTH", <challenge>]` (NIP-42)
    Auth { challenge: String },
}

fn str_at(arr: &[Value], idx: usize, what: &str) -> Result<String, MessageError> {
    arr.get(idx)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| MessageError::InvalidFormat(format!("{} must be a string", what)))
}

impl RelayMessage {
    /// Parse a JSON wire message from a relay.
    pub fn from_json(json: &str) -> Result<Self, MessageError> {
        let arr: Vec<Value> =
            serde_json::from_str(json).map_err(|e| MessageError::InvalidFormat(e.to_string()))?;

        let msg_type = arr
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| MessageError::InvalidFormat("first element not a string".to_string()))?
            .to_string();

        match msg_type.as_str() {
            "EVENT" => {
                if arr.len() < 3 {
                    return Err(MessageError::MissingField("subscription_id or event".to_string()));
                }
                let subscription_id = str_at(&arr, 1, "subscription_id")?;
                let event: Event = serde_json::from_value(arr[2].clone())?;
                Ok(RelayMessage::Event {
                    subscription_id,
                    event,
                })
            }
            "OK" => {
                if arr.len() < 4 {
                    return Err(MessageError::MissingField("OK fields".to_string()));
                }
                let event_id = str_at(&arr, 1, "event_id")?;
                let accepted = arr[2].as_bool().ok_or_else(|| {
                    MessageError::InvalidFormat("accepted must be a boolean".to_string())
                })?;
                let message = arr[3].as_str().unwrap_or("").to_string();
                Ok(RelayMessage::Ok {
                    event_id,
                    accepted,
                    message,
                })
            }
            "EOSE" => Ok(RelayMessage::Eose {
                subscription_id: str_at(&arr, 1, "subscription_id")?,
            }),
            "CLOSED" => {
                if arr.len() < 3 {
                    return Err(MessageError::MissingField("CLOSED fields".to_string()));
                }
                let subscription_id = str_at(&arr, 1, "subscription_id")?;
                let message = arr[2].as_str().unwrap_or("").to_string();
                Ok(RelayMessage::Closed {
                    subscription_id,
                    message,
                })
            }
            "NOTICE" => Ok(RelayMessage::Notice {
                message: str_at(&arr, 1, "message")?,
            }),
            "AUTH" => Ok(RelayMessage::Auth {
                challenge: str_at(&arr, 1, "challenge")?,
            }),
            other => Err(MessageError::UnknownType(other.to_string())),
        }
    }
}
