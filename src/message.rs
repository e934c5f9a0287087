//! Wire frames: JSON arrays whose first element is a string tag.

use serde_json::{Value, json};

use crate::error::Error;
use crate::event::{Event, EventId};
use crate::filter::Filter;

/// Client → relay control frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    /// Open or replace a wire subscription.
    Req {
        subscription_id: String,
        filters: Vec<Filter>,
    },
    /// Tear down a wire subscription.
    Close { subscription_id: String },
    /// Publish an event.
    Event(Box<Event>),
    /// Respond to a NIP-42 challenge.
    Auth(Box<Event>),
}

impl ClientMessage {
    pub fn to_json(&self) -> String {
        let value = match self {
            ClientMessage::Req {
                subscription_id,
                filters,
            } => {
                let mut frame = vec![json!("REQ"), json!(subscription_id)];
                frame.extend(filters.iter().map(|f| json!(f)));
                Value::Array(frame)
            }
            ClientMessage::Close { subscription_id } => json!(["CLOSE", subscription_id]),
            ClientMessage::Event(event) => json!(["EVENT", event]),
            ClientMessage::Auth(event) => json!(["AUTH", event]),
        };
        value.to_string()
    }
}

/// Relay → client frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayMessage {
    Event {
        subscription_id: String,
        event: Box<Event>,
    },
    EndOfStoredEvents { subscription_id: String },
    Ok {
        event_id: EventId,
        accepted: bool,
        message: String,
    },
    Notice { message: String },
    Closed {
        subscription_id: String,
        reason: String,
    },
}

/// A frame that failed to parse.
///
/// `claims_event` distinguishes a malformed `EVENT` frame (which counts
/// against the sending relay like an invalid signature) from mere garbage.
#[derive(Debug, Clone)]
pub struct FrameError {
    pub claims_event: bool,
    pub reason: String,
}

impl FrameError {
    fn new(reason: impl Into<String>) -> Self {
        Self {
            claims_event: false,
            reason: reason.into(),
        }
    }

    fn event(reason: impl Into<String>) -> Self {
        Self {
            claims_event: true,
            reason: reason.into(),
        }
    }
}

impl From<FrameError> for Error {
    fn from(e: FrameError) -> Self {
        Error::ProtocolFrame(e.reason)
    }
}

fn frame_str<'a>(frame: &'a [Value], index: usize, what: &str) -> Result<&'a str, FrameError> {
    frame
        .get(index)
        .and_then(Value::as_str)
        .ok_or_else(|| FrameError::new(format!("missing {what}")))
}

/// Parse a relay → client text frame.
pub fn parse_relay_message(text: &str) -> Result<RelayMessage, FrameError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| FrameError::new(format!("not JSON: {e}")))?;
    let Value::Array(frame) = value else {
        return Err(FrameError::new("frame is not an array"));
    };
    let tag = frame_str(&frame, 0, "tag")?;

    match tag {
        "EVENT" => {
            let subscription_id = frame_str(&frame, 1, "subscription id")?.to_string();
            let raw = frame
                .get(2)
                .ok_or_else(|| FrameError::event("missing event object"))?;
            let event: Event = serde_json::from_value(raw.clone())
                .map_err(|e| FrameError::event(format!("malformed event: {e}")))?;
            Ok(RelayMessage::Event {
                subscription_id,
                event: Box::new(event),
            })
        }
        "EOSE" => Ok(RelayMessage::EndOfStoredEvents {
            subscription_id: frame_str(&frame, 1, "subscription id")?.to_string(),
        }),
        "OK" => {
            let event_id = EventId::from_hex(frame_str(&frame, 1, "event id")?)
                .map_err(|e| FrameError::new(format!("OK frame: {e}")))?;
            let accepted = frame
                .get(2)
                .and_then(Value::as_bool)
                .ok_or_else(|| FrameError::new("OK frame missing flag"))?;
            let message = frame
                .get(3)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            Ok(RelayMessage::Ok {
                event_id,
                accepted,
                message,
            })
        }
        "NOTICE" => Ok(RelayMessage::Notice {
            message: frame_str(&frame, 1, "message")?.to_string(),
        }),
        "CLOSED" => Ok(RelayMessage::Closed {
            subscription_id: frame_str(&frame, 1, "subscription id")?.to_string(),
            reason: frame
                .get(2)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        }),
        other => Err(FrameError::new(format!("unknown frame tag {other:?}"))),
    }
}
