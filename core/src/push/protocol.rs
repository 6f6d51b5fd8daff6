/// Protocol definitions for the push hub connection
use crate::error::{ChatError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Hub protocol name sent in the handshake
pub const PROTOCOL_NAME: &str = "json";

/// Hub protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Terminates every frame
pub const RECORD_SEPARATOR: char = '\u{1e}';

const TYPE_INVOCATION: u8 = 1;
const TYPE_PING: u8 = 6;
const TYPE_CLOSE: u8 = 7;

/// Messages exchanged after the handshake
#[derive(Debug, Clone, PartialEq)]
pub enum HubMessage {
    /// Server-pushed event (`target` is the event name)
    Invocation {
        target: String,
        arguments: Vec<Value>,
    },

    /// Keepalive
    Ping,

    /// Server is closing the connection
    Close {
        error: Option<String>,
        allow_reconnect: bool,
    },

    /// Message types this client does not act on
    Other(u8),
}

#[derive(Serialize)]
struct HandshakeRequest<'a> {
    protocol: &'a str,
    version: u8,
}

#[derive(Deserialize)]
struct HandshakeResponse {
    #[serde(default)]
    error: Option<String>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawHubMessage {
    #[serde(rename = "type")]
    kind: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    arguments: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    allow_reconnect: Option<bool>,
}

impl HubMessage {
    /// Serialize message to one terminated frame
    pub fn to_frame(&self) -> Result<String> {
        let raw = match self {
            HubMessage::Invocation { target, arguments } => RawHubMessage {
                kind: TYPE_INVOCATION,
                target: Some(target.clone()),
                arguments: Some(arguments.clone()),
                error: None,
                allow_reconnect: None,
            },
            HubMessage::Ping => RawHubMessage {
                kind: TYPE_PING,
                target: None,
                arguments: None,
                error: None,
                allow_reconnect: None,
            },
            HubMessage::Close {
                error,
                allow_reconnect,
            } => RawHubMessage {
                kind: TYPE_CLOSE,
                target: None,
                arguments: None,
                error: error.clone(),
                allow_reconnect: Some(*allow_reconnect),
            },
            HubMessage::Other(kind) => {
                return Err(ChatError::Protocol(format!(
                    "cannot encode message type {}",
                    kind
                )))
            }
        };
        let mut frame = serde_json::to_string(&raw)?;
        frame.push(RECORD_SEPARATOR);
        Ok(frame)
    }

    /// Deserialize message from one frame body (separator already stripped)
    pub fn from_frame(body: &str) -> Result<Self> {
        let raw: RawHubMessage = serde_json::from_str(body)?;
        match raw.kind {
            TYPE_INVOCATION => {
                let target = raw.target.ok_or_else(|| {
                    ChatError::Protocol("invocation without target".to_string())
                })?;
                Ok(HubMessage::Invocation {
                    target,
                    arguments: raw.arguments.unwrap_or_default(),
                })
            }
            TYPE_PING => Ok(HubMessage::Ping),
            TYPE_CLOSE => Ok(HubMessage::Close {
                error: raw.error,
                allow_reconnect: raw.allow_reconnect.unwrap_or(false),
            }),
            other => Ok(HubMessage::Other(other)),
        }
    }

    /// Get message type as string
    pub fn message_type(&self) -> &'static str {
        match self {
            HubMessage::Invocation { .. } => "invocation",
            HubMessage::Ping => "ping",
            HubMessage::Close { .. } => "close",
            HubMessage::Other(_) => "other",
        }
    }
}

impl fmt::Display for HubMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HubMessage::Invocation { target, .. } => write!(f, "HubMessage(invocation {})", target),
            _ => write!(f, "HubMessage({})", self.message_type()),
        }
    }
}

/// Handshake request frame sent right after the socket opens
pub fn handshake_request() -> Result<String> {
    let mut frame = serde_json::to_string(&HandshakeRequest {
        protocol: PROTOCOL_NAME,
        version: PROTOCOL_VERSION,
    })?;
    frame.push(RECORD_SEPARATOR);
    Ok(frame)
}

/// Split a text payload into frame bodies.
///
/// A trailing fragment without separator is returned as the remainder so
/// the caller can prepend it to the next payload.
pub fn split_frames(buffer: &str) -> (Vec<&str>, &str) {
    let mut frames = Vec::new();
    let mut rest = buffer;
    while let Some(end) = rest.find(RECORD_SEPARATOR) {
        let body = &rest[..end];
        if !body.trim().is_empty() {
            frames.push(body);
        }
        rest = &rest[end + RECORD_SEPARATOR.len_utf8()..];
    }
    (frames, rest)
}

/// Parse the handshake response; returns the text following it, which may
/// already contain hub messages.
pub fn parse_handshake_response(text: &str) -> Result<&str> {
    let end = text.find(RECORD_SEPARATOR).ok_or_else(|| {
        ChatError::Handshake("incomplete handshake response".to_string())
    })?;
    let response: HandshakeResponse = serde_json::from_str(&text[..end])
        .map_err(|e| ChatError::Handshake(format!("invalid handshake response: {}", e)))?;
    if let Some(error) = response.error {
        return Err(ChatError::Handshake(error));
    }
    Ok(&text[end + RECORD_SEPARATOR.len_utf8()..])
}
