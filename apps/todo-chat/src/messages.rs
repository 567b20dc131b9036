//! Chat payloads, store keys and the frames pushed to clients.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ChatError;

pub const KEY_PREFIX: &str = "chat:";

/// Length of a timestamp produced by [`format_timestamp`],
/// e.g. `2024-05-01T09:30:00.000000Z`.
pub const TIMESTAMP_LEN: usize = 27;

/// Fixed-width UTC timestamp. Lexicographic order equals chronological order.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|at| at.with_timezone(&Utc))
}

/// A stored chat message: the client's JSON object plus the receive timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(flatten)]
    pub fields: Map<String, Value>,
    pub timestamp: String,
}

/// Parse a client frame into its payload fields. Only JSON objects are accepted.
pub fn parse_client_payload(raw: &str) -> Result<Map<String, Value>, ChatError> {
    let value: Value =
        serde_json::from_str(raw).map_err(|err| ChatError::MalformedMessage(err.to_string()))?;
    match value {
        Value::Object(fields) => Ok(fields),
        _ => Err(ChatError::MalformedMessage(
            "expected a JSON object".to_string(),
        )),
    }
}

impl ChatMessage {
    /// Attach the receive timestamp. A client supplied `timestamp` is replaced.
    pub fn new(mut fields: Map<String, Value>, timestamp: String) -> Self {
        fields.remove("timestamp");
        Self { fields, timestamp }
    }

    pub fn sent_at(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(&self.timestamp)
    }
}

/// Store key `chat:{room_id}:{timestamp}`.
///
/// The timestamp suffix has a fixed width so the key is split from the right
/// and room ids may themselves contain `:`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageKey {
    pub room_id: String,
    pub timestamp: String,
}

impl MessageKey {
    pub fn new(room_id: impl Into<String>, timestamp: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            timestamp: timestamp.into(),
        }
    }

    pub fn room_prefix(room_id: &str) -> String {
        format!("{}{}:", KEY_PREFIX, room_id)
    }

    pub fn parse(key: &str) -> Option<Self> {
        let rest = key.strip_prefix(KEY_PREFIX)?;
        if rest.len() <= TIMESTAMP_LEN || !rest.is_char_boundary(rest.len() - TIMESTAMP_LEN) {
            return None;
        }
        let (head, timestamp) = rest.split_at(rest.len() - TIMESTAMP_LEN);
        let room_id = head.strip_suffix(':')?;
        Some(Self::new(room_id, timestamp))
    }
}

impl std::fmt::Display for MessageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}:{}", KEY_PREFIX, self.room_id, self.timestamp)
    }
}

/// Frames sent from the server to a chat client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Messages { messages: Vec<ChatMessage> },
    Error { message: String },
}
