//! JSON envelope for [`Message`]: a `Type` tag plus the fields of that kind.
//!
//! Field names are written in PascalCase. On input the first letter of every key is
//! ignored for matching, so camelCase peers are understood too.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use thiserror::Error;

use super::types::{ChatBroadcast, ChatSend, Message, WireType};

const TYPE_FIELD: &str = "Type";
const KIND_FIELD: &str = "Kind";
const ID_FIELD: &str = "Id";

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed JSON payload: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("payload is not a JSON object")]
    NotAnObject,
    #[error("unknown message type `{0}`")]
    UnknownKind(String),
    #[error("invalid {kind} body: {source}")]
    InvalidBody {
        kind: WireType,
        #[source]
        source: serde_json::Error,
    },
}

impl DecodeError {
    /// Unknown-but-valid types are skipped; everything else ends the connection.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, DecodeError::UnknownKind(_))
    }
}

/// Which end of the connection produced a payload. `ChatMessage` means a
/// [`ChatSend`] when a client wrote it and a [`ChatBroadcast`] when the server did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Client,
    Server,
}

#[derive(Serialize)]
pub(crate) struct Envelope<'a, T> {
    #[serde(rename = "Type")]
    pub(crate) kind: WireType,
    #[serde(flatten)]
    pub(crate) body: &'a T,
}

pub fn serialize(message: &Message) -> Result<String, serde_json::Error> {
    let kind = message.kind().wire_type();
    match message {
        Message::ChatSend(body) => envelope(kind, body),
        Message::ChatBroadcast(body) => envelope(kind, body),
        Message::HistoryRequest(body) => envelope(kind, body),
        Message::HistoryResponse(body) => envelope(kind, body),
    }
}

fn envelope<T: Serialize>(kind: WireType, body: &T) -> Result<String, serde_json::Error> {
    serde_json::to_string(&Envelope { kind, body })
}

/// Decodes a payload written by a client, as the server reads it.
pub fn deserialize(payload: &[u8]) -> Result<Message, DecodeError> {
    decode(payload, Origin::Client)
}

/// Decodes a payload written by the server, as a client reads it.
pub fn deserialize_from_server(payload: &[u8]) -> Result<Message, DecodeError> {
    decode(payload, Origin::Server)
}

pub fn decode(payload: &[u8], origin: Origin) -> Result<Message, DecodeError> {
    let value: Value = serde_json::from_slice(payload).map_err(DecodeError::Malformed)?;
    let Value::Object(fields) = canonical_keys(value) else {
        return Err(DecodeError::NotAnObject);
    };

    let kind = wire_type_of(&fields)?;
    let body = Value::Object(fields);

    match kind {
        // Clients only ever send chat text; whatever else they attach is ignored.
        WireType::ChatMessage if origin == Origin::Client => {
            body_of(kind, body).map(Message::ChatSend)
        }
        WireType::ChatMessage => chat_from_server(body),
        WireType::HistoryRequest => body_of(kind, body).map(Message::HistoryRequest),
        WireType::HistoryResponse => body_of(kind, body).map(Message::HistoryResponse),
    }
}

/// A stamped chat is a broadcast; anything thinner is read as plain chat text.
fn chat_from_server(body: Value) -> Result<Message, DecodeError> {
    let kind = WireType::ChatMessage;
    if body.get(ID_FIELD).is_some() {
        if let Ok(broadcast) = serde_json::from_value::<ChatBroadcast>(body.clone()) {
            return Ok(Message::ChatBroadcast(broadcast));
        }
    }
    body_of::<ChatSend>(kind, body).map(Message::ChatSend)
}

/// Rewrites object keys, recursively, to start with an uppercase letter.
///
/// A key that is already canonical wins over a differently cased duplicate.
fn canonical_keys(value: Value) -> Value {
    match value {
        Value::Object(fields) => {
            let mut canonical = Map::with_capacity(fields.len());
            for (key, value) in fields {
                let value = canonical_keys(value);
                match capitalize(&key) {
                    Some(upper) => {
                        canonical.entry(upper).or_insert(value);
                    }
                    None => {
                        canonical.insert(key, value);
                    }
                }
            }
            Value::Object(canonical)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonical_keys).collect()),
        other => other,
    }
}

/// `Some` only when the key's first letter had to change.
fn capitalize(key: &str) -> Option<String> {
    let mut chars = key.chars();
    let first = chars.next()?;
    if !first.is_lowercase() {
        return None;
    }
    Some(first.to_uppercase().chain(chars).collect())
}

fn wire_type_of(fields: &Map<String, Value>) -> Result<WireType, DecodeError> {
    match fields.get(TYPE_FIELD).or_else(|| fields.get(KIND_FIELD)) {
        Some(Value::String(tag)) => {
            WireType::parse(tag).ok_or_else(|| DecodeError::UnknownKind(tag.clone()))
        }
        Some(other) => Err(DecodeError::UnknownKind(other.to_string())),
        None => Err(DecodeError::UnknownKind(String::new())),
    }
}

fn body_of<T: DeserializeOwned>(kind: WireType, body: Value) -> Result<T, DecodeError> {
    serde_json::from_value(body).map_err(|source| DecodeError::InvalidBody { kind, source })
}
