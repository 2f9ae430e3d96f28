use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use uuid::Uuid;

use super::message::Envelope;

/// Value of the `Type` field carried by every JSON body on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WireType {
    ChatMessage,
    HistoryRequest,
    HistoryResponse,
}

impl WireType {
    pub const ALL: [WireType; 3] = [
        WireType::ChatMessage,
        WireType::HistoryRequest,
        WireType::HistoryResponse,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            WireType::ChatMessage => "ChatMessage",
            WireType::HistoryRequest => "HistoryRequest",
            WireType::HistoryResponse => "HistoryResponse",
        }
    }

    /// Case-insensitive lookup of a wire tag.
    pub fn parse(tag: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|wire_type| wire_type.as_str().eq_ignore_ascii_case(tag.trim()))
    }
}

impl fmt::Display for WireType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Discriminant of [`Message`]. Used as the dispatch key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    ChatSend,
    ChatBroadcast,
    HistoryRequest,
    HistoryResponse,
}

impl MessageKind {
    pub fn wire_type(self) -> WireType {
        match self {
            MessageKind::ChatSend | MessageKind::ChatBroadcast => WireType::ChatMessage,
            MessageKind::HistoryRequest => WireType::HistoryRequest,
            MessageKind::HistoryResponse => WireType::HistoryResponse,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Chat text typed by a user, client -> server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ChatSend {
    pub content: String,
}

/// A chat message accepted and stamped by the server, server -> clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ChatBroadcast {
    pub id: Uuid,
    pub sender: String,
    pub content: String,
    #[serde(rename = "Timestamp", alias = "SentAt")]
    pub sent_at: DateTime<Utc>,
    pub sender_ip: String,
    pub sender_port: u16,
}

impl ChatBroadcast {
    pub fn sender_addr(&self) -> (&str, u16) {
        (&self.sender_ip, self.sender_port)
    }
}

/// Request for one page of history. Out-of-range values are corrected, not rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HistoryRequest {
    #[serde(default)]
    pub page: i64,
    #[serde(default)]
    pub page_size: i64,
}

impl HistoryRequest {
    pub const MAX_PAGE_SIZE: u32 = 100;

    pub fn new(page: i64, page_size: i64) -> Self {
        Self { page, page_size }
    }

    /// `(page, page_size)` corrected into the served range.
    pub fn clamped(&self) -> (u32, u32) {
        let page = self.page.clamp(1, i64::from(u32::MAX)) as u32;
        let page_size = self.page_size.clamp(1, i64::from(Self::MAX_PAGE_SIZE)) as u32;
        (page, page_size)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HistoryResponse {
    #[serde(alias = "TotalCount")]
    pub total_messages: u64,
    pub page: u32,
    pub page_size: u32,
    #[serde(default, serialize_with = "tagged_chat_messages")]
    pub messages: Vec<ChatBroadcast>,
}

/// Each history item is written as a complete `ChatMessage`, `Type` tag included.
fn tagged_chat_messages<S>(messages: &[ChatBroadcast], serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.collect_seq(messages.iter().map(|body| Envelope {
        kind: WireType::ChatMessage,
        body,
    }))
}

/// Every message exchanged between clients and the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    ChatSend(ChatSend),
    ChatBroadcast(ChatBroadcast),
    HistoryRequest(HistoryRequest),
    HistoryResponse(HistoryResponse),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::ChatSend(_) => MessageKind::ChatSend,
            Message::ChatBroadcast(_) => MessageKind::ChatBroadcast,
            Message::HistoryRequest(_) => MessageKind::HistoryRequest,
            Message::HistoryResponse(_) => MessageKind::HistoryResponse,
        }
    }

    pub fn chat(content: impl Into<String>) -> Self {
        Message::ChatSend(ChatSend {
            content: content.into(),
        })
    }
}

impl From<ChatSend> for Message {
    fn from(value: ChatSend) -> Self {
        Message::ChatSend(value)
    }
}

impl From<ChatBroadcast> for Message {
    fn from(value: ChatBroadcast) -> Self {
        Message::ChatBroadcast(value)
    }
}

impl From<HistoryRequest> for Message {
    fn from(value: HistoryRequest) -> Self {
        Message::HistoryRequest(value)
    }
}

impl From<HistoryResponse> for Message {
    fn from(value: HistoryResponse) -> Self {
        Message::HistoryResponse(value)
    }
}
