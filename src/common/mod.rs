pub mod message;
pub mod types;

pub use message::{
    DecodeError, Origin, decode, deserialize, deserialize_from_server, serialize,
};
pub use types::{
    ChatBroadcast, ChatSend, HistoryRequest, HistoryResponse, Message, MessageKind, WireType,
};
