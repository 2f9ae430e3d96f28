use chrono::DateTime;
use uuid::Uuid;

use crate::common::ChatBroadcast;

use super::StorageError;

/// A stored chat message together with its insertion sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryRecord {
    pub seq: i64,
    pub message: ChatBroadcast,
}

impl HistoryRecord {
    pub fn into_broadcast(self) -> ChatBroadcast {
        self.message
    }
}

/// Raw `messages` row, before its columns are checked.
#[derive(Debug, Clone)]
pub(crate) struct MessageRow {
    pub seq: i64,
    pub id: String,
    pub sender: String,
    pub content: String,
    pub sent_at: i64,
    pub sender_ip: String,
    pub sender_port: i64,
}

impl TryFrom<MessageRow> for HistoryRecord {
    type Error = StorageError;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        let corrupt = |reason: String| StorageError::Corrupt {
            seq: row.seq,
            reason,
        };

        let id = Uuid::parse_str(&row.id).map_err(|err| corrupt(format!("bad id: {err}")))?;
        let sent_at = DateTime::from_timestamp_millis(row.sent_at)
            .ok_or_else(|| corrupt(format!("timestamp {} out of range", row.sent_at)))?;
        let sender_port = u16::try_from(row.sender_port)
            .map_err(|_| corrupt(format!("port {} out of range", row.sender_port)))?;

        Ok(HistoryRecord {
            seq: row.seq,
            message: ChatBroadcast {
                id,
                sender: row.sender,
                content: row.content,
                sent_at,
                sender_ip: row.sender_ip,
                sender_port,
            },
        })
    }
}
