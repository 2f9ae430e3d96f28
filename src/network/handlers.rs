use std::sync::Arc;

use async_trait::async_trait;
use chrono::{SubsecRound, Utc};
use uuid::Uuid;

use crate::common::{ChatBroadcast, HistoryResponse, Message, MessageKind};
use crate::storage::{HistoryRecord, HistoryStore};

use super::dispatcher::{HandlerError, MessageHandler};
use super::registry::Registry;
use super::session::ClientSession;

fn unexpected(expected: MessageKind, message: &Message) -> HandlerError {
    HandlerError::UnexpectedKind {
        expected,
        actual: message.kind(),
    }
}

/// Stamps, persists and fans out chat messages.
pub struct ChatMessageHandler {
    store: Arc<dyn HistoryStore>,
    registry: Arc<Registry>,
}

impl ChatMessageHandler {
    pub fn new(store: Arc<dyn HistoryStore>, registry: Arc<Registry>) -> Self {
        Self { store, registry }
    }
}

#[async_trait]
impl MessageHandler for ChatMessageHandler {
    async fn handle(&self, message: Message, session: &ClientSession) -> Result<(), HandlerError> {
        let chat = match message {
            Message::ChatSend(chat) => chat,
            other => return Err(unexpected(MessageKind::ChatSend, &other)),
        };

        let remote = session.remote_addr();
        let broadcast = ChatBroadcast {
            id: Uuid::new_v4(),
            sender: session.display_name(),
            content: chat.content,
            // Millisecond precision so what is stored matches what is sent.
            sent_at: Utc::now().trunc_subsecs(3),
            sender_ip: remote.ip().to_string(),
            sender_port: remote.port(),
        };
        let message_id = broadcast.id;
        log::info!(
            "Chat message {message_id} from session {} ({} bytes)",
            session.id(),
            broadcast.content.len()
        );

        self.store.save_message(&broadcast).await?;
        log::debug!("Message {message_id} saved");

        let report = self
            .registry
            .broadcast(&Message::ChatBroadcast(broadcast), Some(session.id()))
            .await
            .map_err(HandlerError::Broadcast)?;
        log::debug!(
            "Message {message_id} delivered to {} session(s), {} failed",
            report.delivered,
            report.failed
        );
        Ok(())
    }
}

/// Serves one page of history back to the requesting session.
pub struct HistoryRequestHandler {
    store: Arc<dyn HistoryStore>,
}

impl HistoryRequestHandler {
    pub fn new(store: Arc<dyn HistoryStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl MessageHandler for HistoryRequestHandler {
    async fn handle(&self, message: Message, session: &ClientSession) -> Result<(), HandlerError> {
        let request = match message {
            Message::HistoryRequest(request) => request,
            other => return Err(unexpected(MessageKind::HistoryRequest, &other)),
        };

        let (page, page_size) = request.clamped();
        log::info!(
            "History request from session {}: page {page}, size {page_size} (asked {}/{})",
            session.id(),
            request.page,
            request.page_size
        );

        let records = self.store.get_messages(page, page_size).await?;
        let total_messages = self.store.count_messages().await?;
        let response = HistoryResponse {
            total_messages,
            page,
            page_size,
            messages: records.into_iter().map(HistoryRecord::into_broadcast).collect(),
        };

        session
            .send(&Message::HistoryResponse(response))
            .await
            .map_err(HandlerError::Reply)?;
        log::debug!("History page {page} sent to session {}", session.id());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::{TimeZone, Utc};
    use tokio::io::AsyncReadExt;

    use super::*;
    use crate::common::HistoryRequest;
    use crate::network::dispatcher::Dispatcher;
    use crate::network::session::tests::{next_message, piped_session};
    use crate::storage::{SqliteHistoryStore, StorageError};

    struct UnavailableStore;

    #[async_trait]
    impl HistoryStore for UnavailableStore {
        async fn save_message(&self, _message: &ChatBroadcast) -> Result<i64, StorageError> {
            Err(StorageError::Poisoned)
        }

        async fn get_messages(
            &self,
            _page: u32,
            _page_size: u32,
        ) -> Result<Vec<HistoryRecord>, StorageError> {
            Err(StorageError::Poisoned)
        }

        async fn count_messages(&self) -> Result<u64, StorageError> {
            Err(StorageError::Poisoned)
        }
    }

    fn stored(content: &str, second: u32) -> ChatBroadcast {
        ChatBroadcast {
            id: Uuid::new_v4(),
            sender: "User_00000000".to_string(),
            content: content.to_string(),
            sent_at: Utc.with_ymd_and_hms(2024, 11, 7, 12, 0, second).unwrap(),
            sender_ip: "127.0.0.1".to_string(),
            sender_port: 4000,
        }
    }

    #[tokio::test]
    async fn chat_is_persisted_and_sent_to_everyone_but_the_sender() {
        let store = SqliteHistoryStore::in_memory().unwrap();
        let registry = Arc::new(Registry::new());
        let dispatcher =
            Dispatcher::with_default_handlers(Arc::new(store.clone()), Arc::clone(&registry));

        let (sender, mut sender_peer) = piped_session();
        let (first, mut first_peer) = piped_session();
        let (second, mut second_peer) = piped_session();
        for session in [&sender, &first, &second] {
            registry.add(Arc::clone(session));
        }

        dispatcher.dispatch(Message::chat("hi"), &sender).await.unwrap();

        let mut delivered = Vec::new();
        for peer in [&mut first_peer, &mut second_peer] {
            match next_message(peer).await {
                Message::ChatBroadcast(broadcast) => delivered.push(broadcast),
                other => panic!("expected a broadcast, got {other:?}"),
            }
        }
        assert_eq!(delivered[0], delivered[1]);
        assert_eq!(delivered[0].content, "hi");
        assert_eq!(delivered[0].sender, sender.display_name());
        assert_eq!(delivered[0].sender_addr(), ("127.0.0.1", 40000));

        let mut buf = [0u8; 1];
        let echoed = tokio::time::timeout(Duration::from_millis(50), sender_peer.read(&mut buf)).await;
        assert!(echoed.is_err(), "sender must not receive its own message");

        let history = store.get_messages(1, 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].message, delivered[0]);
    }

    #[tokio::test]
    async fn storage_failure_skips_the_broadcast_and_is_not_fatal() {
        let registry = Arc::new(Registry::new());
        let dispatcher =
            Dispatcher::with_default_handlers(Arc::new(UnavailableStore), Arc::clone(&registry));
        let (sender, _sender_peer) = piped_session();
        let (other, mut other_peer) = piped_session();
        registry.add(Arc::clone(&sender));
        registry.add(Arc::clone(&other));

        let err = dispatcher
            .dispatch(Message::chat("lost"), &sender)
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Storage(_)));
        assert!(!err.is_fatal());

        let mut buf = [0u8; 1];
        let received = tokio::time::timeout(Duration::from_millis(50), other_peer.read(&mut buf)).await;
        assert!(received.is_err());
    }

    #[tokio::test]
    async fn history_page_is_clamped_and_sent_only_to_the_requester() {
        let store = SqliteHistoryStore::in_memory().unwrap();
        for second in 0..3 {
            store
                .save_message(&stored(&format!("m{second}"), second))
                .await
                .unwrap();
        }
        let registry = Arc::new(Registry::new());
        let dispatcher =
            Dispatcher::with_default_handlers(Arc::new(store), Arc::clone(&registry));
        let (requester, mut requester_peer) = piped_session();

        dispatcher
            .dispatch(HistoryRequest::new(0, 500).into(), &requester)
            .await
            .unwrap();
        let Message::HistoryResponse(response) = next_message(&mut requester_peer).await else {
            panic!("expected a history response");
        };
        assert_eq!((response.page, response.page_size), (1, 100));
        assert_eq!(response.total_messages, 3);
        let contents: Vec<_> = response.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, ["m2", "m1", "m0"]);

        dispatcher
            .dispatch(HistoryRequest::new(-5, 0).into(), &requester)
            .await
            .unwrap();
        let Message::HistoryResponse(response) = next_message(&mut requester_peer).await else {
            panic!("expected a history response");
        };
        assert_eq!((response.page, response.page_size), (1, 1));
        assert_eq!(response.messages.len(), 1);
        assert_eq!(response.messages[0].content, "m2");
    }

    #[tokio::test]
    async fn reply_to_a_closed_session_is_fatal() {
        let store = SqliteHistoryStore::in_memory().unwrap();
        let handler = HistoryRequestHandler::new(Arc::new(store));
        let (requester, _peer) = piped_session();
        requester.close().await;

        let err = handler
            .handle(HistoryRequest::new(1, 10).into(), &requester)
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn handlers_reject_the_wrong_kind() {
        let store: Arc<dyn HistoryStore> = Arc::new(SqliteHistoryStore::in_memory().unwrap());
        let handler = HistoryRequestHandler::new(store);
        let (session, _peer) = piped_session();

        let err = handler
            .handle(Message::chat("not a request"), &session)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            HandlerError::UnexpectedKind {
                expected: MessageKind::HistoryRequest,
                actual: MessageKind::ChatSend,
            }
        ));
    }
}
