use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::common::{Message, MessageKind};
use crate::storage::{HistoryStore, StorageError};

use super::handlers::{ChatMessageHandler, HistoryRequestHandler};
use super::registry::Registry;
use super::session::{ClientSession, SessionError};

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),
    #[error("failed to reply: {0}")]
    Reply(#[source] SessionError),
    #[error("failed to broadcast: {0}")]
    Broadcast(#[source] SessionError),
    #[error("handler for {expected} received {actual}")]
    UnexpectedKind {
        expected: MessageKind,
        actual: MessageKind,
    },
}

impl HandlerError {
    /// A reply that could not be written means the requester's connection is gone.
    pub fn is_fatal(&self) -> bool {
        matches!(self, HandlerError::Reply(err) if err.is_transport())
    }
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: Message, session: &ClientSession) -> Result<(), HandlerError>;
}

/// Routing table from message kind to handler.
#[derive(Default)]
pub struct Dispatcher {
    handlers: HashMap<MessageKind, Arc<dyn MessageHandler>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Chat and history handlers backed by `store`, broadcasting through `registry`.
    pub fn with_default_handlers(store: Arc<dyn HistoryStore>, registry: Arc<Registry>) -> Self {
        let mut dispatcher = Self::new();
        dispatcher.register(
            MessageKind::ChatSend,
            ChatMessageHandler::new(Arc::clone(&store), registry),
        );
        dispatcher.register(MessageKind::HistoryRequest, HistoryRequestHandler::new(store));
        dispatcher
    }

    /// Registers `handler` for `kind`, replacing any previous one.
    pub fn register<H>(&mut self, kind: MessageKind, handler: H)
    where
        H: MessageHandler + 'static,
    {
        if self.handlers.insert(kind, Arc::new(handler)).is_some() {
            log::debug!("Replaced handler for {kind}");
        }
    }

    pub fn handles(&self, kind: MessageKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    pub async fn dispatch(
        &self,
        message: Message,
        session: &ClientSession,
    ) -> Result<(), HandlerError> {
        let kind = message.kind();
        let Some(handler) = self.handlers.get(&kind) else {
            log::warn!(
                "No handler for {kind} from session {}; ignoring",
                session.id()
            );
            return Ok(());
        };
        handler.handle(message, session).await
    }
}
