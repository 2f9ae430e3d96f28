use std::sync::Arc;

use dashmap::DashMap;
use futures::future::join_all;

use crate::common::{self, Message};

use super::frame;
use super::session::{ClientSession, SessionError, SessionId};

/// Outcome of one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Live sessions, keyed by session id.
#[derive(Default)]
pub struct Registry {
    sessions: DashMap<SessionId, Arc<ClientSession>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, session: Arc<ClientSession>) {
        let id = session.id();
        if self.sessions.insert(id, session).is_some() {
            log::warn!("Session {id} was already registered; replaced");
        } else {
            log::info!("Session {id} registered ({} live)", self.sessions.len());
        }
    }

    pub fn remove(&self, id: SessionId) -> Option<Arc<ClientSession>> {
        let removed = self.sessions.remove(&id).map(|(_, session)| session);
        if removed.is_some() {
            log::info!("Session {id} removed ({} live)", self.sessions.len());
        }
        removed
    }

    pub fn get(&self, id: SessionId) -> Option<Arc<ClientSession>> {
        self.sessions.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.sessions.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn snapshot(&self) -> Vec<Arc<ClientSession>> {
        self.sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Closes `session` and drops it from the registry.
    ///
    /// Safe to race: only the caller that actually closed the session removes it, and
    /// only that caller gets `true`.
    pub async fn disconnect(&self, session: &ClientSession) -> bool {
        if !session.close().await {
            return false;
        }
        self.remove(session.id());
        true
    }

    /// Sends `message` to every registered session except `exclude`.
    ///
    /// Deliveries run concurrently. A recipient whose write fails is disconnected
    /// without affecting the others.
    pub async fn broadcast(
        &self,
        message: &Message,
        exclude: Option<SessionId>,
    ) -> Result<BroadcastReport, SessionError> {
        let payload = common::serialize(message)?;
        let frame = frame::encode_frame(payload.as_bytes())?;

        let recipients: Vec<_> = self
            .snapshot()
            .into_iter()
            .filter(|session| Some(session.id()) != exclude)
            .collect();

        let deliveries = recipients.iter().map(|session| {
            let frame = frame.as_slice();
            async move {
                match session.send_frame(frame).await {
                    Ok(()) => true,
                    Err(err) => {
                        log::warn!(
                            "Delivery to session {} failed: {err}; disconnecting",
                            session.id()
                        );
                        self.disconnect(session).await;
                        false
                    }
                }
            }
        });
        let outcomes = join_all(deliveries).await;

        let delivered = outcomes.iter().filter(|ok| **ok).count();
        let report = BroadcastReport {
            delivered,
            failed: outcomes.len() - delivered,
        };
        log::debug!(
            "Broadcast {} to {} of {} recipient(s)",
            message.kind(),
            report.delivered,
            outcomes.len()
        );
        Ok(report)
    }
}
