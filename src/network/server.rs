use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio_util::sync::CancellationToken;

use crate::storage::HistoryStore;

use super::dispatcher::Dispatcher;
use super::registry::Registry;
use super::session::ClientSession;

/// Pause before accepting again after running out of descriptors or memory.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("listener failed: {0}")]
    Accept(#[source] io::Error),
}

pub struct ChatServer {
    registry: Arc<Registry>,
    dispatcher: Arc<Dispatcher>,
}

impl ChatServer {
    /// Server with the default chat and history handlers.
    pub fn new(store: Arc<dyn HistoryStore>) -> Self {
        let registry = Arc::new(Registry::new());
        let dispatcher = Dispatcher::with_default_handlers(store, Arc::clone(&registry));
        Self::with_dispatcher(registry, dispatcher)
    }

    pub fn with_dispatcher(registry: Arc<Registry>, dispatcher: Dispatcher) -> Self {
        Self {
            registry,
            dispatcher: Arc::new(dispatcher),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Binds `addr` and serves until `shutdown` is cancelled or the listener fails.
    pub async fn start<A>(&self, addr: A, shutdown: CancellationToken) -> Result<(), ServerError>
    where
        A: ToSocketAddrs + ToString,
    {
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        self.run(listener, shutdown).await
    }

    /// Accept loop. Sessions that are still connected when this returns keep running.
    pub async fn run(
        &self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<(), ServerError> {
        match listener.local_addr() {
            Ok(addr) => log::info!("Chat server listening on {addr}"),
            Err(err) => log::warn!("Chat server listening on an unknown address: {err}"),
        }

        let result = loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    log::info!("Shutdown requested; no longer accepting connections");
                    break Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote_addr)) => {
                        self.spawn_session(stream, remote_addr);
                    }
                    Err(err) if is_resource_exhaustion(&err) => {
                        log::warn!("Failed to accept connection: {err}; backing off");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                    Err(err) if is_transient(&err) => {
                        log::warn!("Failed to accept connection: {err}");
                    }
                    Err(err) => {
                        log::error!("Listener failed: {err}");
                        break Err(ServerError::Accept(err));
                    }
                },
            }
        };

        drop(listener);
        log::info!(
            "Chat server stopped ({} session(s) still connected)",
            self.registry.len()
        );
        result
    }

    fn spawn_session(&self, stream: TcpStream, remote_addr: SocketAddr) -> Arc<ClientSession> {
        if let Err(err) = stream.set_nodelay(true) {
            log::debug!("Could not disable Nagle for {remote_addr}: {err}");
        }

        let (reader, writer) = stream.into_split();
        let session = Arc::new(ClientSession::new(remote_addr, writer));
        log::info!("Client connected: session {} from {remote_addr}", session.id());
        self.registry.add(Arc::clone(&session));

        tokio::spawn(Arc::clone(&session).run(
            reader,
            Arc::clone(&self.dispatcher),
            Arc::clone(&self.registry),
        ));
        session
    }
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    )
}

/// Out of descriptors, buffers or memory: the pending connection is lost but the
/// listener itself is fine once resources free up.
fn is_resource_exhaustion(err: &io::Error) -> bool {
    if err.kind() == io::ErrorKind::OutOfMemory {
        return true;
    }
    #[cfg(unix)]
    {
        matches!(
            err.raw_os_error(),
            Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM)
        )
    }
    #[cfg(not(unix))]
    {
        false
    }
}
