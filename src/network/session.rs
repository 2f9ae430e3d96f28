use std::io;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use futures::FutureExt;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::common::{self, Message};

use super::dispatcher::Dispatcher;
use super::frame::{self, FrameError, ReadOutcome};
use super::registry::Registry;

pub type SessionId = Uuid;

/// A single write that takes longer than this is treated as a dead peer.
const SEND_TIMEOUT: Duration = Duration::from_secs(30);

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session is closed")]
    Closed,
    #[error("write timed out after {0:?}")]
    Timeout(Duration),
    #[error("write failed: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("failed to serialize message: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl SessionError {
    /// Whether the connection itself is unusable, as opposed to one bad message.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            SessionError::Closed | SessionError::Timeout(_) | SessionError::Io(_)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Reading,
    Closing,
    Closed,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Connected,
            1 => SessionState::Reading,
            2 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }
}

/// Why a session's read loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    PeerClosed,
    ProtocolError,
    MalformedPayload,
    HandlerFailed,
    TransportError,
    /// Closed from outside the read loop, e.g. after a failed broadcast.
    ClosedLocally,
}

/// Server-side state of one accepted connection.
///
/// The read half is owned by [`ClientSession::run`]; the write half lives behind an
/// async lock so direct replies and broadcast fan-out never interleave their bytes.
pub struct ClientSession {
    id: SessionId,
    remote_addr: SocketAddr,
    writer: Mutex<Option<BoxedWriter>>,
    state: AtomicU8,
    cancel: CancellationToken,
}

impl ClientSession {
    pub fn new<W>(remote_addr: SocketAddr, writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            id: Uuid::new_v4(),
            remote_addr,
            writer: Mutex::new(Some(Box::new(writer))),
            state: AtomicU8::new(SessionState::Connected as u8),
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Name stamped on chat messages sent from this session.
    pub fn display_name(&self) -> String {
        let id = self.id.simple().to_string();
        format!("User_{}", &id[..8])
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state(), SessionState::Closing | SessionState::Closed)
    }

    pub async fn send(&self, message: &Message) -> Result<(), SessionError> {
        let payload = common::serialize(message)?;
        let frame = frame::encode_frame(payload.as_bytes())?;
        self.send_frame(&frame).await
    }

    /// Writes an already encoded frame.
    pub async fn send_frame(&self, frame: &[u8]) -> Result<(), SessionError> {
        let mut writer = self.writer.lock().await;
        let Some(stream) = writer.as_mut() else {
            return Err(SessionError::Closed);
        };

        let write = async {
            stream.write_all(frame).await?;
            stream.flush().await
        };
        match tokio::time::timeout(SEND_TIMEOUT, write).await {
            Ok(result) => result?,
            Err(_) => return Err(SessionError::Timeout(SEND_TIMEOUT)),
        }

        log::debug!("Sent {} bytes to session {}", frame.len(), self.id);
        Ok(())
    }

    /// Stops the read loop and shuts the socket down.
    ///
    /// Returns `true` only for the call that actually performed the close, so racing
    /// callers can use it to deregister exactly once.
    pub async fn close(&self) -> bool {
        if !self.begin_close() {
            return false;
        }

        self.cancel.cancel();
        let stream = self.writer.lock().await.take();
        if let Some(mut stream) = stream {
            if let Err(err) = stream.shutdown().await {
                log::debug!("Shutdown of session {} socket failed: {err}", self.id);
            }
        }

        self.state.store(SessionState::Closed as u8, Ordering::Release);
        log::info!("Connection with session {} closed", self.id);
        true
    }

    fn begin_close(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current >= SessionState::Closing as u8 {
                return false;
            }
            match self.state.compare_exchange(
                current,
                SessionState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Drives the connection until it ends, then closes and deregisters it.
    pub async fn run<R>(
        self: Arc<Self>,
        mut reader: R,
        dispatcher: Arc<Dispatcher>,
        registry: Arc<Registry>,
    ) -> ExitReason
    where
        R: AsyncRead + Send + Unpin,
    {
        let _ = self.state.compare_exchange(
            SessionState::Connected as u8,
            SessionState::Reading as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );

        let reason = self.read_loop(&mut reader, &dispatcher).await;
        drop(reader);

        log::info!(
            "Session {} ({}) finished: {reason:?}",
            self.id,
            self.remote_addr
        );
        registry.disconnect(&self).await;
        reason
    }

    async fn read_loop<R>(&self, reader: &mut R, dispatcher: &Dispatcher) -> ExitReason
    where
        R: AsyncRead + Send + Unpin,
    {
        loop {
            let outcome = tokio::select! {
                _ = self.cancel.cancelled() => return ExitReason::ClosedLocally,
                outcome = frame::read_frame(&mut *reader) => outcome,
            };

            let payload = match outcome {
                Ok(ReadOutcome::Frame(payload)) => payload,
                Ok(ReadOutcome::EndOfStream) => return ExitReason::PeerClosed,
                Err(FrameError::Io(err)) => {
                    log::info!("Connection error on session {}: {err}", self.id);
                    return ExitReason::TransportError;
                }
                Err(err) => {
                    log::warn!("Protocol violation from session {}: {err}", self.id);
                    return ExitReason::ProtocolError;
                }
            };

            let message = match common::deserialize(&payload) {
                Ok(message) => message,
                Err(err) if !err.is_fatal() => {
                    log::warn!("Ignoring message from session {}: {err}", self.id);
                    continue;
                }
                Err(err) => {
                    log::error!("Undecodable message from session {}: {err}", self.id);
                    return ExitReason::MalformedPayload;
                }
            };

            let kind = message.kind();
            log::debug!("Session {} received {kind}", self.id);

            match AssertUnwindSafe(dispatcher.dispatch(message, self))
                .catch_unwind()
                .await
            {
                Ok(Ok(())) => {}
                Ok(Err(err)) if err.is_fatal() => {
                    log::error!("Handling {kind} for session {} failed: {err}", self.id);
                    return ExitReason::HandlerFailed;
                }
                Ok(Err(err)) => {
                    log::error!("Handling {kind} for session {} failed: {err}", self.id);
                }
                Err(_) => {
                    log::error!("Handler for {kind} panicked on session {}", self.id);
                    return ExitReason::HandlerFailed;
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::io::Cursor;
    use std::pin::Pin;
    use std::sync::Mutex as StdMutex;
    use std::task::{Context, Poll};

    use async_trait::async_trait;
    use tokio::io::{DuplexStream, duplex};

    use super::*;
    use crate::common::{MessageKind, serialize};
    use crate::network::dispatcher::{HandlerError, MessageHandler};
    use crate::network::frame::{encode_frame, read_frame};

    pub(crate) fn test_addr() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    /// A session whose socket is one end of an in-memory pipe; the other end is returned.
    pub(crate) fn piped_session() -> (Arc<ClientSession>, DuplexStream) {
        let (peer, local) = duplex(1 << 20);
        (Arc::new(ClientSession::new(test_addr(), local)), peer)
    }

    pub(crate) async fn next_message(peer: &mut DuplexStream) -> Message {
        match read_frame(peer).await.unwrap() {
            ReadOutcome::Frame(payload) => common::deserialize_from_server(&payload).unwrap(),
            ReadOutcome::EndOfStream => panic!("stream ended before a message arrived"),
        }
    }

    /// Writer whose peer has gone away.
    pub(crate) struct BrokenPipe;

    impl AsyncWrite for BrokenPipe {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer gone")))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[derive(Default)]
    struct Recorder {
        contents: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl MessageHandler for Arc<Recorder> {
        async fn handle(
            &self,
            message: Message,
            _session: &ClientSession,
        ) -> Result<(), HandlerError> {
            if let Message::ChatSend(chat) = message {
                self.contents.lock().unwrap().push(chat.content);
            }
            Ok(())
        }
    }

    struct Panicking;

    #[async_trait]
    impl MessageHandler for Panicking {
        async fn handle(&self, _: Message, _: &ClientSession) -> Result<(), HandlerError> {
            panic!("handler bug");
        }
    }

    fn recording_dispatcher() -> (Arc<Dispatcher>, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let mut dispatcher = Dispatcher::new();
        dispatcher.register(MessageKind::ChatSend, Arc::clone(&recorder));
        (Arc::new(dispatcher), recorder)
    }

    fn frames(payloads: &[&[u8]]) -> Cursor<Vec<u8>> {
        let mut bytes = Vec::new();
        for payload in payloads {
            bytes.extend(encode_frame(payload).unwrap());
        }
        Cursor::new(bytes)
    }

    fn chat_json(content: &str) -> Vec<u8> {
        serialize(&Message::chat(content)).unwrap().into_bytes()
    }

    #[tokio::test]
    async fn dispatches_frames_in_arrival_order_then_deregisters() {
        let (session, _peer) = piped_session();
        let registry = Arc::new(Registry::new());
        registry.add(Arc::clone(&session));
        let (dispatcher, recorder) = recording_dispatcher();

        let input = frames(&[&chat_json("a"), &chat_json("b"), &chat_json("c")]);
        let reason = Arc::clone(&session)
            .run(input, dispatcher, Arc::clone(&registry))
            .await;

        assert_eq!(reason, ExitReason::PeerClosed);
        assert_eq!(*recorder.contents.lock().unwrap(), ["a", "b", "c"]);
        assert!(registry.is_empty());
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn invalid_length_ends_the_session_without_dispatch() {
        for prefix in [0i32, -5, frame::MAX_MESSAGE_BYTES as i32 + 1] {
            let (session, _peer) = piped_session();
            let registry = Arc::new(Registry::new());
            registry.add(Arc::clone(&session));
            let (dispatcher, recorder) = recording_dispatcher();

            let mut bytes = prefix.to_le_bytes().to_vec();
            bytes.extend(chat_json("never"));
            let reason = session
                .run(Cursor::new(bytes), dispatcher, Arc::clone(&registry))
                .await;

            assert_eq!(reason, ExitReason::ProtocolError);
            assert!(recorder.contents.lock().unwrap().is_empty());
            assert!(registry.is_empty());
        }
    }

    #[tokio::test]
    async fn malformed_json_is_fatal_but_unknown_type_is_skipped() {
        let (session, _peer) = piped_session();
        let registry = Arc::new(Registry::new());
        let (dispatcher, recorder) = recording_dispatcher();

        let input = frames(&[
            br#"{"Type":"Typing"}"#,
            &chat_json("kept"),
            b"{not json",
            &chat_json("dropped"),
        ]);
        let reason = session.run(input, dispatcher, registry).await;

        assert_eq!(reason, ExitReason::MalformedPayload);
        assert_eq!(*recorder.contents.lock().unwrap(), ["kept"]);
    }

    #[tokio::test]
    async fn client_chat_with_extra_fields_reaches_the_chat_handler() {
        let (session, _peer) = piped_session();
        let (dispatcher, recorder) = recording_dispatcher();

        let input = frames(&[
            br#"{"Type":"ChatMessage","Content":"numbered","Id":7}"#,
            br#"{"type":"ChatMessage","content":"camel"}"#,
        ]);
        let reason = session
            .run(input, dispatcher, Arc::new(Registry::new()))
            .await;

        assert_eq!(reason, ExitReason::PeerClosed);
        assert_eq!(*recorder.contents.lock().unwrap(), ["numbered", "camel"]);
    }

    #[tokio::test]
    async fn kinds_without_a_handler_do_not_end_the_session() {
        let (session, _peer) = piped_session();
        let (dispatcher, recorder) = recording_dispatcher();
        let history = serialize(&Message::HistoryRequest(crate::common::HistoryRequest::new(1, 1)))
            .unwrap()
            .into_bytes();

        let input = frames(&[&history, &chat_json("after")]);
        let reason = session
            .run(input, dispatcher, Arc::new(Registry::new()))
            .await;

        assert_eq!(reason, ExitReason::PeerClosed);
        assert_eq!(*recorder.contents.lock().unwrap(), ["after"]);
    }

    #[tokio::test]
    async fn panicking_handler_still_tears_the_session_down() {
        let (session, _peer) = piped_session();
        let registry = Arc::new(Registry::new());
        registry.add(Arc::clone(&session));
        let mut dispatcher = Dispatcher::new();
        dispatcher.register(MessageKind::ChatSend, Panicking);

        let reason = Arc::clone(&session)
            .run(frames(&[&chat_json("boom")]), Arc::new(dispatcher), Arc::clone(&registry))
            .await;

        assert_eq!(reason, ExitReason::HandlerFailed);
        assert!(registry.is_empty());
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn closing_elsewhere_stops_a_blocked_read_loop() {
        let (session, _peer) = piped_session();
        let registry = Arc::new(Registry::new());
        registry.add(Arc::clone(&session));
        // Keep the inbound pipe open so the loop blocks on a read.
        let (_client_side, inbound) = duplex(64);

        let task = tokio::spawn(Arc::clone(&session).run(
            inbound,
            Arc::new(Dispatcher::new()),
            Arc::clone(&registry),
        ));
        tokio::task::yield_now().await;

        assert!(registry.disconnect(&session).await);
        let reason = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("read loop should stop")
            .unwrap();

        assert_eq!(reason, ExitReason::ClosedLocally);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn concurrent_sends_never_interleave() {
        let (session, mut peer) = piped_session();
        let big = "x".repeat(16 * 1024);

        let mut writers = Vec::new();
        for writer in 0..4 {
            let session = Arc::clone(&session);
            let big = big.clone();
            writers.push(tokio::spawn(async move {
                for n in 0..25 {
                    let content = format!("{writer}:{n}:{big}");
                    session.send(&Message::chat(content)).await.unwrap();
                }
            }));
        }

        for _ in 0..100 {
            match next_message(&mut peer).await {
                Message::ChatSend(chat) => assert!(chat.content.ends_with(&big)),
                other => panic!("unexpected {other:?}"),
            }
        }
        for writer in writers {
            writer.await.unwrap();
        }
    }

    #[tokio::test]
    async fn send_after_close_reports_closed() {
        let (session, _peer) = piped_session();
        assert!(session.close().await);
        assert!(!session.close().await);

        let err = session.send(&Message::chat("late")).await.unwrap_err();
        assert!(matches!(err, SessionError::Closed));
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn display_name_uses_id_prefix() {
        let (session, _peer) = piped_session();
        let name = session.display_name();
        assert_eq!(name.len(), "User_".len() + 8);
        assert!(session.id().simple().to_string().starts_with(&name[5..]));
    }

    #[tokio::test]
    async fn failing_writer_surfaces_io_error() {
        let session = ClientSession::new(test_addr(), BrokenPipe);
        let err = session.send(&Message::chat("x")).await.unwrap_err();
        assert!(matches!(err, SessionError::Io(_)));
    }
}
