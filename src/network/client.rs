use std::io;
use std::net::SocketAddr;

use thiserror::Error;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};

use crate::common::{self, DecodeError, HistoryRequest, Message};

use super::frame::{self, FrameError, ReadOutcome};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to connect: {0}")]
    Connect(#[source] io::Error),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("server sent an undecodable message: {0}")]
    Decode(#[from] DecodeError),
    #[error("failed to serialize message: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Client end of the chat protocol.
pub struct ChatClient {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
}

impl ChatClient {
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await.map_err(ClientError::Connect)?;
        stream.set_nodelay(true).map_err(ClientError::Connect)?;
        if let Ok(peer) = stream.peer_addr() {
            log::info!("Connected to chat server {peer}");
        }

        let (reader, writer) = stream.into_split();
        Ok(Self { reader, writer })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.writer.local_addr()
    }

    pub async fn send(&mut self, message: &Message) -> Result<(), ClientError> {
        let payload = common::serialize(message)?;
        frame::write_frame(&mut self.writer, payload.as_bytes()).await?;
        log::debug!("Sent {} ({} bytes)", message.kind(), payload.len());
        Ok(())
    }

    pub async fn send_chat(&mut self, content: impl Into<String>) -> Result<(), ClientError> {
        self.send(&Message::chat(content)).await
    }

    pub async fn request_history(&mut self, page: i64, page_size: i64) -> Result<(), ClientError> {
        self.send(&HistoryRequest::new(page, page_size).into()).await
    }

    /// Next message from the server, or `None` once it hangs up.
    ///
    /// Messages of a type this client does not know are skipped.
    pub async fn recv(&mut self) -> Result<Option<Message>, ClientError> {
        loop {
            let payload = match frame::read_frame(&mut self.reader).await? {
                ReadOutcome::Frame(payload) => payload,
                ReadOutcome::EndOfStream => return Ok(None),
            };

            match common::deserialize_from_server(&payload) {
                Ok(message) => return Ok(Some(message)),
                Err(err) if !err.is_fatal() => {
                    log::warn!("Skipping message from server: {err}");
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Shuts down the sending side and drops the connection.
    pub async fn close(mut self) -> Result<(), ClientError> {
        use tokio::io::AsyncWriteExt;

        self.writer.shutdown().await.map_err(FrameError::Io)?;
        Ok(())
    }
}
