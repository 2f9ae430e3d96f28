pub mod client;
pub mod dispatcher;
pub mod frame;
pub mod handlers;
pub mod registry;
pub mod server;
pub mod session;

pub use client::{ChatClient, ClientError};
pub use dispatcher::{Dispatcher, HandlerError, MessageHandler};
pub use frame::{FrameError, MAX_MESSAGE_BYTES, ReadOutcome};
pub use handlers::{ChatMessageHandler, HistoryRequestHandler};
pub use registry::{BroadcastReport, Registry};
pub use server::{ChatServer, ServerError};
pub use session::{ClientSession, ExitReason, SessionError, SessionId, SessionState};
