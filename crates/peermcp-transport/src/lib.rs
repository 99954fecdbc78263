//! Transports for peermcp.
//!
//! One abstraction each side: a [`ServerTransport`] accepts connections,
//! feeds inbound bytes to a [`ServerReceiver`], and delivers outbound
//! messages per session; a [`ClientTransport`] connects, sends bytes, and
//! feeds inbound bytes to a [`ClientReceiver`].
//!
//! Three transport families share the abstraction:
//! - [`stdio`]: newline-delimited JSON over a child process or stdin/stdout
//! - [`sse`]: `GET /sse` stream + POST message endpoint
//! - [`streamable_http`]: POST/GET/DELETE multiplexed on a single endpoint
//!
//! Message boundary for stream transports is a single `\n`; messages never
//! contain raw newlines.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use peermcp_core::{McpError, McpResult};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

mod codec;
mod event_stream;
pub mod mock;
mod pending;
pub mod sse;
pub mod stdio;
pub mod streamable_http;

pub use codec::Codec;
pub use event_stream::{EventStreamDecoder, SseEvent};
pub use pending::{PendingRequests, ResponseSlot};

/// The `Mcp-Session-Id` header used by the Streamable HTTP transport.
pub const SESSION_ID_HEADER: &str = "Mcp-Session-Id";

/// The `Last-Event-ID` header used to resume a Streamable HTTP GET stream.
pub const LAST_EVENT_ID_HEADER: &str = "Last-Event-ID";

/// Write-once slot through which the dispatcher hands a freshly minted
/// session id back to the transport that carried the `initialize` request.
#[derive(Debug, Default)]
pub struct SessionIdReturn(OnceLock<String>);

impl SessionIdReturn {
    /// Creates an empty slot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the minted session id. Later writes are ignored.
    pub fn set(&self, session_id: String) {
        let _ = self.0.set(session_id);
    }

    /// The minted session id, if any.
    #[must_use]
    pub fn get(&self) -> Option<&str> {
        self.0.get().map(String::as_str)
    }
}

/// Per-message context a transport hands to the server receiver.
#[derive(Debug, Clone, Default)]
pub struct ReceiveContext {
    /// Session the message arrived on; empty when the transport has none yet.
    pub session_id: String,
    /// Present when the transport wants `initialize` to mint a session.
    pub new_session: Option<Arc<SessionIdReturn>>,
    /// Stateless mode: the message is self-contained and session gating is
    /// skipped entirely.
    pub stateless: bool,
    /// Query-parameter values the transport was configured to copy through
    /// for downstream middleware.
    pub query: HashMap<String, String>,
}

impl ReceiveContext {
    /// Context for a message on a known session.
    #[must_use]
    pub fn for_session(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            ..Self::default()
        }
    }
}

/// Receiver for the reply to a dispatched request. The sender side closes
/// without a value when the dispatcher could not serialize a response.
pub type ReplyReceiver = oneshot::Receiver<Vec<u8>>;

/// Server-side message sink, implemented by the dispatcher.
#[async_trait]
pub trait ServerReceiver: Send + Sync {
    /// Handles one inbound message. Returns a reply channel when the message
    /// was a request, `None` for notifications and responses.
    async fn receive(&self, ctx: ReceiveContext, message: &[u8]) -> McpResult<Option<ReplyReceiver>>;
}

/// Client-side message sink, implemented by the dispatcher.
#[async_trait]
pub trait ClientReceiver: Send + Sync {
    /// Handles one inbound message.
    async fn receive(&self, message: &[u8]) -> McpResult<()>;

    /// Notifies the dispatcher that the connection failed; pending calls
    /// should be failed with a connection error.
    fn interrupt(&self, _error: McpError) {}
}

/// The slice of session management a transport needs: session creation on
/// connect, liveness checks for routing, and the per-session send queue.
#[async_trait]
pub trait SessionRegistry: Send + Sync {
    /// Mints a new session and returns its id.
    fn create_session(&self) -> String;

    /// True when the session exists and is not closed.
    fn is_active(&self, session_id: &str) -> bool;

    /// True when the session existed but has been closed.
    fn is_closed(&self, session_id: &str) -> bool;

    /// Appends a message to the session's bounded send queue, waiting for
    /// space. Fails with "session closed" once the session is closed.
    async fn enqueue(&self, session_id: &str, message: Vec<u8>) -> McpResult<()>;

    /// Takes the next message from the session's send queue. Fails with
    /// "send EOF" once the queue is drained and the session closed.
    async fn dequeue(&self, session_id: &str) -> McpResult<Vec<u8>>;

    /// Closes one session.
    fn close_session(&self, session_id: &str);

    /// Closes every session.
    fn close_all(&self);
}

/// Server side of a transport.
#[async_trait]
pub trait ServerTransport: Send + Sync {
    /// Runs the transport until shutdown.
    async fn run(&self) -> McpResult<()>;

    /// Delivers an outbound message to the given session.
    async fn send(&self, session_id: &str, message: Vec<u8>) -> McpResult<()>;

    /// Installs the inbound message sink. Must be called before `run`.
    fn set_receiver(&self, receiver: Arc<dyn ServerReceiver>);

    /// Installs the session registry. Must be called before `run`.
    fn set_session_registry(&self, registry: Arc<dyn SessionRegistry>);

    /// Stops accepting new work, waits for `drained` (cancelled once the
    /// server has no in-flight requests), then closes all sessions. Callers
    /// bound the wait with a timeout of their own.
    async fn shutdown(&self, drained: CancellationToken) -> McpResult<()>;
}

/// Client side of a transport.
#[async_trait]
pub trait ClientTransport: Send + Sync {
    /// Connects and starts the receive loop.
    async fn start(&self) -> McpResult<()>;

    /// Sends one message to the server.
    async fn send(&self, message: &[u8]) -> McpResult<()>;

    /// Installs the inbound message sink. Must be called before `start`.
    fn set_receiver(&self, receiver: Arc<dyn ClientReceiver>);

    /// Tears the connection down.
    async fn close(&self) -> McpResult<()>;
}

/// Interior cell for a receiver installed before the transport runs.
pub(crate) struct Cell<T: ?Sized>(parking_lot::RwLock<Option<Arc<T>>>);

impl<T: ?Sized> Cell<T> {
    pub(crate) fn empty() -> Self {
        Self(parking_lot::RwLock::new(None))
    }

    pub(crate) fn set(&self, value: Arc<T>) {
        *self.0.write() = Some(value);
    }

    pub(crate) fn get(&self) -> McpResult<Arc<T>> {
        self.0
            .read()
            .clone()
            .ok_or_else(|| McpError::internal("transport not wired: receiver or registry missing"))
    }
}
