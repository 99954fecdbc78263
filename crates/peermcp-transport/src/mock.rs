//! In-process transport pair for engine tests.
//!
//! Two channel-backed transports wired back to back: what the client sends
//! the server receives on one implicit session, and vice versa.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use peermcp_core::logging::{error, targets};
use peermcp_core::{McpError, McpResult};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::{
    Cell, ClientReceiver, ClientTransport, ReceiveContext, ServerReceiver, ServerTransport,
    SessionRegistry,
};

const CHANNEL_CAPACITY: usize = 64;

/// Creates a connected mock transport pair.
#[must_use]
pub fn mock_transport_pair() -> (MockServerTransport, MockClientTransport) {
    let (client_tx, client_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (server_tx, server_rx) = mpsc::channel(CHANNEL_CAPACITY);
    (
        MockServerTransport {
            out: server_tx,
            input: Mutex::new(Some(client_rx)),
            receiver: Cell::empty(),
            registry: Cell::empty(),
            session_id: Arc::new(OnceLock::new()),
            cancel: CancellationToken::new(),
        },
        MockClientTransport {
            out: client_tx,
            input: Mutex::new(Some(server_rx)),
            receiver: Cell::empty(),
            cancel: CancellationToken::new(),
        },
    )
}

/// Server half of the mock pair.
pub struct MockServerTransport {
    out: mpsc::Sender<Vec<u8>>,
    input: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    receiver: Cell<dyn ServerReceiver>,
    registry: Cell<dyn SessionRegistry>,
    session_id: Arc<OnceLock<String>>,
    cancel: CancellationToken,
}

impl MockServerTransport {
    /// The implicit session id, available once `run` has started.
    #[must_use]
    pub fn session_id(&self) -> Option<String> {
        self.session_id.get().cloned()
    }
}

#[async_trait]
impl ServerTransport for MockServerTransport {
    async fn run(&self) -> McpResult<()> {
        let receiver = self.receiver.get()?;
        let registry = self.registry.get()?;

        let session_id = self
            .session_id
            .get_or_init(|| registry.create_session())
            .clone();

        let mut input = self
            .input
            .lock()
            .await
            .take()
            .ok_or_else(|| McpError::internal("mock transport already running"))?;

        loop {
            let message = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                message = input.recv() => message,
            };
            let Some(message) = message else {
                return Ok(()); // peer hung up
            };

            let ctx = ReceiveContext::for_session(session_id.clone());
            match receiver.receive(ctx, &message).await {
                Ok(Some(reply)) => {
                    let out = self.out.clone();
                    tokio::spawn(async move {
                        if let Ok(bytes) = reply.await {
                            let _ = out.send(bytes).await;
                        }
                    });
                }
                Ok(None) => {}
                Err(err) => {
                    error!(target: targets::TRANSPORT, "receiver failed: {err}");
                }
            }
        }
    }

    async fn send(&self, _session_id: &str, message: Vec<u8>) -> McpResult<()> {
        self.out
            .send(message)
            .await
            .map_err(|_| McpError::session_closed())
    }

    fn set_receiver(&self, receiver: Arc<dyn ServerReceiver>) {
        self.receiver.set(receiver);
    }

    fn set_session_registry(&self, registry: Arc<dyn SessionRegistry>) {
        self.registry.set(registry);
    }

    async fn shutdown(&self, drained: CancellationToken) -> McpResult<()> {
        self.cancel.cancel();
        drained.cancelled().await;
        self.registry.get()?.close_all();
        Ok(())
    }
}

/// Client half of the mock pair.
pub struct MockClientTransport {
    out: mpsc::Sender<Vec<u8>>,
    input: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    receiver: Cell<dyn ClientReceiver>,
    cancel: CancellationToken,
}

#[async_trait]
impl ClientTransport for MockClientTransport {
    async fn start(&self) -> McpResult<()> {
        let receiver = self.receiver.get()?;
        let mut input = self
            .input
            .lock()
            .await
            .take()
            .ok_or_else(|| McpError::internal("mock transport already started"))?;

        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = cancel.cancelled() => return,
                    message = input.recv() => message,
                };
                let Some(message) = message else {
                    receiver.interrupt(McpError::connection("mock stream closed"));
                    return;
                };
                if let Err(err) = receiver.receive(&message).await {
                    error!(target: targets::TRANSPORT, "receiver failed: {err}");
                }
            }
        });
        Ok(())
    }

    async fn send(&self, message: &[u8]) -> McpResult<()> {
        self.out
            .send(message.to_vec())
            .await
            .map_err(|_| McpError::session_closed())
    }

    fn set_receiver(&self, receiver: Arc<dyn ClientReceiver>) {
        self.receiver.set(receiver);
    }

    async fn close(&self) -> McpResult<()> {
        self.cancel.cancel();
        Ok(())
    }
}
