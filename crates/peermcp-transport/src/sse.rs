//! SSE transport: a long-lived `GET /sse` stream for server-to-client
//! messages plus a POST message endpoint for client-to-server messages.
//!
//! On SSE connect the server mints a session and emits one initial
//! `event: endpoint` carrying the message-endpoint URL with the session id
//! as a query parameter. Every subsequent dequeued session message is
//! emitted as a `data:` event. Request replies travel over the same stream;
//! the POST endpoint acknowledges with `202 Accepted`.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use futures::StreamExt;
use parking_lot::RwLock;
use peermcp_core::logging::{debug, error, targets, warn};
use peermcp_core::{ErrorCode, McpError, McpResult};
use reqwest::Url;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::{
    Cell, ClientReceiver, ClientTransport, EventStreamDecoder, ReceiveContext, ServerReceiver,
    ServerTransport, SessionRegistry, SseEvent,
};

/// Query parameter carrying the session id on the message endpoint.
const SESSION_ID_PARAM: &str = "sessionId";

struct SseInner {
    addr: String,
    sse_path: String,
    message_path: String,
    copy_query_keys: Vec<String>,
    receiver: Cell<dyn ServerReceiver>,
    registry: Cell<dyn SessionRegistry>,
    cancel: CancellationToken,
}

/// Server side of the SSE transport.
pub struct SseServerTransport {
    inner: Arc<SseInner>,
}

impl SseServerTransport {
    /// Creates a transport that will bind `addr` (e.g. `127.0.0.1:8080`).
    #[must_use]
    pub fn bind(addr: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(SseInner {
                addr: addr.into(),
                sse_path: "/sse".to_string(),
                message_path: "/message".to_string(),
                copy_query_keys: Vec::new(),
                receiver: Cell::empty(),
                registry: Cell::empty(),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Overrides the message-endpoint path (default `/message`).
    #[must_use]
    pub fn with_message_endpoint(self, path: impl Into<String>) -> Self {
        let path = path.into();
        self.with_inner(|inner| inner.message_path = path)
    }

    /// Query-parameter names to copy into each POST's receive context for
    /// downstream middleware.
    #[must_use]
    pub fn with_copy_query_keys(self, keys: Vec<String>) -> Self {
        self.with_inner(|inner| inner.copy_query_keys = keys)
    }

    fn with_inner(mut self, f: impl FnOnce(&mut SseInner)) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            f(inner);
        }
        self
    }
}

#[async_trait]
impl ServerTransport for SseServerTransport {
    async fn run(&self) -> McpResult<()> {
        let inner = self.inner.clone();
        let app = Router::new()
            .route(&inner.sse_path, get(handle_sse))
            .route(&inner.message_path, post(handle_message))
            .with_state(inner.clone());

        let listener = tokio::net::TcpListener::bind(&inner.addr)
            .await
            .map_err(|e| McpError::connection(format!("bind {}: {e}", inner.addr)))?;

        debug!(target: targets::TRANSPORT, "sse transport listening on {}", inner.addr);
        axum::serve(listener, app)
            .with_graceful_shutdown(inner.cancel.clone().cancelled_owned())
            .await
            .map_err(|e| McpError::connection(format!("sse server: {e}")))
    }

    async fn send(&self, session_id: &str, message: Vec<u8>) -> McpResult<()> {
        self.inner.registry.get()?.enqueue(session_id, message).await
    }

    fn set_receiver(&self, receiver: Arc<dyn ServerReceiver>) {
        self.inner.receiver.set(receiver);
    }

    fn set_session_registry(&self, registry: Arc<dyn SessionRegistry>) {
        self.inner.registry.set(registry);
    }

    async fn shutdown(&self, drained: CancellationToken) -> McpResult<()> {
        self.inner.cancel.cancel();
        drained.cancelled().await;
        self.inner.registry.get()?.close_all();
        Ok(())
    }
}

async fn handle_sse(State(inner): State<Arc<SseInner>>) -> Response {
    let registry = match inner.registry.get() {
        Ok(registry) => registry,
        Err(err) => return plain_error(StatusCode::INTERNAL_SERVER_ERROR, &err.message),
    };

    let session_id = registry.create_session();
    let endpoint = format!(
        "{}?{}={}",
        inner.message_path, SESSION_ID_PARAM, session_id
    );
    debug!(target: targets::TRANSPORT, "sse session opened: sessionID={session_id}");

    let first = futures::stream::once(async move {
        Ok::<_, Infallible>(Event::default().event("endpoint").data(endpoint))
    });
    let rest = futures::stream::unfold(
        (registry, session_id),
        |(registry, session_id)| async move {
            match registry.dequeue(&session_id).await {
                Ok(message) => {
                    let data = String::from_utf8_lossy(&message).into_owned();
                    Some((
                        Ok::<_, Infallible>(Event::default().data(data)),
                        (registry, session_id),
                    ))
                }
                Err(err) => {
                    if err.code != ErrorCode::SendEof {
                        warn!(target: targets::TRANSPORT, "sse stream dequeue: {err}");
                    }
                    None
                }
            }
        },
    );

    Sse::new(first.chain(rest)).into_response()
}

async fn handle_message(
    State(inner): State<Arc<SseInner>>,
    Query(params): Query<HashMap<String, String>>,
    body: axum::body::Bytes,
) -> Response {
    let Some(session_id) = params.get(SESSION_ID_PARAM).cloned() else {
        return plain_error(StatusCode::BAD_REQUEST, "missing sessionId");
    };

    let receiver = match inner.receiver.get() {
        Ok(receiver) => receiver,
        Err(err) => return plain_error(StatusCode::INTERNAL_SERVER_ERROR, &err.message),
    };

    let mut ctx = ReceiveContext::for_session(session_id.clone());
    for key in &inner.copy_query_keys {
        if let Some(value) = params.get(key) {
            ctx.query.insert(key.clone(), value.clone());
        }
    }

    match receiver.receive(ctx, &body).await {
        Ok(Some(reply)) => {
            // The response is delivered over the SSE stream.
            let registry = inner.registry.get().ok();
            tokio::spawn(async move {
                if let (Ok(message), Some(registry)) = (reply.await, registry) {
                    if let Err(err) = registry.enqueue(&session_id, message).await {
                        warn!(target: targets::TRANSPORT, "sse reply enqueue: {err}");
                    }
                }
            });
            StatusCode::ACCEPTED.into_response()
        }
        Ok(None) => StatusCode::ACCEPTED.into_response(),
        Err(err) if err.code == ErrorCode::SessionClosed => {
            plain_error(StatusCode::NOT_FOUND, &format!("failed to receive: {err}"))
        }
        Err(err) => plain_error(StatusCode::BAD_REQUEST, &format!("failed to receive: {err}")),
    }
}

fn plain_error(status: StatusCode, message: &str) -> Response {
    error!(target: targets::TRANSPORT, "sse transport error: code={status} message={message}");
    (status, message.to_string()).into_response()
}

struct SseClientInner {
    server_url: Url,
    http: reqwest::Client,
    receiver: Cell<dyn ClientReceiver>,
    message_endpoint: RwLock<Option<Url>>,
    endpoint_ready: Notify,
    cancel: CancellationToken,
}

/// Client side of the SSE transport.
pub struct SseClientTransport {
    inner: Arc<SseClientInner>,
}

impl SseClientTransport {
    /// Creates a client for the given `GET /sse` URL.
    pub fn new(server_url: &str) -> McpResult<Self> {
        let server_url = Url::parse(server_url)
            .map_err(|e| McpError::connection(format!("failed to parse server URL: {e}")))?;
        Ok(Self {
            inner: Arc::new(SseClientInner {
                server_url,
                http: reqwest::Client::new(),
                receiver: Cell::empty(),
                message_endpoint: RwLock::new(None),
                endpoint_ready: Notify::new(),
                cancel: CancellationToken::new(),
            }),
        })
    }
}

impl SseClientInner {
    fn handle_event(&self, receiver: &Arc<dyn ClientReceiver>, event: SseEvent) {
        if event.event.as_deref() == Some("endpoint") {
            match self.server_url.join(&event.data) {
                Ok(endpoint) => {
                    debug!(target: targets::TRANSPORT, "sse message endpoint: {endpoint}");
                    *self.message_endpoint.write() = Some(endpoint);
                    self.endpoint_ready.notify_one();
                }
                Err(err) => {
                    error!(target: targets::TRANSPORT, "invalid endpoint event {:?}: {err}", event.data);
                }
            }
            return;
        }
        if !event.data.is_empty() {
            let receiver = receiver.clone();
            let data = event.data;
            tokio::spawn(async move {
                if let Err(err) = receiver.receive(data.as_bytes()).await {
                    error!(target: targets::TRANSPORT, "error processing sse event: {err}");
                }
            });
        }
    }

    async fn stream_loop(self: Arc<Self>, receiver: Arc<dyn ClientReceiver>) {
        loop {
            if self.cancel.is_cancelled() {
                return;
            }

            let request = self
                .http
                .get(self.server_url.clone())
                .header(reqwest::header::ACCEPT, "text/event-stream");

            match request.send().await {
                Ok(resp) if resp.status().is_success() => {
                    let mut decoder = EventStreamDecoder::new();
                    let mut stream = resp.bytes_stream();
                    loop {
                        tokio::select! {
                            _ = self.cancel.cancelled() => return,
                            chunk = stream.next() => match chunk {
                                Some(Ok(bytes)) => {
                                    for event in decoder.push(&bytes) {
                                        self.handle_event(&receiver, event);
                                    }
                                }
                                Some(Err(err)) => {
                                    error!(target: targets::TRANSPORT, "sse stream error: {err}");
                                    receiver.interrupt(McpError::connection(err.to_string()));
                                    break;
                                }
                                None => {
                                    if let Some(event) = decoder.finish() {
                                        self.handle_event(&receiver, event);
                                    }
                                    receiver.interrupt(McpError::connection("sse stream ended"));
                                    break;
                                }
                            }
                        }
                    }
                }
                Ok(resp) => {
                    error!(target: targets::TRANSPORT, "sse connect failed: status={}", resp.status());
                }
                Err(err) => {
                    error!(target: targets::TRANSPORT, "failed to connect to sse stream: {err}");
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
            }
        }
    }
}

#[async_trait]
impl ClientTransport for SseClientTransport {
    async fn start(&self) -> McpResult<()> {
        let receiver = self.inner.receiver.get()?;

        tokio::spawn(self.inner.clone().stream_loop(receiver));

        // Block until the server announces the message endpoint.
        let notified = self.inner.endpoint_ready.notified();
        if self.inner.message_endpoint.read().is_none() {
            tokio::time::timeout(Duration::from_secs(10), notified)
                .await
                .map_err(|_| McpError::connection("timed out waiting for endpoint event"))?;
        }
        Ok(())
    }

    async fn send(&self, message: &[u8]) -> McpResult<()> {
        let endpoint = self
            .inner
            .message_endpoint
            .read()
            .clone()
            .ok_or_else(|| McpError::connection("message endpoint not received"))?;

        let resp = self
            .inner
            .http
            .post(endpoint)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(message.to_vec())
            .send()
            .await
            .map_err(|e| McpError::connection(format!("failed to send message: {e}")))?;

        match resp.status() {
            status if status.is_success() => Ok(()),
            reqwest::StatusCode::NOT_FOUND => Err(McpError::session_closed()),
            status => Err(McpError::connection(format!(
                "message endpoint returned {status}"
            ))),
        }
    }

    fn set_receiver(&self, receiver: Arc<dyn ClientReceiver>) {
        self.inner.receiver.set(receiver);
    }

    async fn close(&self) -> McpResult<()> {
        self.inner.cancel.cancel();
        Ok(())
    }
}
