//! Streamable HTTP transport: requests, streaming server-initiated messages,
//! and session lifecycle multiplexed over three verbs on a single endpoint.
//!
//! - `POST`: one JSON-RPC message per body. `Mcp-Session-Id` carries the
//!   session, except for `initialize`, which mints one and returns it in the
//!   response header. Notifications and responses are acknowledged with
//!   `202 Accepted`; requests require `Accept: text/event-stream` and are
//!   answered inline.
//! - `GET`: a server-to-client SSE stream bound to `Mcp-Session-Id`, draining
//!   the session's send queue with monotonically increasing event ids.
//! - `DELETE`: closes the session.
//!
//! In `stateless` mode every POST is self-contained and GET returns 405.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::header::{CACHE_CONTROL, CONNECTION, CONTENT_TYPE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use futures::StreamExt;
use parking_lot::RwLock;
use peermcp_core::logging::{debug, error, targets, warn};
use peermcp_core::{ErrorCode, McpError, McpResult};
use reqwest::Url;
use tokio_util::sync::CancellationToken;

use crate::{
    Cell, ClientReceiver, ClientTransport, EventStreamDecoder, ReceiveContext, ServerReceiver,
    ServerTransport, SessionIdReturn, SessionRegistry, LAST_EVENT_ID_HEADER, SESSION_ID_HEADER,
};

/// Session handling mode for the single-endpoint transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StateMode {
    /// Sessions are minted at initialize and required on every message.
    #[default]
    Stateful,
    /// Every POST is self-contained; GET is rejected with 405.
    Stateless,
}

struct HttpInner {
    addr: String,
    endpoint: String,
    state_mode: StateMode,
    receiver: Cell<dyn ServerReceiver>,
    registry: Cell<dyn SessionRegistry>,
    cancel: CancellationToken,
}

/// Server side of the Streamable HTTP transport.
pub struct StreamableHttpServerTransport {
    inner: Arc<HttpInner>,
}

impl StreamableHttpServerTransport {
    /// Creates a transport that will bind `addr` with the default `/mcp`
    /// endpoint in stateful mode.
    #[must_use]
    pub fn bind(addr: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(HttpInner {
                addr: addr.into(),
                endpoint: "/mcp".to_string(),
                state_mode: StateMode::default(),
                receiver: Cell::empty(),
                registry: Cell::empty(),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Overrides the endpoint path (default `/mcp`).
    #[must_use]
    pub fn with_endpoint(self, endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into();
        self.with_inner(|inner| inner.endpoint = endpoint)
    }

    /// Sets the session handling mode.
    #[must_use]
    pub fn with_state_mode(self, mode: StateMode) -> Self {
        self.with_inner(|inner| inner.state_mode = mode)
    }

    fn with_inner(mut self, f: impl FnOnce(&mut HttpInner)) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            f(inner);
        }
        self
    }
}

#[async_trait]
impl ServerTransport for StreamableHttpServerTransport {
    async fn run(&self) -> McpResult<()> {
        let inner = self.inner.clone();
        let app = Router::new()
            .route(
                &inner.endpoint,
                post(handle_post).get(handle_get).delete(handle_delete),
            )
            .with_state(inner.clone());

        let listener = tokio::net::TcpListener::bind(&inner.addr)
            .await
            .map_err(|e| McpError::connection(format!("bind {}: {e}", inner.addr)))?;

        debug!(target: targets::TRANSPORT, "streamable http transport listening on {}", inner.addr);
        axum::serve(listener, app)
            .with_graceful_shutdown(inner.cancel.clone().cancelled_owned())
            .await
            .map_err(|e| McpError::connection(format!("http server: {e}")))
    }

    async fn send(&self, session_id: &str, message: Vec<u8>) -> McpResult<()> {
        if self.inner.cancel.is_cancelled() {
            return Err(McpError::shutdown());
        }
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

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn plain_error(status: StatusCode, message: &str) -> Response {
    error!(target: targets::TRANSPORT, "streamable http error: code={status} message={message}");
    (status, message.to_string()).into_response()
}

async fn handle_post(
    State(inner): State<Arc<HttpInner>>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Response {
    let accept = header_str(&headers, "accept").unwrap_or("");
    if accept.is_empty() {
        return plain_error(StatusCode::BAD_REQUEST, "Missing Accept header");
    }

    let receiver = match inner.receiver.get() {
        Ok(receiver) => receiver,
        Err(err) => return plain_error(StatusCode::INTERNAL_SERVER_ERROR, &err.message),
    };

    let session_id = header_str(&headers, SESSION_ID_HEADER).unwrap_or("").to_string();
    let mut ctx = ReceiveContext::for_session(session_id.clone());
    ctx.stateless = inner.state_mode == StateMode::Stateless;

    // A stateful POST without a session can only be initialize; hand the
    // dispatcher a slot to return the minted session id through.
    let new_session = if inner.state_mode == StateMode::Stateful && session_id.is_empty() {
        let slot = Arc::new(SessionIdReturn::new());
        ctx.new_session = Some(slot.clone());
        Some(slot)
    } else {
        None
    };

    let reply = match receiver.receive(ctx, &body).await {
        Ok(reply) => reply,
        Err(err) if err.code == ErrorCode::SessionClosed => {
            return plain_error(StatusCode::NOT_FOUND, &format!("failed to receive: {err}"));
        }
        Err(err) => {
            return plain_error(StatusCode::BAD_REQUEST, &format!("failed to receive: {err}"));
        }
    };

    let Some(reply) = reply else {
        // Notification or response: acknowledge with an empty body.
        return (StatusCode::ACCEPTED, [(CONTENT_TYPE, "application/json")], "").into_response();
    };

    if !accept.contains("text/event-stream") {
        return plain_error(StatusCode::BAD_REQUEST, "Must accept text/event-stream");
    }

    match reply.await {
        Ok(message) => {
            let mut response =
                (StatusCode::OK, [(CONTENT_TYPE, "application/json")], message).into_response();
            if let Some(minted) = new_session.as_deref().and_then(SessionIdReturn::get) {
                if let Ok(value) = minted.parse() {
                    response.headers_mut().insert(SESSION_ID_HEADER, value);
                }
            }
            response
        }
        // The dispatcher dropped the reply without a payload.
        Err(_) => StatusCode::OK.into_response(),
    }
}

async fn handle_get(State(inner): State<Arc<HttpInner>>, headers: HeaderMap) -> Response {
    if inner.state_mode == StateMode::Stateless {
        return plain_error(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed");
    }

    let accept = header_str(&headers, "accept").unwrap_or("");
    if !accept.contains("text/event-stream") {
        return plain_error(StatusCode::BAD_REQUEST, "Must accept text/event-stream");
    }

    let Some(session_id) = header_str(&headers, SESSION_ID_HEADER).map(str::to_string) else {
        return plain_error(StatusCode::BAD_REQUEST, "Missing Session ID");
    };

    let registry = match inner.registry.get() {
        Ok(registry) => registry,
        Err(err) => return plain_error(StatusCode::INTERNAL_SERVER_ERROR, &err.message),
    };
    if registry.is_closed(&session_id) {
        return plain_error(StatusCode::NOT_FOUND, "session closed");
    }
    if !registry.is_active(&session_id) {
        return plain_error(StatusCode::BAD_REQUEST, "unknown session");
    }

    // Event ids are monotonic per stream; a resuming client continues from
    // its Last-Event-ID. No replay buffer is kept.
    let mut next_event_id: u64 = header_str(&headers, LAST_EVENT_ID_HEADER)
        .and_then(|v| v.parse::<u64>().ok())
        .map_or(0, |last| last + 1);

    let stream = futures::stream::unfold(
        (registry, session_id),
        move |(registry, session_id)| {
            let event_id = next_event_id;
            next_event_id += 1;
            async move {
                match registry.dequeue(&session_id).await {
                    Ok(message) => {
                        let data = String::from_utf8_lossy(&message).into_owned();
                        Some((
                            Ok::<_, std::convert::Infallible>(
                                Event::default().id(event_id.to_string()).data(data),
                            ),
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
            }
        },
    );

    let mut response = Sse::new(stream).into_response();
    let response_headers = response.headers_mut();
    response_headers.insert(CACHE_CONTROL, axum::http::HeaderValue::from_static("no-cache"));
    response_headers.insert(CONNECTION, axum::http::HeaderValue::from_static("keep-alive"));
    response
}

async fn handle_delete(State(inner): State<Arc<HttpInner>>, headers: HeaderMap) -> Response {
    let Some(session_id) = header_str(&headers, SESSION_ID_HEADER) else {
        return plain_error(StatusCode::BAD_REQUEST, "Missing session ID");
    };
    let registry = match inner.registry.get() {
        Ok(registry) => registry,
        Err(err) => return plain_error(StatusCode::INTERNAL_SERVER_ERROR, &err.message),
    };
    registry.close_session(session_id);
    StatusCode::OK.into_response()
}

struct HttpClientInner {
    url: Url,
    http: reqwest::Client,
    receiver: Cell<dyn ClientReceiver>,
    session_id: RwLock<Option<String>>,
    last_event_id: RwLock<Option<String>>,
    cancel: CancellationToken,
}

/// Client side of the Streamable HTTP transport.
pub struct StreamableHttpClientTransport {
    inner: Arc<HttpClientInner>,
}

impl StreamableHttpClientTransport {
    /// Creates a client for the given endpoint URL.
    pub fn new(url: &str) -> McpResult<Self> {
        let url = Url::parse(url)
            .map_err(|e| McpError::connection(format!("failed to parse server URL: {e}")))?;
        Ok(Self {
            inner: Arc::new(HttpClientInner {
                url,
                http: reqwest::Client::new(),
                receiver: Cell::empty(),
                session_id: RwLock::new(None),
                last_event_id: RwLock::new(None),
                cancel: CancellationToken::new(),
            }),
        })
    }

    /// The session id learned from the server, if any.
    #[must_use]
    pub fn session_id(&self) -> Option<String> {
        self.inner.session_id.read().clone()
    }
}

impl HttpClientInner {
    fn record_session_id(&self, resp: &reqwest::Response) -> McpResult<()> {
        let Some(remote) = resp
            .headers()
            .get(SESSION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
        else {
            return Ok(());
        };
        let mut local = self.session_id.write();
        match local.as_deref() {
            Some(existing) if existing != remote => Err(McpError::connection(
                "failed to send message: session ID does not match",
            )),
            Some(_) => Ok(()),
            None => {
                *local = Some(remote.to_string());
                Ok(())
            }
        }
    }

    async fn consume_event_stream(self: Arc<Self>, resp: reqwest::Response) {
        let receiver = match self.receiver.get() {
            Ok(receiver) => receiver,
            Err(_) => return,
        };
        let mut decoder = EventStreamDecoder::new();
        let mut stream = resp.bytes_stream();
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                chunk = stream.next() => match chunk {
                    Some(Ok(bytes)) => {
                        for event in decoder.push(&bytes) {
                            if let Some(id) = &event.id {
                                *self.last_event_id.write() = Some(id.clone());
                            }
                            if !event.data.is_empty() {
                                if let Err(err) = receiver.receive(event.data.as_bytes()).await {
                                    error!(target: targets::TRANSPORT, "error processing sse event: {err}");
                                }
                            }
                        }
                    }
                    Some(Err(err)) => {
                        debug!(target: targets::TRANSPORT, "sse stream error: {err}");
                        return;
                    }
                    None => {
                        if let Some(event) = decoder.finish() {
                            if !event.data.is_empty() {
                                if let Err(err) = receiver.receive(event.data.as_bytes()).await {
                                    error!(target: targets::TRANSPORT, "error processing sse event: {err}");
                                }
                            }
                        }
                        return;
                    }
                }
            }
        }
    }

    /// Background GET loop for server-initiated messages. Reconnects until
    /// cancelled; a 405 means the server runs stateless and has no stream.
    async fn get_stream_loop(self: Arc<Self>) {
        loop {
            if self.cancel.is_cancelled() {
                return;
            }

            let mut request = self
                .http
                .get(self.url.clone())
                .header(reqwest::header::ACCEPT, "text/event-stream");
            if let Some(session_id) = self.session_id.read().clone() {
                request = request.header(SESSION_ID_HEADER, session_id);
            }
            if let Some(last) = self.last_event_id.read().clone() {
                request = request.header(LAST_EVENT_ID_HEADER, last);
            }

            match request.send().await {
                Ok(resp) if resp.status() == reqwest::StatusCode::METHOD_NOT_ALLOWED => {
                    debug!(target: targets::TRANSPORT, "server does not support SSE streaming");
                    return;
                }
                Ok(resp) if resp.status().is_success() => {
                    self.clone().consume_event_stream(resp).await;
                }
                Ok(resp) => {
                    debug!(target: targets::TRANSPORT, "sse connect failed: status={}", resp.status());
                }
                Err(err) => {
                    debug!(target: targets::TRANSPORT, "failed to connect to SSE stream: {err}");
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
impl ClientTransport for StreamableHttpClientTransport {
    async fn start(&self) -> McpResult<()> {
        self.inner.receiver.get()?;
        tokio::spawn(self.inner.clone().get_stream_loop());
        Ok(())
    }

    async fn send(&self, message: &[u8]) -> McpResult<()> {
        let mut request = self
            .inner
            .http
            .post(self.inner.url.clone())
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(reqwest::header::ACCEPT, "application/json, text/event-stream")
            .body(message.to_vec());
        if let Some(session_id) = self.inner.session_id.read().clone() {
            request = request.header(SESSION_ID_HEADER, session_id);
        }

        let resp = request
            .send()
            .await
            .map_err(|e| McpError::connection(format!("failed to send message: {e}")))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            // The server no longer knows this session; the dispatcher will
            // re-initialize and mint a fresh one.
            *self.inner.session_id.write() = None;
            return Err(McpError::session_closed());
        }
        if !resp.status().is_success() {
            return Err(McpError::connection(format!(
                "server returned {}",
                resp.status()
            )));
        }

        self.inner.record_session_id(&resp)?;

        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        if content_type.starts_with("text/event-stream") {
            tokio::spawn(self.inner.clone().consume_event_stream(resp));
            return Ok(());
        }

        if resp.status() == reqwest::StatusCode::ACCEPTED {
            return Ok(()); // notifications and responses
        }

        let body = resp
            .bytes()
            .await
            .map_err(|e| McpError::connection(format!("failed to read response: {e}")))?;
        if !body.is_empty() {
            self.inner.receiver.get()?.receive(&body).await?;
        }
        Ok(())
    }

    fn set_receiver(&self, receiver: Arc<dyn ClientReceiver>) {
        self.inner.receiver.set(receiver);
    }

    async fn close(&self) -> McpResult<()> {
        self.inner.cancel.cancel();

        let session_id = self.inner.session_id.read().clone();
        if let Some(session_id) = session_id {
            let _ = self
                .inner
                .http
                .delete(self.inner.url.clone())
                .header(SESSION_ID_HEADER, session_id)
                .send()
                .await;
        }
        Ok(())
    }
}
