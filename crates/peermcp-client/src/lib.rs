//! MCP client engine.
//!
//! [`Client`] drives a [`ClientTransport`]: it performs the initialize
//! handshake, correlates responses to outbound requests, dispatches
//! server-initiated requests (ping, sampling) and notifications, streams
//! progress into per-call channels, and transparently re-initializes when
//! the transport reports a closed session.
//!
//! ```ignore
//! let transport = Arc::new(StdioClientTransport::new("mcp-server"));
//! let client = Client::builder()
//!     .with_client_info(ClientInfo { name: "example".into(), version: "1.0".into() })
//!     .connect(transport)
//!     .await?;
//! let tools = client.list_tools(None).await?;
//! ```

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, AtomicI64};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use peermcp_core::logging::{info, targets, warn};
use peermcp_core::{McpError, McpResult};
use peermcp_protocol::{
    CallToolParams, CallToolResult, ClientCapabilities, ClientInfo, CreateMessageParams,
    CreateMessageResult, Cursor, GetPromptParams, GetPromptResult, ListPromptsResult,
    ListResourceTemplatesResult, ListResourcesResult, ListToolsResult, PingResult, ProgressParams,
    ReadResourceParams, ReadResourceResult, ResourceUpdatedParams, SamplingCapability,
    ServerCapabilities, ServerInfo, SubscribeResult, UnsubscribeResult,
};
use peermcp_transport::{ClientTransport, PendingRequests};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

mod call;
mod receive;
#[cfg(test)]
mod tests;

use receive::ClientReceiverImpl;

/// Interval between client heartbeat pings.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

/// Default initialize budget.
const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Services `sampling/createMessage` requests from the server.
#[async_trait]
pub trait SamplingHandler: Send + Sync {
    /// Produces a completion for the given conversation.
    async fn create_message(&self, params: CreateMessageParams) -> McpResult<CreateMessageResult>;
}

/// Receives server notifications. Default implementations log and move on.
pub trait NotificationHandler: Send + Sync {
    /// The server's tool registry changed.
    fn on_tools_list_changed(&self) {
        info!(target: targets::CLIENT, "receive notify: tools list changed");
    }

    /// The server's prompt registry changed.
    fn on_prompts_list_changed(&self) {
        info!(target: targets::CLIENT, "receive notify: prompts list changed");
    }

    /// The server's resource registry changed.
    fn on_resources_list_changed(&self) {
        info!(target: targets::CLIENT, "receive notify: resources list changed");
    }

    /// A subscribed resource changed.
    fn on_resource_updated(&self, params: ResourceUpdatedParams) {
        info!(target: targets::CLIENT, "receive notify: resource updated: uri={}", params.uri);
    }
}

/// The default notification handler: logs every notification.
pub struct LoggingNotificationHandler;

impl NotificationHandler for LoggingNotificationHandler {}

pub(crate) struct ClientInner {
    pub(crate) transport: Arc<dyn ClientTransport>,
    pub(crate) pending: PendingRequests,
    pub(crate) next_request_id: AtomicI64,
    pub(crate) ready: AtomicBool,
    pub(crate) init_lock: tokio::sync::Mutex<()>,
    pub(crate) client_info: ClientInfo,
    pub(crate) client_capabilities: ClientCapabilities,
    pub(crate) server_info: parking_lot::RwLock<Option<ServerInfo>>,
    pub(crate) server_capabilities: parking_lot::RwLock<Option<ServerCapabilities>>,
    pub(crate) server_instructions: parking_lot::RwLock<Option<String>>,
    pub(crate) progress_sinks: DashMap<String, mpsc::Sender<ProgressParams>>,
    pub(crate) notification_handler: Arc<dyn NotificationHandler>,
    pub(crate) sampling_handler: Option<Arc<dyn SamplingHandler>>,
    pub(crate) closed: CancellationToken,
}

/// An MCP client. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Starts building a client.
    #[must_use]
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// The server's capabilities from the initialize handshake.
    #[must_use]
    pub fn server_capabilities(&self) -> Option<ServerCapabilities> {
        self.inner.server_capabilities.read().clone()
    }

    /// The server's identity from the initialize handshake.
    #[must_use]
    pub fn server_info(&self) -> Option<ServerInfo> {
        self.inner.server_info.read().clone()
    }

    /// The server's usage instructions, when it sent any.
    #[must_use]
    pub fn server_instructions(&self) -> Option<String> {
        self.inner.server_instructions.read().clone()
    }

    /// Pings the server.
    pub async fn ping(&self) -> McpResult<PingResult> {
        self.inner.ping().await
    }

    /// Lists tools, optionally from a pagination cursor.
    pub async fn list_tools(&self, cursor: Option<Cursor>) -> McpResult<ListToolsResult> {
        self.inner.list_tools(cursor).await
    }

    /// Invokes a tool.
    pub async fn call_tool(&self, params: CallToolParams) -> McpResult<CallToolResult> {
        self.inner.call_tool(params, None).await
    }

    /// Invokes a tool with a deadline. On expiry the server is sent a
    /// cancellation notification and the call fails with a cancel error.
    pub async fn call_tool_with_timeout(
        &self,
        params: CallToolParams,
        timeout: Duration,
    ) -> McpResult<CallToolResult> {
        self.inner.call_tool(params, Some(timeout)).await
    }

    /// Invokes a tool, streaming its progress notifications into `progress`.
    ///
    /// The sink is unregistered (and thereby closed) when the call returns;
    /// no progress arrives after the result.
    pub async fn call_tool_with_progress(
        &self,
        params: CallToolParams,
        progress: mpsc::Sender<ProgressParams>,
    ) -> McpResult<CallToolResult> {
        self.inner.call_tool_with_progress(params, progress).await
    }

    /// Lists prompts, optionally from a pagination cursor.
    pub async fn list_prompts(&self, cursor: Option<Cursor>) -> McpResult<ListPromptsResult> {
        self.inner.list_prompts(cursor).await
    }

    /// Fetches a prompt.
    pub async fn get_prompt(&self, params: GetPromptParams) -> McpResult<GetPromptResult> {
        self.inner.get_prompt(params).await
    }

    /// Lists resources, optionally from a pagination cursor.
    pub async fn list_resources(&self, cursor: Option<Cursor>) -> McpResult<ListResourcesResult> {
        self.inner.list_resources(cursor).await
    }

    /// Lists resource templates, optionally from a pagination cursor.
    pub async fn list_resource_templates(
        &self,
        cursor: Option<Cursor>,
    ) -> McpResult<ListResourceTemplatesResult> {
        self.inner.list_resource_templates(cursor).await
    }

    /// Reads a resource by URI.
    pub async fn read_resource(&self, params: ReadResourceParams) -> McpResult<ReadResourceResult> {
        self.inner.read_resource(params).await
    }

    /// Subscribes to change notifications for a resource.
    pub async fn subscribe_resource(&self, uri: &str) -> McpResult<SubscribeResult> {
        self.inner.subscribe_resource(uri).await
    }

    /// Removes a resource subscription.
    pub async fn unsubscribe_resource(&self, uri: &str) -> McpResult<UnsubscribeResult> {
        self.inner.unsubscribe_resource(uri).await
    }

    /// Closes the client and its transport.
    pub async fn close(&self) -> McpResult<()> {
        self.inner.closed.cancel();
        self.inner.transport.close().await
    }
}

/// Builds a [`Client`] and runs its initialize handshake.
pub struct ClientBuilder {
    client_info: ClientInfo,
    capabilities: ClientCapabilities,
    init_timeout: Duration,
    notification_handler: Arc<dyn NotificationHandler>,
    sampling_handler: Option<Arc<dyn SamplingHandler>>,
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientBuilder {
    /// Creates a builder with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self {
            client_info: ClientInfo::default(),
            capabilities: ClientCapabilities::default(),
            init_timeout: DEFAULT_INIT_TIMEOUT,
            notification_handler: Arc::new(LoggingNotificationHandler),
            sampling_handler: None,
        }
    }

    /// Sets the identity reported at initialize.
    #[must_use]
    pub fn with_client_info(mut self, client_info: ClientInfo) -> Self {
        self.client_info = client_info;
        self
    }

    /// Overrides the advertised capabilities.
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: ClientCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Budget for the initialize handshake (default 30 s).
    #[must_use]
    pub fn with_init_timeout(mut self, timeout: Duration) -> Self {
        self.init_timeout = timeout;
        self
    }

    /// Installs a notification handler.
    #[must_use]
    pub fn with_notification_handler(mut self, handler: Arc<dyn NotificationHandler>) -> Self {
        self.notification_handler = handler;
        self
    }

    /// Installs a sampling handler; the sampling capability is advertised
    /// automatically.
    #[must_use]
    pub fn with_sampling_handler(mut self, handler: Arc<dyn SamplingHandler>) -> Self {
        self.sampling_handler = Some(handler);
        self
    }

    /// Connects over the transport and completes the initialize handshake.
    pub async fn connect(self, transport: Arc<dyn ClientTransport>) -> McpResult<Client> {
        let mut capabilities = self.capabilities;
        if self.sampling_handler.is_some() && capabilities.sampling.is_none() {
            capabilities.sampling = Some(SamplingCapability::default());
        }

        let init_timeout = self.init_timeout;
        let inner = Arc::new(ClientInner {
            transport,
            pending: PendingRequests::new(),
            next_request_id: AtomicI64::new(0),
            ready: AtomicBool::new(false),
            init_lock: tokio::sync::Mutex::new(()),
            client_info: self.client_info,
            client_capabilities: capabilities,
            server_info: parking_lot::RwLock::new(None),
            server_capabilities: parking_lot::RwLock::new(None),
            server_instructions: parking_lot::RwLock::new(None),
            progress_sinks: DashMap::new(),
            notification_handler: self.notification_handler,
            sampling_handler: self.sampling_handler,
            closed: CancellationToken::new(),
        });

        inner
            .transport
            .set_receiver(Arc::new(ClientReceiverImpl(inner.clone())));
        inner.transport.start().await.map_err(|err| {
            McpError::new(err.code, format!("init mcp client transport start fail: {err}"))
        })?;

        tokio::time::timeout(init_timeout, inner.initialize())
            .await
            .map_err(|_| McpError::cancelled("initialize timed out"))??;

        let heartbeat = inner.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = heartbeat.closed.cancelled() => return,
                    _ = ticker.tick() => {
                        if let Err(err) = heartbeat.ping().await {
                            warn!(target: targets::CLIENT, "mcp client ping server fail: {err}");
                        }
                    }
                }
            }
        });

        Ok(Client { inner })
    }
}
