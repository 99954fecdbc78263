//! MCP server engine.
//!
//! [`Server`] owns a [`ServerTransport`], a session store, and concurrent
//! registries of tools, prompts, resources, and resource templates. Inbound
//! messages are classified and dispatched on fresh tasks; outbound calls
//! (heartbeat pings, sampling, notifications) follow the same
//! pending-response discipline as the client side.
//!
//! ```ignore
//! let transport = Arc::new(StdioServerTransport::new());
//! let server = Server::builder(transport)
//!     .with_server_info(ServerInfo { name: "example".into(), version: "1.0".into() })
//!     .build();
//! server.register_tool(tool, |ctx, params| async move { Ok(CallToolResult::text("pong")) });
//! server.run().await?;
//! ```

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::BoxFuture;
use peermcp_core::logging::{targets, warn};
use peermcp_core::{McpResult, WaitGroup};
use peermcp_protocol::{
    method, CallToolParams, CallToolResult, CreateMessageParams, CreateMessageResult,
    GetPromptParams, GetPromptResult, PingResult, ProgressParams, ProgressToken, Prompt,
    ReadResourceParams, ReadResourceResult, Resource, ResourceTemplate, ServerCapabilities,
    ServerInfo, Tool,
};
use peermcp_transport::ServerTransport;
use tokio_util::sync::CancellationToken;

mod builder;
mod call;
mod handle;
mod middleware;
mod receive;
mod send;
pub mod session;
#[cfg(test)]
mod tests;

pub use builder::ServerBuilder;
pub use middleware::{RateLimitConfig, RateLimitMiddleware, ToolMiddleware};
pub use session::{SessionManager, SessionState};

use handle::UriTemplate;
use middleware::RateLimiters;

/// Boxed tool handler.
pub type ToolHandlerFn = Arc<
    dyn Fn(RequestContext, CallToolParams) -> BoxFuture<'static, McpResult<CallToolResult>>
        + Send
        + Sync,
>;

/// Boxed prompt handler.
pub type PromptHandlerFn = Arc<
    dyn Fn(RequestContext, GetPromptParams) -> BoxFuture<'static, McpResult<GetPromptResult>>
        + Send
        + Sync,
>;

/// Boxed resource handler.
pub type ResourceHandlerFn = Arc<
    dyn Fn(RequestContext, ReadResourceParams) -> BoxFuture<'static, McpResult<ReadResourceResult>>
        + Send
        + Sync,
>;

/// Context handed to every handler invocation.
///
/// The cancellation token fires on an explicit `notifications/cancelled` for
/// the request or on server shutdown, never on client disconnect.
#[derive(Clone)]
pub struct RequestContext {
    session_id: Option<String>,
    progress_token: Option<ProgressToken>,
    cancellation: CancellationToken,
    query: HashMap<String, String>,
    notifier: Option<Arc<ServerInner>>,
}

impl RequestContext {
    pub(crate) fn new(
        session_id: Option<String>,
        progress_token: Option<ProgressToken>,
        cancellation: CancellationToken,
        query: HashMap<String, String>,
        notifier: Option<Arc<ServerInner>>,
    ) -> Self {
        Self {
            session_id,
            progress_token,
            cancellation,
            query,
            notifier,
        }
    }

    /// A context bound to nothing, for driving handlers directly in tests.
    #[must_use]
    pub fn detached() -> Self {
        Self::new(None, None, CancellationToken::new(), HashMap::new(), None)
    }

    /// The session the request arrived on, when the transport has sessions.
    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// The request's progress token, when the caller asked for progress.
    #[must_use]
    pub fn progress_token(&self) -> Option<&ProgressToken> {
        self.progress_token.as_ref()
    }

    /// Query values the transport copied through (SSE `copy_query_keys`).
    #[must_use]
    pub fn query(&self) -> &HashMap<String, String> {
        &self.query
    }

    /// Whether the request was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves when the request is cancelled.
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await;
    }

    /// Sends a progress notification to the originating peer. A no-op when
    /// the request carried no progress token.
    pub async fn send_progress(
        &self,
        progress: f64,
        total: Option<f64>,
        message: Option<&str>,
    ) -> McpResult<()> {
        let (Some(notifier), Some(session_id), Some(token)) =
            (&self.notifier, &self.session_id, &self.progress_token)
        else {
            return Ok(());
        };
        let params = ProgressParams {
            progress_token: token.clone(),
            progress,
            total,
            message: message.map(str::to_string),
        };
        notifier
            .send_notification(
                session_id,
                method::NOTIFICATION_PROGRESS,
                Some(peermcp_protocol::to_raw(&params)?),
            )
            .await
    }
}

pub(crate) struct ToolEntry {
    pub(crate) tool: Tool,
    pub(crate) handler: ToolHandlerFn,
}

pub(crate) struct PromptEntry {
    pub(crate) prompt: Prompt,
    pub(crate) handler: PromptHandlerFn,
}

pub(crate) struct ResourceEntry {
    pub(crate) resource: Resource,
    pub(crate) handler: ResourceHandlerFn,
}

pub(crate) struct ResourceTemplateEntry {
    pub(crate) template: ResourceTemplate,
    pub(crate) matcher: UriTemplate,
    pub(crate) handler: ResourceHandlerFn,
}

pub(crate) struct ServerInner {
    pub(crate) transport: Arc<dyn ServerTransport>,
    pub(crate) tools: DashMap<String, ToolEntry>,
    pub(crate) prompts: DashMap<String, PromptEntry>,
    pub(crate) resources: DashMap<String, ResourceEntry>,
    pub(crate) resource_templates: DashMap<String, ResourceTemplateEntry>,
    pub(crate) session_manager: Arc<SessionManager>,
    pub(crate) in_shutdown: AtomicBool,
    pub(crate) in_fly_requests: WaitGroup,
    pub(crate) shutdown_token: CancellationToken,
    pub(crate) cancels: DashMap<String, CancellationToken>,
    pub(crate) capabilities: ServerCapabilities,
    pub(crate) server_info: ServerInfo,
    pub(crate) instructions: Option<String>,
    pub(crate) pagination_limit: usize,
    pub(crate) rate_limiters: Option<RateLimiters>,
}

/// An MCP server. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    /// Starts building a server over the given transport.
    #[must_use]
    pub fn builder(transport: Arc<dyn ServerTransport>) -> ServerBuilder {
        ServerBuilder::new(transport)
    }

    /// Runs the heartbeat and the transport; blocks until shutdown.
    pub async fn run(&self) -> McpResult<()> {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let detection_inner = inner.clone();
            let detection = move |session_id: String| -> BoxFuture<'static, McpResult<()>> {
                let inner = detection_inner.clone();
                Box::pin(async move {
                    if inner.in_shutdown.load(Ordering::Acquire) {
                        return Ok(());
                    }
                    inner.ping_session(&session_id).await.map(|_| ())
                })
            };
            inner.session_manager.run_heartbeat(detection).await;
        });

        self.inner.transport.run().await
    }

    /// Graceful shutdown: reject new requests, drain in-flight ones, stop
    /// the heartbeat, close the transport and every session.
    pub async fn shutdown(&self) -> McpResult<()> {
        self.inner.in_shutdown.store(true, Ordering::Release);
        self.inner.session_manager.stop_heartbeat();
        self.inner.shutdown_token.cancel();

        let drained = CancellationToken::new();
        {
            let inner = self.inner.clone();
            let drained = drained.clone();
            tokio::spawn(async move {
                inner.in_fly_requests.wait().await;
                drained.cancel();
            });
        }

        self.inner.transport.shutdown(drained).await
    }

    // ========================================================================
    // Registry
    // ========================================================================

    /// Registers a tool.
    pub fn register_tool<F, Fut>(&self, tool: Tool, handler: F)
    where
        F: Fn(RequestContext, CallToolParams) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = McpResult<CallToolResult>> + Send + 'static,
    {
        self.register_tool_with_middleware(tool, handler, &[]);
    }

    /// Registers a tool with a middleware chain. The last middleware runs
    /// outermost; the configured rate limiter, when present, wraps the whole
    /// chain.
    pub fn register_tool_with_middleware<F, Fut>(
        &self,
        tool: Tool,
        handler: F,
        middlewares: &[Arc<dyn ToolMiddleware>],
    ) where
        F: Fn(RequestContext, CallToolParams) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = McpResult<CallToolResult>> + Send + 'static,
    {
        let boxed: ToolHandlerFn = Arc::new(move |ctx, params| Box::pin(handler(ctx, params)));
        let mut composed = middleware::compose(boxed, middlewares);
        if let Some(limiters) = &self.inner.rate_limiters {
            composed =
                RateLimitMiddleware::with_limiter(limiters.limiter_for(&tool.name)).wrap(composed);
        }
        self.inner.tools.insert(
            tool.name.clone(),
            ToolEntry {
                tool,
                handler: composed,
            },
        );
        self.broadcast(BroadcastKind::Tools);
    }

    /// Removes a tool.
    pub fn unregister_tool(&self, name: &str) {
        self.inner.tools.remove(name);
        self.broadcast(BroadcastKind::Tools);
    }

    /// Registers a prompt.
    pub fn register_prompt<F, Fut>(&self, prompt: Prompt, handler: F)
    where
        F: Fn(RequestContext, GetPromptParams) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = McpResult<GetPromptResult>> + Send + 'static,
    {
        let handler: PromptHandlerFn = Arc::new(move |ctx, params| Box::pin(handler(ctx, params)));
        self.inner
            .prompts
            .insert(prompt.name.clone(), PromptEntry { prompt, handler });
        self.broadcast(BroadcastKind::Prompts);
    }

    /// Removes a prompt.
    pub fn unregister_prompt(&self, name: &str) {
        self.inner.prompts.remove(name);
        self.broadcast(BroadcastKind::Prompts);
    }

    /// Registers a resource.
    pub fn register_resource<F, Fut>(&self, resource: Resource, handler: F)
    where
        F: Fn(RequestContext, ReadResourceParams) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = McpResult<ReadResourceResult>> + Send + 'static,
    {
        let handler: ResourceHandlerFn =
            Arc::new(move |ctx, params| Box::pin(handler(ctx, params)));
        self.inner
            .resources
            .insert(resource.uri.clone(), ResourceEntry { resource, handler });
        self.broadcast(BroadcastKind::Resources);
    }

    /// Removes a resource.
    pub fn unregister_resource(&self, uri: &str) {
        self.inner.resources.remove(uri);
        self.broadcast(BroadcastKind::Resources);
    }

    /// Registers a resource template. Fails fast on a malformed URI template.
    pub fn register_resource_template<F, Fut>(
        &self,
        template: ResourceTemplate,
        handler: F,
    ) -> McpResult<()>
    where
        F: Fn(RequestContext, ReadResourceParams) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = McpResult<ReadResourceResult>> + Send + 'static,
    {
        let matcher = UriTemplate::parse(&template.uri_template)?;
        let handler: ResourceHandlerFn =
            Arc::new(move |ctx, params| Box::pin(handler(ctx, params)));
        self.inner.resource_templates.insert(
            template.uri_template.clone(),
            ResourceTemplateEntry {
                template,
                matcher,
                handler,
            },
        );
        self.broadcast(BroadcastKind::Resources);
        Ok(())
    }

    /// Removes a resource template.
    pub fn unregister_resource_template(&self, uri_template: &str) {
        self.inner.resource_templates.remove(uri_template);
        self.broadcast(BroadcastKind::Resources);
    }

    // ========================================================================
    // Outbound surface
    // ========================================================================

    /// Pings the client on a session.
    pub async fn ping(&self, session_id: &str) -> McpResult<PingResult> {
        self.inner.ping_session(session_id).await
    }

    /// Asks the client on a session for an LLM completion. Requires the
    /// client to have advertised the sampling capability.
    pub async fn create_message(
        &self,
        session_id: &str,
        params: CreateMessageParams,
    ) -> McpResult<CreateMessageResult> {
        self.inner.create_message(session_id, params).await
    }

    /// Notifies every session subscribed to `uri` that the resource changed.
    pub async fn notify_resource_updated(&self, uri: &str) -> McpResult<()> {
        self.inner.notify_resource_updated(uri).await
    }

    /// Number of live sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.inner.session_manager.len()
    }

    fn broadcast(&self, kind: BroadcastKind) {
        if self.inner.session_manager.is_empty() {
            return;
        }
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let result = match kind {
                BroadcastKind::Tools => inner.notify_tools_list_changed().await,
                BroadcastKind::Prompts => inner.notify_prompts_list_changed().await,
                BroadcastKind::Resources => inner.notify_resources_list_changed().await,
            };
            if let Err(err) = result {
                warn!(target: targets::SERVER, "send list-changed notification fail: {err}");
            }
        });
    }
}

#[derive(Clone, Copy)]
enum BroadcastKind {
    Tools,
    Prompts,
    Resources,
}
