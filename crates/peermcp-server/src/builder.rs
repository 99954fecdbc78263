//! Server construction.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use peermcp_core::WaitGroup;
use peermcp_protocol::{ServerCapabilities, ServerInfo};
use peermcp_transport::ServerTransport;
use tokio_util::sync::CancellationToken;

use crate::middleware::{RateLimitConfig, RateLimiters};
use crate::receive::ServerReceiverImpl;
use crate::session::SessionManager;
use crate::{Server, ServerInner};

/// Builds a [`Server`].
pub struct ServerBuilder {
    transport: Arc<dyn ServerTransport>,
    server_info: ServerInfo,
    capabilities: ServerCapabilities,
    instructions: Option<String>,
    pagination_limit: usize,
    session_max_idle_time: Option<Duration>,
    rate_limits: Option<RateLimitConfig>,
}

impl ServerBuilder {
    pub(crate) fn new(transport: Arc<dyn ServerTransport>) -> Self {
        Self {
            transport,
            server_info: ServerInfo::default(),
            capabilities: ServerCapabilities::all(),
            instructions: None,
            pagination_limit: 0,
            session_max_idle_time: None,
            rate_limits: None,
        }
    }

    /// Sets the identity reported at initialize.
    #[must_use]
    pub fn with_server_info(mut self, server_info: ServerInfo) -> Self {
        self.server_info = server_info;
        self
    }

    /// Overrides the advertised capabilities (default: everything enabled).
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: ServerCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Usage instructions returned to clients at initialize.
    #[must_use]
    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    /// Page size for registry listings; `0` disables pagination.
    #[must_use]
    pub fn with_pagination_limit(mut self, limit: usize) -> Self {
        self.pagination_limit = limit;
        self
    }

    /// Idle duration after which the heartbeat reaps a session; `None`
    /// disables idle reaping.
    #[must_use]
    pub fn with_session_max_idle_time(mut self, max_idle_time: Duration) -> Self {
        self.session_max_idle_time = Some(max_idle_time);
        self
    }

    /// Token-bucket rate limits applied to every registered tool.
    #[must_use]
    pub fn with_rate_limits(mut self, config: RateLimitConfig) -> Self {
        self.rate_limits = Some(config);
        self
    }

    /// Builds the server and wires it to the transport.
    #[must_use]
    pub fn build(self) -> Server {
        let session_manager = Arc::new(SessionManager::new(self.session_max_idle_time));

        let inner = Arc::new(ServerInner {
            transport: self.transport,
            tools: DashMap::new(),
            prompts: DashMap::new(),
            resources: DashMap::new(),
            resource_templates: DashMap::new(),
            session_manager: session_manager.clone(),
            in_shutdown: AtomicBool::new(false),
            in_fly_requests: WaitGroup::new(),
            shutdown_token: CancellationToken::new(),
            cancels: DashMap::new(),
            capabilities: self.capabilities,
            server_info: self.server_info,
            instructions: self.instructions,
            pagination_limit: self.pagination_limit,
            rate_limiters: self.rate_limits.map(RateLimiters::new),
        });

        inner
            .transport
            .set_receiver(Arc::new(ServerReceiverImpl(inner.clone())));
        inner.transport.set_session_registry(session_manager);

        Server { inner }
    }
}
