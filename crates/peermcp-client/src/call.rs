//! Outbound calls to the server.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use peermcp_core::logging::{targets, warn};
use peermcp_core::{ErrorCode, McpError, McpResult};
use peermcp_protocol::{
    from_raw, is_supported_version, method, to_raw, CallToolParams, CallToolResult,
    CancelledParams, Cursor, GetPromptParams, GetPromptResult, InitializeParams, InitializeResult,
    JsonRpcNotification, JsonRpcRequest, ListPromptsParams, ListPromptsResult,
    ListResourceTemplatesParams, ListResourceTemplatesResult, ListResourcesParams,
    ListResourcesResult, ListToolsParams, ListToolsResult, PingParams, PingResult, ProgressParams,
    ReadResourceParams, ReadResourceResult, RequestId, ServerCapabilities, SubscribeParams,
    SubscribeResult, UnsubscribeParams, UnsubscribeResult, LATEST_PROTOCOL_VERSION,
};
use serde_json::value::RawValue;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::ClientInner;

/// Removes the pending slot when the waiter finishes or gives up.
struct PendingGuard {
    inner: Arc<ClientInner>,
    id: RequestId,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.inner.pending.remove(&self.id);
    }
}

impl ClientInner {
    /// Runs the initialize handshake: send `initialize`, verify the version,
    /// send `notifications/initialized`, record the server snapshot, and
    /// flip ready.
    pub(crate) async fn initialize(self: &Arc<Self>) -> McpResult<InitializeResult> {
        let params = InitializeParams {
            protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
            capabilities: self.client_capabilities.clone(),
            client_info: self.client_info.clone(),
        };

        let raw = self
            .call_server(method::INITIALIZE, Some(to_raw(&params)?), None)
            .await?;
        let result: InitializeResult = from_raw(Some(&raw))?;

        if !is_supported_version(&result.protocol_version) {
            return Err(McpError::internal(format!(
                "protocol version not supported, supported latest version is {LATEST_PROTOCOL_VERSION}"
            )));
        }

        self.send_notification(method::NOTIFICATION_INITIALIZED, None)
            .await
            .map_err(|err| {
                McpError::new(
                    err.code,
                    format!("failed to send initialized notification: {err}"),
                )
            })?;

        *self.server_info.write() = Some(result.server_info.clone());
        *self.server_capabilities.write() = Some(result.capabilities.clone());
        *self.server_instructions.write() = result.instructions.clone();
        self.ready.store(true, Ordering::Release);

        Ok(result)
    }

    /// Re-runs initialize after a "session closed" send failure, under a
    /// double-checked mutex so concurrent callers hand off one handshake.
    /// The original capabilities snapshot is reused.
    pub(crate) fn reinitialize(self: &Arc<Self>) -> BoxFuture<'static, McpResult<()>> {
        let inner = self.clone();
        Box::pin(async move {
            inner.ready.store(false, Ordering::Release);

            let _guard = inner.init_lock.lock().await;
            if inner.ready.load(Ordering::Acquire) {
                return Ok(());
            }
            inner.initialize().await?;
            Ok(())
        })
    }

    async fn send_request(
        self: &Arc<Self>,
        id: &RequestId,
        method_name: &str,
        params: Option<Box<RawValue>>,
        allow_reinit: bool,
    ) -> McpResult<()> {
        let request = JsonRpcRequest::new(id.clone(), method_name, params);
        let bytes = serde_json::to_vec(&request)?;

        match self.transport.send(&bytes).await {
            Ok(()) => Ok(()),
            Err(err) if err.code == ErrorCode::SessionClosed && allow_reinit => {
                self.reinitialize().await?;
                self.transport.send(&bytes).await
            }
            Err(err) => Err(McpError::new(
                err.code,
                format!("send request: transport send: {err}"),
            )),
        }
    }

    pub(crate) async fn send_notification(
        &self,
        method_name: &str,
        params: Option<Box<RawValue>>,
    ) -> McpResult<()> {
        let notification = JsonRpcNotification::new(method_name, params);
        let bytes = serde_json::to_vec(&notification)?;
        self.transport.send(&bytes).await
    }

    /// Sends a request and awaits its response slot.
    ///
    /// With a deadline set, expiry sends `notifications/cancelled` to the
    /// server on a detached task and returns a cancel error.
    pub(crate) async fn call_server(
        self: &Arc<Self>,
        method_name: &str,
        params: Option<Box<RawValue>>,
        timeout: Option<Duration>,
    ) -> McpResult<Box<RawValue>> {
        if !self.ready.load(Ordering::Acquire)
            && method_name != method::INITIALIZE
            && method_name != method::PING
        {
            return Err(McpError::internal("call server: client not ready"));
        }

        let id = RequestId::Number(self.next_request_id.fetch_add(1, Ordering::AcqRel) + 1);
        let rx = self.pending.register(id.clone());
        let _guard = PendingGuard {
            inner: self.clone(),
            id: id.clone(),
        };

        self.send_request(&id, method_name, params, method_name != method::INITIALIZE)
            .await?;

        let response = match timeout {
            None => rx
                .await
                .map_err(|_| McpError::connection("response channel dropped"))?,
            Some(deadline) => match tokio::time::timeout(deadline, rx).await {
                Ok(Ok(response)) => response,
                Ok(Err(_)) => return Err(McpError::connection("response channel dropped")),
                Err(_) => {
                    let inner = self.clone();
                    tokio::spawn(async move {
                        let params = CancelledParams {
                            request_id: id,
                            reason: Some("deadline exceeded".to_string()),
                        };
                        let Ok(raw) = to_raw(&params) else { return };
                        if let Err(err) = inner
                            .send_notification(method::NOTIFICATION_CANCELLED, Some(raw))
                            .await
                        {
                            warn!(target: targets::CLIENT, "failed to send cancellation notification: {err}");
                        }
                    });
                    return Err(McpError::cancelled("deadline exceeded"));
                }
            },
        };

        if let Some(error) = response.error {
            return Err(McpError::from_wire(error.code, error.message, error.data));
        }
        response
            .result
            .ok_or_else(|| McpError::internal("response carries neither result nor error"))
    }

    fn capabilities_snapshot(&self) -> McpResult<ServerCapabilities> {
        self.server_capabilities
            .read()
            .clone()
            .ok_or_else(|| McpError::internal("call server: client not ready"))
    }

    pub(crate) async fn ping(self: &Arc<Self>) -> McpResult<PingResult> {
        let raw = self
            .call_server(method::PING, Some(to_raw(&PingParams {})?), None)
            .await?;
        from_raw(Some(&raw))
    }

    pub(crate) async fn list_tools(
        self: &Arc<Self>,
        cursor: Option<Cursor>,
    ) -> McpResult<ListToolsResult> {
        if self.capabilities_snapshot()?.tools.is_none() {
            return Err(McpError::not_supported());
        }
        let raw = self
            .call_server(
                method::TOOLS_LIST,
                Some(to_raw(&ListToolsParams { cursor })?),
                None,
            )
            .await?;
        from_raw(Some(&raw))
    }

    pub(crate) async fn call_tool(
        self: &Arc<Self>,
        params: CallToolParams,
        timeout: Option<Duration>,
    ) -> McpResult<CallToolResult> {
        if self.capabilities_snapshot()?.tools.is_none() {
            return Err(McpError::not_supported());
        }
        let raw = self
            .call_server(method::TOOLS_CALL, Some(to_raw(&params)?), timeout)
            .await?;
        from_raw(Some(&raw))
    }

    /// Invokes a tool with a progress channel: mints a token, registers the
    /// sink, stamps `_meta.progressToken`, and unregisters the sink when the
    /// call returns.
    pub(crate) async fn call_tool_with_progress(
        self: &Arc<Self>,
        mut params: CallToolParams,
        progress: mpsc::Sender<ProgressParams>,
    ) -> McpResult<CallToolResult> {
        let token = Uuid::new_v4().to_string();
        self.progress_sinks.insert(token.clone(), progress);

        let mut meta = params.meta.take().unwrap_or_default();
        meta.progress_token = Some(token.clone().into());
        params.meta = Some(meta);

        let result = self.call_tool(params, None).await;
        self.progress_sinks.remove(&token);
        result
    }

    pub(crate) async fn list_prompts(
        self: &Arc<Self>,
        cursor: Option<Cursor>,
    ) -> McpResult<ListPromptsResult> {
        if self.capabilities_snapshot()?.prompts.is_none() {
            return Err(McpError::not_supported());
        }
        let raw = self
            .call_server(
                method::PROMPTS_LIST,
                Some(to_raw(&ListPromptsParams { cursor })?),
                None,
            )
            .await?;
        from_raw(Some(&raw))
    }

    pub(crate) async fn get_prompt(
        self: &Arc<Self>,
        params: GetPromptParams,
    ) -> McpResult<GetPromptResult> {
        if self.capabilities_snapshot()?.prompts.is_none() {
            return Err(McpError::not_supported());
        }
        let raw = self
            .call_server(method::PROMPTS_GET, Some(to_raw(&params)?), None)
            .await?;
        from_raw(Some(&raw))
    }

    pub(crate) async fn list_resources(
        self: &Arc<Self>,
        cursor: Option<Cursor>,
    ) -> McpResult<ListResourcesResult> {
        if self.capabilities_snapshot()?.resources.is_none() {
            return Err(McpError::not_supported());
        }
        let raw = self
            .call_server(
                method::RESOURCES_LIST,
                Some(to_raw(&ListResourcesParams { cursor })?),
                None,
            )
            .await?;
        from_raw(Some(&raw))
    }

    pub(crate) async fn list_resource_templates(
        self: &Arc<Self>,
        cursor: Option<Cursor>,
    ) -> McpResult<ListResourceTemplatesResult> {
        if self.capabilities_snapshot()?.resources.is_none() {
            return Err(McpError::not_supported());
        }
        let raw = self
            .call_server(
                method::RESOURCES_TEMPLATES_LIST,
                Some(to_raw(&ListResourceTemplatesParams { cursor })?),
                None,
            )
            .await?;
        from_raw(Some(&raw))
    }

    pub(crate) async fn read_resource(
        self: &Arc<Self>,
        params: ReadResourceParams,
    ) -> McpResult<ReadResourceResult> {
        if self.capabilities_snapshot()?.resources.is_none() {
            return Err(McpError::not_supported());
        }
        let raw = self
            .call_server(method::RESOURCES_READ, Some(to_raw(&params)?), None)
            .await?;
        from_raw(Some(&raw))
    }

    pub(crate) async fn subscribe_resource(
        self: &Arc<Self>,
        uri: &str,
    ) -> McpResult<SubscribeResult> {
        let supports = self
            .capabilities_snapshot()?
            .resources
            .is_some_and(|r| r.subscribe);
        if !supports {
            return Err(McpError::not_supported());
        }
        let params = SubscribeParams {
            uri: uri.to_string(),
        };
        let raw = self
            .call_server(method::RESOURCES_SUBSCRIBE, Some(to_raw(&params)?), None)
            .await?;
        from_raw(Some(&raw))
    }

    pub(crate) async fn unsubscribe_resource(
        self: &Arc<Self>,
        uri: &str,
    ) -> McpResult<UnsubscribeResult> {
        let supports = self
            .capabilities_snapshot()?
            .resources
            .is_some_and(|r| r.subscribe);
        if !supports {
            return Err(McpError::not_supported());
        }
        let params = UnsubscribeParams {
            uri: uri.to_string(),
        };
        let raw = self
            .call_server(method::RESOURCES_UNSUBSCRIBE, Some(to_raw(&params)?), None)
            .await?;
        from_raw(Some(&raw))
    }
}
