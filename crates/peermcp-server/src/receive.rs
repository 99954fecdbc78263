//! Inbound message dispatch.
//!
//! The receive path classifies without a full parse, then routes:
//! notifications and responses are handled inline; requests are validated,
//! gated on the handshake state, and dispatched on a fresh task so the
//! receive loop never blocks. Handler panics are contained at the task
//! boundary and surface as internal errors.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use peermcp_core::logging::{debug, error, targets};
use peermcp_core::{McpError, McpResult, INTERNAL_ERROR};
use peermcp_protocol::{
    classify, from_raw, method, to_raw, CancelledParams, JsonRpcError, JsonRpcMessage,
    JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, PingResult, ProgressToken,
};
use peermcp_transport::{ReceiveContext, ReplyReceiver, ServerReceiver};
use serde::Serialize;
use serde_json::value::RawValue;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::{RequestContext, ServerInner};

pub(crate) struct ServerReceiverImpl(pub(crate) Arc<ServerInner>);

#[async_trait]
impl ServerReceiver for ServerReceiverImpl {
    async fn receive(
        &self,
        ctx: ReceiveContext,
        message: &[u8],
    ) -> McpResult<Option<ReplyReceiver>> {
        self.0.receive(ctx, message).await
    }
}

fn encode<T: Serialize>(result: McpResult<T>) -> McpResult<Box<RawValue>> {
    result.and_then(|value| to_raw(&value))
}

impl ServerInner {
    pub(crate) async fn receive(
        self: &Arc<Self>,
        ctx: ReceiveContext,
        message: &[u8],
    ) -> McpResult<Option<ReplyReceiver>> {
        if !ctx.stateless
            && !ctx.session_id.is_empty()
            && !self.session_manager.is_active_session(&ctx.session_id)
        {
            if self.session_manager.is_closed_session(&ctx.session_id) {
                return Err(McpError::session_closed());
            }
            return Err(McpError::session_missing());
        }

        match classify(message)? {
            JsonRpcMessage::Notification(notification) => {
                if let Err(err) = self.receive_notification(&ctx, &notification) {
                    error!(
                        target: targets::SERVER,
                        "receive notify: method={} error: {err}", notification.method
                    );
                    return Err(err);
                }
                Ok(None)
            }
            JsonRpcMessage::Response(response) => {
                if let Err(err) = self.receive_response(&ctx, response) {
                    error!(target: targets::SERVER, "receive response error: {err}");
                    return Err(err);
                }
                Ok(None)
            }
            JsonRpcMessage::Request(request) => self.dispatch_request(ctx, request).map(Some),
        }
    }

    /// Validates and gates a request, then runs its handler on a fresh task.
    fn dispatch_request(
        self: &Arc<Self>,
        ctx: ReceiveContext,
        request: JsonRpcRequest,
    ) -> McpResult<ReplyReceiver> {
        if !request.is_valid() {
            return Err(McpError::invalid_request("request envelope is not valid"));
        }

        if !ctx.stateless {
            if ctx.session_id.is_empty()
                && ctx.new_session.is_none()
                && request.method != method::INITIALIZE
            {
                return Err(McpError::session_missing());
            }
            if request.method != method::INITIALIZE && request.method != method::PING {
                let session = self
                    .session_manager
                    .get(&ctx.session_id)
                    .ok_or_else(McpError::session_missing)?;
                if !session.is_ready() {
                    return Err(McpError::session_not_initialized());
                }
            }
        }

        self.in_fly_requests.add();
        if self.in_shutdown.load(Ordering::Acquire) {
            self.in_fly_requests.done();
            return Err(McpError::shutdown());
        }

        let (tx, rx) = oneshot::channel();
        let inner = self.clone();
        // The handler context is shielded from transport disconnects: it is
        // cancelled only by an explicit cancellation notification or by
        // server shutdown.
        let cancel = self.shutdown_token.child_token();
        let cancel_key =
            (!ctx.session_id.is_empty()).then(|| format!("{}#{}", ctx.session_id, request.id));
        if let Some(key) = &cancel_key {
            self.cancels.insert(key.clone(), cancel.clone());
        }

        tokio::spawn(async move {
            let request_id = request.id.clone();
            let handled = std::panic::AssertUnwindSafe(inner.receive_request(&ctx, request, cancel))
                .catch_unwind()
                .await;
            let response = handled.unwrap_or_else(|_| {
                error!(target: targets::SERVER, "handler panicked: requestID={request_id}");
                JsonRpcResponse::error(
                    request_id.clone(),
                    JsonRpcError {
                        code: INTERNAL_ERROR,
                        message: "handler panicked".to_string(),
                        data: None,
                    },
                )
            });

            match serde_json::to_vec(&response) {
                Ok(bytes) => {
                    let _ = tx.send(bytes);
                }
                Err(err) => {
                    error!(target: targets::SERVER, "marshal response error: {err}");
                }
            }

            if let Some(key) = cancel_key {
                inner.cancels.remove(&key);
            }
            inner.in_fly_requests.done();
        });

        Ok(rx)
    }

    async fn receive_request(
        self: &Arc<Self>,
        ctx: &ReceiveContext,
        request: JsonRpcRequest,
        cancel: CancellationToken,
    ) -> JsonRpcResponse {
        if request.method != method::PING && !ctx.session_id.is_empty() {
            self.session_manager.update_last_active(&ctx.session_id);
        }

        let raw = request.params.as_deref();
        let handler_ctx = self.request_context(ctx, cancel);

        let result = match request.method.as_str() {
            method::PING => encode(Ok(PingResult {})),
            method::INITIALIZE => encode(self.handle_initialize(ctx, raw)),
            method::TOOLS_LIST => encode(self.handle_tools_list(raw)),
            method::TOOLS_CALL => encode(self.handle_tools_call(handler_ctx, raw).await),
            method::PROMPTS_LIST => encode(self.handle_prompts_list(raw)),
            method::PROMPTS_GET => encode(self.handle_prompts_get(handler_ctx, raw).await),
            method::RESOURCES_LIST => encode(self.handle_resources_list(raw)),
            method::RESOURCES_TEMPLATES_LIST => encode(self.handle_resource_templates_list(raw)),
            method::RESOURCES_READ => encode(self.handle_resources_read(handler_ctx, raw).await),
            method::RESOURCES_SUBSCRIBE => {
                encode(self.handle_resources_subscribe(&ctx.session_id, raw))
            }
            method::RESOURCES_UNSUBSCRIBE => {
                encode(self.handle_resources_unsubscribe(&ctx.session_id, raw))
            }
            other => Err(McpError::method_not_found(other)),
        };

        match result {
            Ok(raw) => JsonRpcResponse::success(request.id, raw),
            Err(err) => JsonRpcResponse::error(request.id, JsonRpcError::from(&err)),
        }
    }

    fn receive_notification(
        self: &Arc<Self>,
        ctx: &ReceiveContext,
        notification: &JsonRpcNotification,
    ) -> McpResult<()> {
        if !ctx.stateless {
            let session = self
                .session_manager
                .get(&ctx.session_id)
                .ok_or_else(McpError::session_missing)?;
            if notification.method != method::NOTIFICATION_INITIALIZED && !session.is_ready() {
                return Err(McpError::session_not_initialized());
            }
        }

        match notification.method.as_str() {
            method::NOTIFICATION_INITIALIZED => self.handle_initialized(&ctx.session_id),
            method::NOTIFICATION_CANCELLED => {
                self.handle_cancelled(ctx, notification.params.as_deref())
            }
            other => Err(McpError::method_not_found(other)),
        }
    }

    fn handle_cancelled(&self, ctx: &ReceiveContext, raw: Option<&RawValue>) -> McpResult<()> {
        let params: CancelledParams = from_raw(raw)?;
        let key = format!("{}#{}", ctx.session_id, params.request_id);
        if let Some((_, token)) = self.cancels.remove(&key) {
            debug!(
                target: targets::SERVER,
                "cancelling request: requestID={} reason={:?}", params.request_id, params.reason
            );
            token.cancel();
        }
        Ok(())
    }

    fn receive_response(&self, ctx: &ReceiveContext, response: JsonRpcResponse) -> McpResult<()> {
        let session = self
            .session_manager
            .get(&ctx.session_id)
            .ok_or_else(McpError::session_missing)?;
        if !session.is_ready() {
            return Err(McpError::session_not_initialized());
        }
        session.pending().deliver(response)
    }

    fn request_context(
        self: &Arc<Self>,
        ctx: &ReceiveContext,
        cancel: CancellationToken,
    ) -> RequestContext {
        RequestContext::new(
            (!ctx.session_id.is_empty()).then(|| ctx.session_id.clone()),
            None,
            cancel,
            ctx.query.clone(),
            Some(self.clone()),
        )
    }
}

impl RequestContext {
    pub(crate) fn with_progress_token(mut self, token: Option<ProgressToken>) -> Self {
        self.progress_token = token;
        self
    }
}
