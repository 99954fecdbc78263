//! Inbound message dispatch on the client side.
//!
//! Progress notifications are handled synchronously on the receive path so
//! they reach the tool-call waiter before the matching response; every other
//! notification and server-initiated request runs on a fresh task.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use peermcp_core::logging::{error, targets};
use peermcp_core::{McpError, McpResult};
use peermcp_protocol::{
    classify, from_raw, method, to_raw, CreateMessageResult, JsonRpcError, JsonRpcMessage,
    JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, PingResult, ProgressParams,
};
use peermcp_transport::ClientReceiver;
use serde_json::value::RawValue;

use crate::ClientInner;

/// Budget for handing a progress notification to its sink; stalled sinks
/// drop the notification rather than stall dispatch.
const PROGRESS_DELIVERY_TIMEOUT: Duration = Duration::from_secs(1);

pub(crate) struct ClientReceiverImpl(pub(crate) Arc<ClientInner>);

#[async_trait]
impl ClientReceiver for ClientReceiverImpl {
    async fn receive(&self, message: &[u8]) -> McpResult<()> {
        self.0.receive(message).await
    }

    fn interrupt(&self, error: McpError) {
        // Fail every pending call so waiters see the connection fault.
        self.0.pending.fail_all(&error);
    }
}

impl ClientInner {
    pub(crate) async fn receive(self: &Arc<Self>, message: &[u8]) -> McpResult<()> {
        match classify(message)? {
            JsonRpcMessage::Notification(notification)
                if notification.method == method::NOTIFICATION_PROGRESS =>
            {
                // Synchronous so it is visible before any later response.
                if let Err(err) = self.handle_progress(notification.params.as_deref()).await {
                    error!(target: targets::CLIENT, "receive notify: method={} error: {err}", method::NOTIFICATION_PROGRESS);
                    return Err(err);
                }
                Ok(())
            }
            JsonRpcMessage::Notification(notification) => {
                let inner = self.clone();
                tokio::spawn(async move {
                    if let Err(err) = inner.dispatch_notification(&notification) {
                        error!(
                            target: targets::CLIENT,
                            "receive notify: method={} error: {err}", notification.method
                        );
                    }
                });
                Ok(())
            }
            JsonRpcMessage::Response(response) => self.pending.deliver(response),
            JsonRpcMessage::Request(request) => {
                let inner = self.clone();
                tokio::spawn(async move {
                    let request_method = request.method.clone();
                    if let Err(err) = inner.handle_request(request).await {
                        error!(
                            target: targets::CLIENT,
                            "receive request: method={request_method} error: {err}"
                        );
                    }
                });
                Ok(())
            }
        }
    }

    async fn handle_progress(&self, raw: Option<&RawValue>) -> McpResult<()> {
        let params: ProgressParams = from_raw(raw)?;
        let key = params.progress_token.to_string();

        let Some(sink) = self.progress_sinks.get(&key).map(|s| s.value().clone()) else {
            return Err(McpError::internal("progress token not found"));
        };
        sink.send_timeout(params, PROGRESS_DELIVERY_TIMEOUT)
            .await
            .map_err(|_| McpError::internal("progress sink not drained; dropping notification"))
    }

    fn dispatch_notification(&self, notification: &JsonRpcNotification) -> McpResult<()> {
        match notification.method.as_str() {
            method::NOTIFICATION_TOOLS_LIST_CHANGED => {
                self.notification_handler.on_tools_list_changed();
                Ok(())
            }
            method::NOTIFICATION_PROMPTS_LIST_CHANGED => {
                self.notification_handler.on_prompts_list_changed();
                Ok(())
            }
            method::NOTIFICATION_RESOURCES_LIST_CHANGED => {
                self.notification_handler.on_resources_list_changed();
                Ok(())
            }
            method::NOTIFICATION_RESOURCES_UPDATED => {
                let params = from_raw(notification.params.as_deref())?;
                self.notification_handler.on_resource_updated(params);
                Ok(())
            }
            other => Err(McpError::method_not_found(other)),
        }
    }

    async fn handle_request(self: &Arc<Self>, request: JsonRpcRequest) -> McpResult<()> {
        if !request.is_valid() {
            return Err(McpError::invalid_request("request envelope is not valid"));
        }

        let result = match request.method.as_str() {
            method::PING => to_raw(&PingResult {}),
            method::SAMPLING_CREATE_MESSAGE => self
                .handle_create_message(request.params.as_deref())
                .await
                .and_then(|result| to_raw(&result)),
            other => Err(McpError::method_not_found(other)),
        };

        let response = match result {
            Ok(raw) => JsonRpcResponse::success(request.id, raw),
            Err(err) => JsonRpcResponse::error(request.id, JsonRpcError::from(&err)),
        };
        let bytes = serde_json::to_vec(&response)?;
        self.transport.send(&bytes).await
    }

    async fn handle_create_message(
        &self,
        raw: Option<&RawValue>,
    ) -> McpResult<CreateMessageResult> {
        if self.client_capabilities.sampling.is_none() {
            return Err(McpError::not_supported());
        }
        let handler = self
            .sampling_handler
            .clone()
            .ok_or_else(McpError::not_supported)?;
        let params = from_raw(raw)?;
        handler.create_message(params).await
    }
}
