//! Outbound message assembly.

use std::sync::Arc;

use peermcp_core::{McpError, McpResult};
use peermcp_protocol::{JsonRpcNotification, JsonRpcRequest, RequestId};
use serde_json::value::RawValue;

use crate::ServerInner;

impl ServerInner {
    pub(crate) async fn send_request(
        self: &Arc<Self>,
        session_id: &str,
        id: RequestId,
        method: &str,
        params: Option<Box<RawValue>>,
    ) -> McpResult<()> {
        let request = JsonRpcRequest::new(id, method, params);
        let message = serde_json::to_vec(&request)?;
        self.transport
            .send(session_id, message)
            .await
            .map_err(|err| McpError::new(err.code, format!("send request: transport send: {err}")))
    }

    pub(crate) async fn send_notification(
        &self,
        session_id: &str,
        method: &str,
        params: Option<Box<RawValue>>,
    ) -> McpResult<()> {
        let notification = JsonRpcNotification::new(method, params);
        let message = serde_json::to_vec(&notification)?;
        self.transport
            .send(session_id, message)
            .await
            .map_err(|err| {
                McpError::new(err.code, format!("send notification: transport send: {err}"))
            })
    }
}
