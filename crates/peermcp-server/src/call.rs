//! Server-to-client calls and notification fan-out.

use std::sync::Arc;
use std::time::Duration;

use peermcp_core::logging::{targets, warn};
use peermcp_core::{McpError, McpResult};
use peermcp_protocol::{
    method, from_raw, to_raw, CancelledParams, CreateMessageParams, CreateMessageResult,
    PingParams, PingResult, RequestId, ResourceUpdatedParams,
};
use serde_json::value::RawValue;

use crate::session::SessionState;
use crate::ServerInner;

/// Budget for a server-to-client call, matching the heartbeat ping timeout.
const CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Removes the pending slot when the waiter gives up or finishes.
struct PendingGuard {
    session: Arc<SessionState>,
    id: RequestId,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.session.pending().remove(&self.id);
    }
}

impl ServerInner {
    /// Sends a request to the client on `session_id` and awaits the response.
    ///
    /// On timeout a `notifications/cancelled` is sent to the peer on a
    /// detached task and the caller sees a cancel error.
    pub(crate) async fn call_client(
        self: &Arc<Self>,
        session_id: &str,
        method_name: &str,
        params: Option<Box<RawValue>>,
        timeout: Duration,
    ) -> McpResult<Box<RawValue>> {
        let session = self
            .session_manager
            .get(session_id)
            .ok_or_else(McpError::session_missing)?;

        let id = RequestId::Number(session.next_request_id());
        let rx = session.pending().register(id.clone());
        let _guard = PendingGuard {
            session: session.clone(),
            id: id.clone(),
        };

        self.send_request(session_id, id.clone(), method_name, params)
            .await?;

        let response = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(McpError::connection("response channel dropped")),
            Err(_) => {
                let inner = self.clone();
                let session_id = session_id.to_string();
                tokio::spawn(async move {
                    let params = CancelledParams {
                        request_id: id,
                        reason: Some("deadline exceeded".to_string()),
                    };
                    let raw = match to_raw(&params) {
                        Ok(raw) => raw,
                        Err(_) => return,
                    };
                    if let Err(err) = inner
                        .send_notification(&session_id, method::NOTIFICATION_CANCELLED, Some(raw))
                        .await
                    {
                        warn!(target: targets::SERVER, "failed to send cancellation notification: {err}");
                    }
                });
                return Err(McpError::cancelled("deadline exceeded"));
            }
        };

        if let Some(error) = response.error {
            return Err(McpError::from_wire(error.code, error.message, error.data));
        }
        response
            .result
            .ok_or_else(|| McpError::internal("response carries neither result nor error"))
    }

    /// Pings the client on a session. This is the heartbeat's probe and uses
    /// the same code path as any other server-to-client call.
    pub(crate) async fn ping_session(self: &Arc<Self>, session_id: &str) -> McpResult<PingResult> {
        let raw = self
            .call_client(
                session_id,
                method::PING,
                Some(to_raw(&PingParams {})?),
                CALL_TIMEOUT,
            )
            .await?;
        from_raw(Some(&raw))
    }

    /// Requests an LLM completion from the client, gated on the sampling
    /// capability it advertised at initialize.
    pub(crate) async fn create_message(
        self: &Arc<Self>,
        session_id: &str,
        params: CreateMessageParams,
    ) -> McpResult<CreateMessageResult> {
        let session = self
            .session_manager
            .get(session_id)
            .ok_or_else(McpError::session_missing)?;
        let supports_sampling = session
            .client_capabilities()
            .is_some_and(|caps| caps.sampling.is_some());
        if !supports_sampling {
            return Err(McpError::not_supported());
        }

        let raw = self
            .call_client(
                session_id,
                method::SAMPLING_CREATE_MESSAGE,
                Some(to_raw(&params)?),
                CALL_TIMEOUT,
            )
            .await?;
        from_raw(Some(&raw))
    }

    pub(crate) async fn notify_tools_list_changed(&self) -> McpResult<()> {
        if !self.capabilities.tools.as_ref().is_some_and(|t| t.list_changed) {
            return Err(McpError::not_supported());
        }
        self.broadcast_notification(method::NOTIFICATION_TOOLS_LIST_CHANGED)
            .await
    }

    pub(crate) async fn notify_prompts_list_changed(&self) -> McpResult<()> {
        if !self
            .capabilities
            .prompts
            .as_ref()
            .is_some_and(|p| p.list_changed)
        {
            return Err(McpError::not_supported());
        }
        self.broadcast_notification(method::NOTIFICATION_PROMPTS_LIST_CHANGED)
            .await
    }

    pub(crate) async fn notify_resources_list_changed(&self) -> McpResult<()> {
        if !self
            .capabilities
            .resources
            .as_ref()
            .is_some_and(|r| r.list_changed)
        {
            return Err(McpError::not_supported());
        }
        self.broadcast_notification(method::NOTIFICATION_RESOURCES_LIST_CHANGED)
            .await
    }

    /// Notifies every subscribed session that `uri` changed, gated on the
    /// subscribe capability.
    pub(crate) async fn notify_resource_updated(&self, uri: &str) -> McpResult<()> {
        if !self
            .capabilities
            .resources
            .as_ref()
            .is_some_and(|r| r.subscribe)
        {
            return Err(McpError::not_supported());
        }

        let params = to_raw(&ResourceUpdatedParams {
            uri: uri.to_string(),
        })?;

        let mut targets_list = Vec::new();
        self.session_manager.range(|session_id, session| {
            if session.is_subscribed(uri) {
                targets_list.push(session_id.to_string());
            }
            true
        });

        let mut failures = Vec::new();
        for session_id in targets_list {
            if let Err(err) = self
                .send_notification(
                    &session_id,
                    method::NOTIFICATION_RESOURCES_UPDATED,
                    Some(params.clone()),
                )
                .await
            {
                failures.push(format!("sessionID={session_id}, err: {err}"));
            }
        }
        join_failures(failures)
    }

    async fn broadcast_notification(&self, method_name: &str) -> McpResult<()> {
        let mut session_ids = Vec::new();
        self.session_manager.range(|session_id, _| {
            session_ids.push(session_id.to_string());
            true
        });

        let mut failures = Vec::new();
        for session_id in session_ids {
            if let Err(err) = self.send_notification(&session_id, method_name, None).await {
                failures.push(format!("sessionID={session_id}, err: {err}"));
            }
        }
        join_failures(failures)
    }
}

fn join_failures(failures: Vec<String>) -> McpResult<()> {
    if failures.is_empty() {
        Ok(())
    } else {
        Err(McpError::internal(failures.join("; ")))
    }
}
