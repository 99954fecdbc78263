//! Pending-response correlation.
//!
//! Every outbound request registers a single-capacity response slot keyed by
//! request id. The dispatcher delivers exactly one response into each slot; a
//! second response for the same id is a duplicate-response protocol error
//! rather than a blocked sender.

use dashmap::DashMap;
use parking_lot::Mutex;
use peermcp_core::logging::{targets, warn};
use peermcp_core::{McpError, McpResult};
use peermcp_protocol::{JsonRpcError, JsonRpcResponse, RequestId};
use tokio::sync::oneshot;

/// A single-delivery response slot.
pub struct ResponseSlot {
    tx: Mutex<Option<oneshot::Sender<JsonRpcResponse>>>,
}

impl ResponseSlot {
    fn new(tx: oneshot::Sender<JsonRpcResponse>) -> Self {
        Self {
            tx: Mutex::new(Some(tx)),
        }
    }

    /// Delivers a response. Errors when the slot was already used.
    fn deliver(&self, response: JsonRpcResponse) -> McpResult<()> {
        let Some(tx) = self.tx.lock().take() else {
            return Err(McpError::duplicate_response(format!(
                "duplicate response received: requestID={}",
                response.id
            )));
        };
        // The waiter may have given up (timeout or cancel); that is not an
        // error for the deliverer.
        let _ = tx.send(response);
        Ok(())
    }
}

/// The outbound-request map: request id to response slot.
///
/// Slots stay registered (drained) after delivery until the waiter
/// unregisters them, so late duplicates are detected rather than mistaken
/// for unknown ids.
#[derive(Default)]
pub struct PendingRequests {
    slots: DashMap<RequestId, ResponseSlot>,
}

impl PendingRequests {
    /// Creates an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a slot for an outbound request id and returns the waiter's
    /// end. The caller must [`remove`](Self::remove) the id when done.
    pub fn register(&self, id: RequestId) -> oneshot::Receiver<JsonRpcResponse> {
        let (tx, rx) = oneshot::channel();
        self.slots.insert(id, ResponseSlot::new(tx));
        rx
    }

    /// Unregisters a request id.
    pub fn remove(&self, id: &RequestId) {
        self.slots.remove(id);
    }

    /// Routes a response into its slot.
    ///
    /// Unknown ids are an error; duplicates are logged and dropped.
    pub fn deliver(&self, response: JsonRpcResponse) -> McpResult<()> {
        let Some(slot) = self.slots.get(&response.id) else {
            return Err(McpError::internal(format!(
                "no pending request for response: requestID={}",
                response.id
            )));
        };
        if let Err(err) = slot.deliver(response) {
            warn!(target: targets::TRANSPORT, "{err}");
        }
        Ok(())
    }

    /// Fails every waiting slot with a connection error. Used when the
    /// underlying connection is interrupted.
    pub fn fail_all(&self, error: &McpError) {
        for entry in self.slots.iter() {
            let response = JsonRpcResponse::error(
                entry.key().clone(),
                JsonRpcError {
                    code: error.code.json_rpc_code(),
                    message: error.message.clone(),
                    data: None,
                },
            );
            let _ = entry.value().deliver(response);
        }
    }

    /// Number of outstanding requests.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// True when no requests are outstanding.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peermcp_protocol::to_raw;

    fn response(id: i64) -> JsonRpcResponse {
        JsonRpcResponse::success(RequestId::Number(id), to_raw(&serde_json::json!({})).unwrap())
    }

    #[tokio::test]
    async fn deliver_reaches_waiter() {
        let pending = PendingRequests::new();
        let rx = pending.register(RequestId::Number(1));
        pending.deliver(response(1)).unwrap();
        let resp = rx.await.unwrap();
        assert_eq!(resp.id, RequestId::Number(1));
    }

    #[tokio::test]
    async fn unknown_id_is_an_error() {
        let pending = PendingRequests::new();
        assert!(pending.deliver(response(9)).is_err());
    }

    #[tokio::test]
    async fn duplicate_is_dropped_not_blocked() {
        let pending = PendingRequests::new();
        let rx = pending.register(RequestId::Number(1));
        pending.deliver(response(1)).unwrap();
        // Second delivery for the same id: logged and dropped.
        pending.deliver(response(1)).unwrap();
        drop(rx);
        pending.remove(&RequestId::Number(1));
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn fail_all_errors_every_waiter() {
        let pending = PendingRequests::new();
        let rx1 = pending.register(RequestId::Number(1));
        let rx2 = pending.register(RequestId::String("b".into()));
        pending.fail_all(&McpError::connection("stream interrupted"));
        assert!(rx1.await.unwrap().is_error());
        assert!(rx2.await.unwrap().is_error());
    }
}
