//! Client engine tests over a scripted transport.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use peermcp_core::{ErrorCode, McpError, McpResult};
use peermcp_protocol::{
    classify, to_raw, CallToolParams, CallToolResult, ClientInfo, InitializeResult, JsonRpcMessage,
    JsonRpcRequest, JsonRpcResponse, ServerCapabilities, ServerInfo, LATEST_PROTOCOL_VERSION,
};
use peermcp_transport::{ClientReceiver, ClientTransport};

use crate::Client;

/// A transport scripted for handshake and tool calls. The server side is
/// simulated inline: initialize and tools/call get canned responses, and a
/// one-shot "session closed" failure can be armed to exercise the
/// re-initialization path.
#[derive(Default)]
struct ScriptedTransport {
    receiver: RwLock<Option<Arc<dyn ClientReceiver>>>,
    initialize_count: AtomicUsize,
    fail_next_request: AtomicBool,
    sent_methods: Mutex<Vec<String>>,
}

impl ScriptedTransport {
    fn arm_session_loss(&self) {
        self.fail_next_request.store(true, Ordering::Release);
    }

    fn initialize_count(&self) -> usize {
        self.initialize_count.load(Ordering::Acquire)
    }

    fn sent_methods(&self) -> Vec<String> {
        self.sent_methods.lock().clone()
    }

    async fn respond(&self, response: JsonRpcResponse) -> McpResult<()> {
        let receiver = self
            .receiver
            .read()
            .clone()
            .ok_or_else(|| McpError::internal("no receiver"))?;
        let bytes = serde_json::to_vec(&response)?;
        receiver.receive(&bytes).await
    }

    async fn handle_request(&self, request: JsonRpcRequest) -> McpResult<()> {
        match request.method.as_str() {
            "initialize" => {
                self.initialize_count.fetch_add(1, Ordering::AcqRel);
                let result = InitializeResult {
                    protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
                    capabilities: ServerCapabilities::all(),
                    server_info: ServerInfo {
                        name: "scripted".into(),
                        version: "1".into(),
                    },
                    instructions: None,
                };
                self.respond(JsonRpcResponse::success(request.id, to_raw(&result)?))
                    .await
            }
            "ping" => {
                self.respond(JsonRpcResponse::success(
                    request.id,
                    to_raw(&serde_json::json!({}))?,
                ))
                .await
            }
            "tools/call" => {
                self.respond(JsonRpcResponse::success(
                    request.id,
                    to_raw(&CallToolResult::text("ok"))?,
                ))
                .await
            }
            other => Err(McpError::method_not_found(other)),
        }
    }
}

#[async_trait]
impl ClientTransport for ScriptedTransport {
    async fn start(&self) -> McpResult<()> {
        Ok(())
    }

    async fn send(&self, message: &[u8]) -> McpResult<()> {
        match classify(message)? {
            JsonRpcMessage::Request(request) => {
                self.sent_methods.lock().push(request.method.clone());
                if request.method != "initialize"
                    && self.fail_next_request.swap(false, Ordering::AcqRel)
                {
                    return Err(McpError::session_closed());
                }
                self.handle_request(request).await
            }
            JsonRpcMessage::Notification(notification) => {
                self.sent_methods.lock().push(notification.method);
                Ok(())
            }
            JsonRpcMessage::Response(_) => Ok(()),
        }
    }

    fn set_receiver(&self, receiver: Arc<dyn ClientReceiver>) {
        *self.receiver.write() = Some(receiver);
    }

    async fn close(&self) -> McpResult<()> {
        Ok(())
    }
}

async fn connect(transport: Arc<ScriptedTransport>) -> Client {
    Client::builder()
        .with_client_info(ClientInfo {
            name: "c".into(),
            version: "1".into(),
        })
        .connect(transport)
        .await
        .expect("client connects")
}

#[tokio::test]
async fn handshake_sends_initialize_then_initialized() {
    let transport = Arc::new(ScriptedTransport::default());
    let client = connect(transport.clone()).await;

    assert_eq!(transport.initialize_count(), 1);
    let methods = transport.sent_methods();
    let init_pos = methods.iter().position(|m| m == "initialize").unwrap();
    let notified_pos = methods
        .iter()
        .position(|m| m == "notifications/initialized")
        .unwrap();
    assert!(init_pos < notified_pos);
    assert_eq!(client.server_info().unwrap().name, "scripted");
    assert!(client.server_capabilities().unwrap().tools.is_some());
}

#[tokio::test]
async fn session_loss_triggers_one_reinitialize_and_the_call_succeeds() {
    let transport = Arc::new(ScriptedTransport::default());
    let client = connect(transport.clone()).await;
    assert_eq!(transport.initialize_count(), 1);

    transport.arm_session_loss();
    let result = client
        .call_tool(CallToolParams::new("t", None))
        .await
        .expect("call succeeds after transparent re-initialization");
    assert!(!result.is_error);

    // Two initialize requests with distinct ids appeared on the wire.
    assert_eq!(transport.initialize_count(), 2);
    let inits = transport
        .sent_methods()
        .iter()
        .filter(|m| *m == "initialize")
        .count();
    assert_eq!(inits, 2);
}

#[tokio::test]
async fn calls_are_gated_on_server_capabilities() {
    // A server advertising no prompt support: the client refuses locally.
    #[derive(Default)]
    struct NoPrompts(ScriptedTransport);

    #[async_trait]
    impl ClientTransport for NoPrompts {
        async fn start(&self) -> McpResult<()> {
            Ok(())
        }

        async fn send(&self, message: &[u8]) -> McpResult<()> {
            match classify(message)? {
                JsonRpcMessage::Request(request) if request.method == "initialize" => {
                    let result = InitializeResult {
                        protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
                        capabilities: ServerCapabilities::default(),
                        server_info: ServerInfo {
                            name: "bare".into(),
                            version: "1".into(),
                        },
                        instructions: None,
                    };
                    self.0
                        .respond(JsonRpcResponse::success(request.id, to_raw(&result)?))
                        .await
                }
                _ => Ok(()),
            }
        }

        fn set_receiver(&self, receiver: Arc<dyn ClientReceiver>) {
            self.0.set_receiver(receiver);
        }

        async fn close(&self) -> McpResult<()> {
            Ok(())
        }
    }

    let client = Client::builder()
        .connect(Arc::new(NoPrompts::default()))
        .await
        .expect("connects");

    let err = client.list_prompts(None).await.expect_err("no capability");
    assert_eq!(err.code, ErrorCode::NotSupported);
    let err = client
        .call_tool(CallToolParams::new("t", None))
        .await
        .expect_err("no tools capability either");
    assert_eq!(err.code, ErrorCode::NotSupported);
}
