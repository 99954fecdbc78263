//! Cross-component tests driving the engine over the in-process mock
//! transport pair, plus direct dispatch tests against the receive path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use peermcp_client::{Client, NotificationHandler, SamplingHandler};
use peermcp_core::{ErrorCode, McpError, McpResult, Rate};
use peermcp_protocol::{
    CallToolParams, CallToolResult, ClientInfo, Content, CreateMessageParams,
    CreateMessageResult, Cursor, Field, InputSchema, JsonRpcResponse, ReadResourceParams,
    ReadResourceResult, Resource, ResourceContents, ResourceTemplate, ResourceUpdatedParams,
    ResourcesCapability, SamplingMessage, ServerCapabilities, ServerInfo, Tool,
};
use peermcp_transport::mock::{mock_transport_pair, MockServerTransport};
use peermcp_transport::{ReceiveContext, SessionIdReturn};
use tokio::sync::mpsc;

use crate::middleware::RateLimitMiddleware;
use crate::session::SessionManager;
use crate::{RateLimitConfig, RequestContext, Server, ToolMiddleware};

fn test_server_info() -> ServerInfo {
    ServerInfo {
        name: "ExampleServer".into(),
        version: "1.0.0".into(),
    }
}

fn empty_schema() -> InputSchema {
    InputSchema::default()
}

fn echo_tool(name: &str) -> Tool {
    Tool::new(name, format!("{name} description"), empty_schema())
}

/// Spins up a server over the mock pair and connects a client to it.
async fn start_pair_with(
    configure_builder: impl FnOnce(crate::ServerBuilder) -> crate::ServerBuilder,
    configure_server: impl FnOnce(&Server),
    client_builder: peermcp_client::ClientBuilder,
) -> (Server, Client, Arc<MockServerTransport>) {
    let (server_transport, client_transport) = mock_transport_pair();
    let server_transport = Arc::new(server_transport);

    let builder = Server::builder(server_transport.clone()).with_server_info(test_server_info());
    let server = configure_builder(builder).build();
    configure_server(&server);

    let run = server.clone();
    tokio::spawn(async move {
        let _ = run.run().await;
    });
    tokio::task::yield_now().await;

    let client = client_builder
        .with_client_info(ClientInfo {
            name: "c".into(),
            version: "1".into(),
        })
        .connect(Arc::new(client_transport))
        .await
        .expect("client connects");

    (server, client, server_transport)
}

async fn start_pair(configure_server: impl FnOnce(&Server)) -> (Server, Client, Arc<MockServerTransport>) {
    start_pair_with(|b| b, configure_server, Client::builder()).await
}

/// Sends raw bytes straight into the dispatcher and awaits the reply.
async fn dispatch(server: &Server, ctx: ReceiveContext, message: &str) -> McpResult<JsonRpcResponse> {
    let reply = server
        .inner
        .receive(ctx, message.as_bytes())
        .await?
        .expect("request produces a reply channel");
    let bytes = reply.await.expect("reply delivered");
    Ok(serde_json::from_slice(&bytes).expect("reply parses"))
}

// ============================================================================
// Initialize handshake
// ============================================================================

#[tokio::test]
async fn initialize_handshake_gates_methods() {
    let (server_transport, _client_transport) = mock_transport_pair();
    let server = Server::builder(Arc::new(server_transport))
        .with_server_info(test_server_info())
        .build();
    server.register_tool(echo_tool("test_tool"), |_ctx, _params| async {
        Ok(CallToolResult::text("pong"))
    });

    // initialize mints a session through the transport's return slot.
    let slot = Arc::new(SessionIdReturn::new());
    let mut ctx = ReceiveContext::default();
    ctx.new_session = Some(slot.clone());

    let init = r#"{"jsonrpc":"2.0","id":"1","method":"initialize","params":{"protocolVersion":"2025-03-26","clientInfo":{"name":"c","version":"1"},"capabilities":{}}}"#;
    let response = dispatch(&server, ctx, init).await.expect("initialize ok");
    assert!(!response.is_error(), "{:?}", response.error);
    let result: serde_json::Value =
        serde_json::from_str(response.result.as_ref().unwrap().get()).unwrap();
    assert_eq!(result["protocolVersion"], "2025-03-26");
    assert_eq!(result["serverInfo"]["name"], "ExampleServer");

    let session_id = slot.get().expect("session minted").to_string();

    // Non-ping methods are rejected until notifications/initialized arrives.
    let list = r#"{"jsonrpc":"2.0","id":"2","method":"tools/list"}"#;
    let err = dispatch(&server, ReceiveContext::for_session(&session_id), list)
        .await
        .expect_err("list before initialized must fail");
    assert_eq!(err.code, ErrorCode::SessionNotInitialized);

    // Ping is allowed before ready.
    let ping = r#"{"jsonrpc":"2.0","id":"3","method":"ping"}"#;
    let response = dispatch(&server, ReceiveContext::for_session(&session_id), ping)
        .await
        .expect("ping before ready is allowed");
    assert!(!response.is_error());

    // Complete the handshake.
    let initialized = r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#;
    let none = server
        .inner
        .receive(
            ReceiveContext::for_session(&session_id),
            initialized.as_bytes(),
        )
        .await
        .expect("initialized notification accepted");
    assert!(none.is_none());

    let response = dispatch(&server, ReceiveContext::for_session(&session_id), list)
        .await
        .expect("list after ready succeeds");
    assert!(!response.is_error());
}

#[tokio::test]
async fn unknown_session_and_unsupported_version_are_rejected() {
    let (server_transport, _client_transport) = mock_transport_pair();
    let server = Server::builder(Arc::new(server_transport)).build();

    let list = r#"{"jsonrpc":"2.0","id":"1","method":"tools/list"}"#;
    let err = server
        .inner
        .receive(ReceiveContext::for_session("ghost"), list.as_bytes())
        .await
        .expect_err("unknown session");
    assert_eq!(err.code, ErrorCode::SessionMissing);

    let slot = Arc::new(SessionIdReturn::new());
    let mut ctx = ReceiveContext::default();
    ctx.new_session = Some(slot);
    let init = r#"{"jsonrpc":"2.0","id":"1","method":"initialize","params":{"protocolVersion":"1999-01-01","clientInfo":{"name":"c","version":"1"},"capabilities":{}}}"#;
    let response = dispatch(&server, ctx, init).await.expect("dispatch runs");
    let error = response.error.expect("unsupported version is an error");
    assert!(error.message.contains("protocol version not supported"));
}

// ============================================================================
// Pagination
// ============================================================================

#[tokio::test]
async fn tools_pagination_walks_all_pages() {
    let (_server, client, _t) = start_pair_with(
        |b| b.with_pagination_limit(5),
        |server| {
            for i in 0..10 {
                server.register_tool(echo_tool(&format!("tool_{i}")), |_ctx, _params| async {
                    Ok(CallToolResult::text("pong"))
                });
            }
        },
        Client::builder(),
    )
    .await;

    let page1 = client.list_tools(None).await.expect("page 1");
    assert_eq!(page1.tools.len(), 5);
    let names: Vec<&str> = page1.tools.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, ["tool_0", "tool_1", "tool_2", "tool_3", "tool_4"]);
    let cursor = page1.next_cursor.clone().expect("full page emits cursor");

    // Walk to exhaustion; the union must equal the registered set.
    let mut seen: Vec<String> = page1.tools.into_iter().map(|t| t.name).collect();
    let mut cursor = Some(cursor);
    while let Some(c) = cursor {
        let page = client.list_tools(Some(c)).await.expect("next page");
        seen.extend(page.tools.into_iter().map(|t| t.name));
        cursor = page.next_cursor;
    }
    let expected: Vec<String> = (0..10).map(|i| format!("tool_{i}")).collect();
    assert_eq!(seen, expected);
}

#[tokio::test]
async fn bad_cursor_surfaces_as_error() {
    let (_server, client, _t) = start_pair_with(
        |b| b.with_pagination_limit(2),
        |server| {
            server.register_tool(echo_tool("tool_a"), |_ctx, _params| async {
                Ok(CallToolResult::text("pong"))
            });
        },
        Client::builder(),
    )
    .await;

    let err = client
        .list_tools(Some(Cursor("!!not-base64!!".into())))
        .await
        .expect_err("bad cursor");
    assert!(err.message.contains("invalid cursor"), "{err}");
}

// ============================================================================
// Rate limiting
// ============================================================================

#[tokio::test]
async fn rate_limited_tool_admits_burst_then_denies() {
    let (_server, client, _t) = start_pair(|server| {
        let middleware: Arc<dyn ToolMiddleware> =
            Arc::new(RateLimitMiddleware::new(Rate::new(5.0, 10)));
        server.register_tool_with_middleware(
            echo_tool("limited"),
            |_ctx, _params| async { Ok(CallToolResult::text("pong")) },
            &[middleware],
        );
    })
    .await;

    let mut ok = 0;
    let mut denied = 0;
    for _ in 0..15 {
        match client.call_tool(CallToolParams::new("limited", None)).await {
            Ok(result) => {
                assert!(!result.is_error);
                ok += 1;
            }
            Err(err) => {
                assert_eq!(err.code, ErrorCode::InternalError);
                assert!(err.message.contains("rate limit exceeded"), "{err}");
                denied += 1;
            }
        }
    }
    assert_eq!(ok, 10, "burst admits exactly the bucket size");
    assert_eq!(denied, 5);
}

#[tokio::test]
async fn per_tool_rate_limit_config_overrides_global() {
    let (_server, client, _t) = start_pair_with(
        |b| {
            b.with_rate_limits(
                RateLimitConfig::global(Rate::new(0.001, 1)).with_tool("open", Rate::new(100.0, 100)),
            )
        },
        |server| {
            server.register_tool(echo_tool("open"), |_ctx, _params| async {
                Ok(CallToolResult::text("pong"))
            });
            server.register_tool(echo_tool("tight"), |_ctx, _params| async {
                Ok(CallToolResult::text("pong"))
            });
        },
        Client::builder(),
    )
    .await;

    for _ in 0..5 {
        client
            .call_tool(CallToolParams::new("open", None))
            .await
            .expect("override admits");
    }

    client
        .call_tool(CallToolParams::new("tight", None))
        .await
        .expect("first global token");
    let err = client
        .call_tool(CallToolParams::new("tight", None))
        .await
        .expect_err("global bucket exhausted");
    assert!(err.message.contains("rate limit exceeded"), "{err}");
}

// ============================================================================
// Progress
// ============================================================================

#[tokio::test]
async fn progress_arrives_in_order_before_result_then_channel_closes() {
    let (_server, client, _t) = start_pair(|server| {
        server.register_tool(echo_tool("working"), |ctx: RequestContext, _params| async move {
            for i in 1..=3 {
                ctx.send_progress(f64::from(i), Some(3.0), Some("step"))
                    .await?;
            }
            Ok(CallToolResult::text("done"))
        });
    })
    .await;

    let (tx, mut rx) = mpsc::channel(8);
    let result = client
        .call_tool_with_progress(CallToolParams::new("working", None), tx)
        .await
        .expect("tool call succeeds");
    assert!(matches!(&result.content[0], Content::Text { text } if text == "done"));

    // All three updates, in order, already buffered before the result.
    for expected in 1..=3 {
        let update = rx.recv().await.expect("progress update");
        assert!((update.progress - f64::from(expected)).abs() < f64::EPSILON);
        assert_eq!(update.total, Some(3.0));
    }
    // The sink is unregistered on return: the channel is closed and empty.
    assert!(rx.recv().await.is_none());
}

// ============================================================================
// Heartbeat & reaping
// ============================================================================

fn detection_ok() -> impl Fn(String) -> futures::future::BoxFuture<'static, McpResult<()>> {
    |_session_id| Box::pin(async { Ok(()) })
}

fn detection_fail() -> impl Fn(String) -> futures::future::BoxFuture<'static, McpResult<()>> {
    |_session_id| Box::pin(async { Err(McpError::connection("ping failed")) })
}

#[tokio::test]
async fn sweep_reaps_idle_sessions() {
    let manager = SessionManager::new(Some(Duration::from_millis(10)));
    let id = manager.create();
    tokio::time::sleep(Duration::from_millis(30)).await;

    manager.sweep(&detection_ok()).await;

    assert!(!manager.is_active_session(&id));
    assert!(manager.is_closed_session(&id));
}

#[tokio::test]
async fn sweep_reaps_sessions_failing_three_pings() {
    let manager = SessionManager::new(None);
    let id = manager.create();

    manager.sweep(&detection_fail()).await;

    assert!(manager.is_closed_session(&id));
}

#[tokio::test]
async fn sweep_keeps_healthy_sessions() {
    let manager = SessionManager::new(Some(Duration::from_secs(60)));
    let id = manager.create();

    manager.sweep(&detection_ok()).await;

    assert!(manager.is_active_session(&id));
}

#[tokio::test]
async fn closed_session_is_rejected_at_the_receive_edge() {
    let (server_transport, _client_transport) = mock_transport_pair();
    let server = Server::builder(Arc::new(server_transport)).build();

    let session_id = server.inner.session_manager.create();
    server.inner.session_manager.close(&session_id);

    let subscribe =
        r#"{"jsonrpc":"2.0","id":"9","method":"resources/subscribe","params":{"uri":"file:///x"}}"#;
    let err = server
        .inner
        .receive(ReceiveContext::for_session(&session_id), subscribe.as_bytes())
        .await
        .expect_err("closed session is rejected before dispatch");
    assert_eq!(err.code, ErrorCode::SessionClosed);
}

// ============================================================================
// Cancellation & disconnect shielding
// ============================================================================

#[tokio::test]
async fn client_disconnect_does_not_cancel_running_handler() {
    let finished = Arc::new(AtomicBool::new(false));
    let flag = finished.clone();

    let (_server, client, _t) = start_pair(move |server| {
        server.register_tool(echo_tool("slow"), move |_ctx, _params| {
            let flag = flag.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                flag.store(true, Ordering::Release);
                Ok(CallToolResult::text("late"))
            }
        });
    })
    .await;

    let caller = client.clone();
    tokio::spawn(async move {
        let _ = caller.call_tool(CallToolParams::new("slow", None)).await;
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    client.close().await.expect("close");

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(
        finished.load(Ordering::Acquire),
        "handler must run to completion after client disconnect"
    );
}

#[tokio::test]
async fn explicit_cancellation_notification_cancels_handler_context() {
    let observed = Arc::new(AtomicBool::new(false));
    let flag = observed.clone();

    let (_server, client, _t) = start_pair(move |server| {
        server.register_tool(echo_tool("cancellable"), move |ctx: RequestContext, _params| {
            let flag = flag.clone();
            async move {
                tokio::select! {
                    _ = ctx.cancelled() => {
                        flag.store(true, Ordering::Release);
                        Err(McpError::cancelled("cancelled by peer"))
                    }
                    _ = tokio::time::sleep(Duration::from_secs(5)) => {
                        Ok(CallToolResult::text("too late"))
                    }
                }
            }
        });
    })
    .await;

    let err = client
        .call_tool_with_timeout(
            CallToolParams::new("cancellable", None),
            Duration::from_millis(20),
        )
        .await
        .expect_err("deadline fires");
    assert_eq!(err.code, ErrorCode::Cancelled);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(
        observed.load(Ordering::Acquire),
        "handler must observe the cancellation notification"
    );
}

// ============================================================================
// Sampling
// ============================================================================

struct EchoSampling;

#[async_trait::async_trait]
impl SamplingHandler for EchoSampling {
    async fn create_message(
        &self,
        params: CreateMessageParams,
    ) -> McpResult<CreateMessageResult> {
        let text = match &params.messages[0].content {
            Content::Text { text } => format!("echo: {text}"),
            _ => "echo".to_string(),
        };
        Ok(CreateMessageResult::text(text, "test-model"))
    }
}

#[tokio::test]
async fn sampling_round_trip_through_pending_discipline() {
    let (server, _client, transport) = start_pair_with(
        |b| b,
        |_server| {},
        Client::builder().with_sampling_handler(Arc::new(EchoSampling)),
    )
    .await;

    let session_id = transport.session_id().expect("session exists");
    let params = CreateMessageParams::new(vec![SamplingMessage::user("hi")], 64);
    let result = server
        .create_message(&session_id, params)
        .await
        .expect("sampling result");
    assert!(matches!(&result.content, Content::Text { text } if text == "echo: hi"));
}

#[tokio::test]
async fn sampling_requires_client_capability() {
    let (server, _client, transport) = start_pair(|_server| {}).await;

    let session_id = transport.session_id().expect("session exists");
    let params = CreateMessageParams::new(vec![SamplingMessage::user("hi")], 64);
    let err = server
        .create_message(&session_id, params)
        .await
        .expect_err("client did not advertise sampling");
    assert_eq!(err.code, ErrorCode::NotSupported);
}

// ============================================================================
// Resources: templates, subscriptions, updates
// ============================================================================

#[tokio::test]
async fn read_resource_prefers_exact_match_then_templates() {
    let (_server, client, _t) = start_pair(|server| {
        server.register_resource(
            Resource {
                uri: "file:///known.txt".into(),
                name: "known.txt".into(),
                description: None,
                mime_type: Some("text/plain".into()),
            },
            |_ctx, params: ReadResourceParams| async move {
                Ok(ReadResourceResult {
                    contents: vec![ResourceContents::text(params.uri, "text/plain", "exact")],
                })
            },
        );
        server
            .register_resource_template(
                ResourceTemplate {
                    uri_template: "file:///{path}".into(),
                    name: "files".into(),
                    description: None,
                    mime_type: Some("text/plain".into()),
                },
                |_ctx, params: ReadResourceParams| async move {
                    let path = params.arguments.get("path").cloned().unwrap_or_default();
                    Ok(ReadResourceResult {
                        contents: vec![ResourceContents::text(params.uri, "text/plain", path)],
                    })
                },
            )
            .expect("template registers");
    })
    .await;

    let exact = client
        .read_resource(ReadResourceParams::new("file:///known.txt"))
        .await
        .expect("exact read");
    assert_eq!(exact.contents[0].text.as_deref(), Some("exact"));

    let templated = client
        .read_resource(ReadResourceParams::new("file:///notes.md"))
        .await
        .expect("template read");
    assert_eq!(templated.contents[0].text.as_deref(), Some("notes.md"));

    let err = client
        .read_resource(ReadResourceParams::new("db://nope"))
        .await
        .expect_err("no resource matches");
    assert_eq!(err.code, ErrorCode::MethodNotFound);
}

struct RecordingHandler {
    updated: mpsc::UnboundedSender<String>,
    tools_changed: mpsc::UnboundedSender<()>,
}

impl NotificationHandler for RecordingHandler {
    fn on_tools_list_changed(&self) {
        let _ = self.tools_changed.send(());
    }

    fn on_resource_updated(&self, params: ResourceUpdatedParams) {
        let _ = self.updated.send(params.uri);
    }
}

#[tokio::test]
async fn resource_updates_route_only_to_subscribers() {
    let (updated_tx, mut updated_rx) = mpsc::unbounded_channel();
    let (tools_tx, _tools_rx) = mpsc::unbounded_channel();
    let handler = Arc::new(RecordingHandler {
        updated: updated_tx,
        tools_changed: tools_tx,
    });

    let (server, client, _t) = start_pair_with(
        |b| b,
        |_server| {},
        Client::builder().with_notification_handler(handler),
    )
    .await;

    client
        .subscribe_resource("file:///watched.txt")
        .await
        .expect("subscribe");
    server
        .notify_resource_updated("file:///watched.txt")
        .await
        .expect("notify");
    let uri = tokio::time::timeout(Duration::from_secs(1), updated_rx.recv())
        .await
        .expect("update arrives")
        .expect("channel open");
    assert_eq!(uri, "file:///watched.txt");

    // Unsubscribed URIs produce nothing for this session.
    server
        .notify_resource_updated("file:///other.txt")
        .await
        .expect("notify unrelated");
    client
        .unsubscribe_resource("file:///watched.txt")
        .await
        .expect("unsubscribe");
    server
        .notify_resource_updated("file:///watched.txt")
        .await
        .expect("notify after unsubscribe");
    let silent = tokio::time::timeout(Duration::from_millis(100), updated_rx.recv()).await;
    assert!(silent.is_err(), "no update may arrive after unsubscribe");
}

#[tokio::test]
async fn registration_broadcasts_list_changed_to_live_sessions() {
    let (updated_tx, _updated_rx) = mpsc::unbounded_channel();
    let (tools_tx, mut tools_rx) = mpsc::unbounded_channel();
    let handler = Arc::new(RecordingHandler {
        updated: updated_tx,
        tools_changed: tools_tx,
    });

    let (server, _client, _t) = start_pair_with(
        |b| b,
        |_server| {},
        Client::builder().with_notification_handler(handler),
    )
    .await;

    server.register_tool(echo_tool("late_addition"), |_ctx, _params| async {
        Ok(CallToolResult::text("pong"))
    });

    tokio::time::timeout(Duration::from_secs(1), tools_rx.recv())
        .await
        .expect("list-changed arrives")
        .expect("channel open");
}

#[tokio::test]
async fn subscribe_is_refused_without_the_capability() {
    let (server_transport, _client_transport) = mock_transport_pair();
    let server = Server::builder(Arc::new(server_transport))
        .with_capabilities(ServerCapabilities {
            resources: Some(ResourcesCapability {
                subscribe: false,
                list_changed: true,
            }),
            ..ServerCapabilities::all()
        })
        .build();

    let session_id = server.inner.session_manager.create();
    let session = server.inner.session_manager.get(&session_id).unwrap();
    session.mark_received_initialize();
    session.set_ready();

    let subscribe =
        r#"{"jsonrpc":"2.0","id":"4","method":"resources/subscribe","params":{"uri":"file:///x"}}"#;
    let response = dispatch(&server, ReceiveContext::for_session(&session_id), subscribe)
        .await
        .expect("dispatch runs");
    let error = response.error.expect("capability gate rejects");
    assert_eq!(error.code, -32601);
}

// ============================================================================
// Schema validation on tools/call
// ============================================================================

#[tokio::test]
async fn tool_arguments_are_validated_against_the_schema() {
    let schema = InputSchema::builder()
        .field(Field::string("timezone").description("current time timezone"))
        .build()
        .expect("schema builds");

    let (_server, client, _t) = start_pair(move |server| {
        server.register_tool(
            Tool::new("current_time", "current time", schema.clone()),
            |_ctx, _params| async { Ok(CallToolResult::text("12:00")) },
        );
    })
    .await;

    let ok = client
        .call_tool(CallToolParams::new(
            "current_time",
            Some(serde_json::json!({"timezone": "UTC"})),
        ))
        .await
        .expect("valid arguments pass");
    assert!(!ok.is_error);

    let err = client
        .call_tool(CallToolParams::new(
            "current_time",
            Some(serde_json::json!({"timezone": 5})),
        ))
        .await
        .expect_err("invalid arguments rejected");
    assert_eq!(err.code, ErrorCode::InvalidParams);

    let err = client
        .call_tool(CallToolParams::new("current_time", None))
        .await
        .expect_err("missing required argument rejected");
    assert!(err.message.contains("missing required field"), "{err}");
}

// ============================================================================
// Shutdown
// ============================================================================

#[tokio::test]
async fn shutdown_rejects_new_requests_and_closes_sessions() {
    let (server, client, transport) = start_pair(|server| {
        server.register_tool(echo_tool("t"), |_ctx, _params| async {
            Ok(CallToolResult::text("pong"))
        });
    })
    .await;

    let session_id = transport.session_id().expect("session exists");
    tokio::time::timeout(Duration::from_secs(1), server.shutdown())
        .await
        .expect("shutdown completes")
        .expect("shutdown ok");

    assert!(!server.inner.session_manager.is_active_session(&session_id));

    let mut ctx = ReceiveContext::default();
    ctx.stateless = true;
    let ping = r#"{"jsonrpc":"2.0","id":"1","method":"ping"}"#;
    let err = server
        .inner
        .receive(ctx, ping.as_bytes())
        .await
        .expect_err("new work is rejected after shutdown");
    assert_eq!(err.code, ErrorCode::Shutdown);

    drop(client);
}
