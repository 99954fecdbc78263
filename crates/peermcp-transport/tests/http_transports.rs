//! End-to-end tests for the HTTP transports: a real server and client over
//! localhost, exercising the Streamable HTTP verbs and the SSE endpoint pair.

use std::sync::Arc;
use std::time::Duration;

use peermcp_client::Client;
use peermcp_protocol::{CallToolParams, CallToolResult, ClientInfo, Content, InputSchema, ServerInfo, Tool};
use peermcp_server::Server;
use peermcp_transport::sse::{SseClientTransport, SseServerTransport};
use peermcp_transport::streamable_http::{
    StateMode, StreamableHttpClientTransport, StreamableHttpServerTransport,
};

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
    let port = listener.local_addr().expect("local addr").port();
    drop(listener);
    port
}

fn pong_server(transport: Arc<dyn peermcp_transport::ServerTransport>) -> Server {
    let server = Server::builder(transport)
        .with_server_info(ServerInfo {
            name: "http-test".into(),
            version: "1.0".into(),
        })
        .build();
    server.register_tool(
        Tool::new("pong", "answers pong", InputSchema::default()),
        |_ctx, _params| async { Ok(CallToolResult::text("pong")) },
    );
    server
}

async fn connect_client(transport: Arc<dyn peermcp_transport::ClientTransport>) -> Client {
    Client::builder()
        .with_client_info(ClientInfo {
            name: "http-client".into(),
            version: "1".into(),
        })
        .with_init_timeout(Duration::from_secs(5))
        .connect(transport)
        .await
        .expect("client connects")
}

#[tokio::test]
async fn streamable_http_round_trip() {
    let port = free_port();
    let addr = format!("127.0.0.1:{port}");

    let transport = Arc::new(StreamableHttpServerTransport::bind(&addr));
    let server = pong_server(transport);
    let run = server.clone();
    tokio::spawn(async move {
        let _ = run.run().await;
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let client_transport =
        Arc::new(StreamableHttpClientTransport::new(&format!("http://{addr}/mcp")).unwrap());
    let client = connect_client(client_transport.clone()).await;

    // The session id was learned from the initialize response header.
    assert!(client_transport.session_id().is_some());

    let tools = client.list_tools(None).await.expect("tools/list");
    assert_eq!(tools.tools.len(), 1);
    assert_eq!(tools.tools[0].name, "pong");

    let result = client
        .call_tool(CallToolParams::new("pong", None))
        .await
        .expect("tools/call");
    assert!(matches!(&result.content[0], Content::Text { text } if text == "pong"));

    client.close().await.expect("close issues DELETE");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.session_count(), 0, "DELETE closed the session");
}

#[tokio::test]
async fn streamable_http_status_codes() {
    let port = free_port();
    let addr = format!("127.0.0.1:{port}");

    let transport = Arc::new(StreamableHttpServerTransport::bind(&addr));
    let server = pong_server(transport);
    tokio::spawn(async move {
        let _ = server.run().await;
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let url = format!("http://{addr}/mcp");
    let http = reqwest::Client::new();

    // POST without an Accept header: 400.
    let resp = http
        .post(&url)
        .body(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    // Request without a session (and not initialize): 400.
    let resp = http
        .post(&url)
        .header("Accept", "application/json, text/event-stream")
        .header("Mcp-Session-Id", "unknown-session")
        .body(r#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    // Initialize mints a session and returns it in the header.
    let resp = http
        .post(&url)
        .header("Accept", "application/json, text/event-stream")
        .body(r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{"protocolVersion":"2025-03-26","clientInfo":{"name":"raw","version":"1"},"capabilities":{}}}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let session_id = resp
        .headers()
        .get("Mcp-Session-Id")
        .expect("minted session header")
        .to_str()
        .unwrap()
        .to_string();

    // Notifications are acknowledged with 202 and an empty body.
    let resp = http
        .post(&url)
        .header("Accept", "application/json")
        .header("Mcp-Session-Id", &session_id)
        .body(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 202);

    // GET without the session header: 400.
    let resp = http
        .get(&url)
        .header("Accept", "text/event-stream")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    // DELETE closes the session; posting on it afterwards is 404.
    let resp = http
        .delete(&url)
        .header("Mcp-Session-Id", &session_id)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let resp = http
        .post(&url)
        .header("Accept", "application/json, text/event-stream")
        .header("Mcp-Session-Id", &session_id)
        .body(r#"{"jsonrpc":"2.0","id":2,"method":"tools/list"}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn stateless_mode_rejects_get_and_answers_self_contained_posts() {
    let port = free_port();
    let addr = format!("127.0.0.1:{port}");

    let transport =
        Arc::new(StreamableHttpServerTransport::bind(&addr).with_state_mode(StateMode::Stateless));
    let server = pong_server(transport);
    tokio::spawn(async move {
        let _ = server.run().await;
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let url = format!("http://{addr}/mcp");
    let http = reqwest::Client::new();

    let resp = http
        .get(&url)
        .header("Accept", "text/event-stream")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 405);

    // A bare request works without any session plumbing.
    let resp = http
        .post(&url)
        .header("Accept", "application/json, text/event-stream")
        .body(r#"{"jsonrpc":"2.0","id":7,"method":"tools/list"}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert!(resp.headers().get("Mcp-Session-Id").is_none());
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["result"]["tools"][0]["name"], "pong");
}

#[tokio::test]
async fn sse_round_trip() {
    let port = free_port();
    let addr = format!("127.0.0.1:{port}");

    let transport = Arc::new(SseServerTransport::bind(&addr));
    let server = pong_server(transport);
    tokio::spawn(async move {
        let _ = server.run().await;
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let client_transport =
        Arc::new(SseClientTransport::new(&format!("http://{addr}/sse")).unwrap());
    let client = connect_client(client_transport).await;

    let tools = client.list_tools(None).await.expect("tools/list over sse");
    assert_eq!(tools.tools[0].name, "pong");

    let result = client
        .call_tool(CallToolParams::new("pong", None))
        .await
        .expect("tools/call over sse");
    assert!(matches!(&result.content[0], Content::Text { text } if text == "pong"));

    client.close().await.expect("close");
}
