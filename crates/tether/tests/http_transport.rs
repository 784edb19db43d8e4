use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use wiremock::matchers::{body_partial_json, header, header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use tether::models::content::Content;
use tether::models::tool::ToolCall;
use tether::systems::http::HttpTransport;
use tether::systems::protocol::PROTOCOL_VERSION;
use tether::systems::{
    Notification, NotificationSink, RemoteSystem, System, SystemError, Transport,
};

async fn mount_initialize(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .and(body_partial_json(json!({"method": "initialize", "id": 1})))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Mcp-Session-Id", "session-abc")
                .set_body_json(json!({
                    "jsonrpc": "2.0",
                    "id": 1,
                    "result": {
                        "protocolVersion": PROTOCOL_VERSION,
                        "capabilities": {"tools": {}},
                        "serverInfo": {"name": "remote", "version": "0.1"}
                    }
                })),
        )
        .expect(1)
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(path("/mcp"))
        .and(header("Mcp-Session-Id", "session-abc"))
        .and(body_partial_json(json!({"method": "notifications/initialized"})))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(server)
        .await;
}

fn transport(server: &MockServer, sink: NotificationSink) -> Arc<HttpTransport> {
    Arc::new(
        HttpTransport::new(
            "remote",
            &format!("{}/mcp", server.uri()),
            Duration::from_secs(5),
            sink,
        )
        .unwrap(),
    )
}

#[tokio::test]
async fn test_session_id_is_captured_and_echoed() {
    let server = MockServer::start().await;
    mount_initialize(&server).await;

    Mock::given(method("POST"))
        .and(path("/mcp"))
        .and(header("Mcp-Session-Id", "session-abc"))
        .and(body_partial_json(json!({"method": "tools/list", "id": 2})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "id": 2,
            "result": {"tools": [{"name": "lookup", "inputSchema": {"type": "object"}}]}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let transport = transport(&server, NotificationSink::discard());
    let system = RemoteSystem::new("remote", transport.clone());

    assert!(system.initialize().await.unwrap().supports_tools());
    assert_eq!(transport.session_id().as_deref(), Some("session-abc"));

    let page = system.list_tools(None).await.unwrap();
    assert_eq!(page.tools[0].name, "lookup");
    assert!(page.is_last());
}

#[tokio::test]
async fn test_event_stream_response_with_notification() {
    let server = MockServer::start().await;
    let body = concat!(
        "event: message\n",
        "data: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/progress\",\"params\":{\"progress\":1}}\n",
        "\n",
        "event: message\n",
        "data: {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{\"content\":[{\"type\":\"text\",\"text\":\"42\"}]}}\n",
        "\n"
    );
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .and(header_exists("Accept"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;

    let seen = Arc::new(Mutex::new(Vec::<Notification>::new()));
    let captured = seen.clone();
    let sink = NotificationSink::new(move |n| captured.lock().unwrap().push(n));
    let system = RemoteSystem::new("remote", transport(&server, sink));

    let result = system
        .call(ToolCall::new("answer", json!({})))
        .await
        .unwrap();
    assert_eq!(result, vec![Content::text("42")]);

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].system, "remote");
    assert_eq!(seen[0].method, "notifications/progress");
}

#[tokio::test]
async fn test_batched_json_response() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"jsonrpc": "2.0", "method": "notifications/message", "params": {"data": "hi"}},
            {"jsonrpc": "2.0", "id": 1, "result": {"ok": true}}
        ])))
        .mount(&server)
        .await;

    let transport = transport(&server, NotificationSink::discard());
    let result = transport.request("ping", None).await.unwrap();
    assert_eq!(result, json!({"ok": true}));
}

#[tokio::test]
async fn test_http_error_status() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string("upstream exploded"))
        .mount(&server)
        .await;

    let transport = transport(&server, NotificationSink::discard());
    match transport.request("tools/list", None).await {
        Err(SystemError::Transport(message)) => {
            assert!(message.contains("500"));
            assert!(message.contains("upstream exploded"));
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_close_terminates_session() {
    let server = MockServer::start().await;
    mount_initialize(&server).await;
    Mock::given(method("DELETE"))
        .and(path("/mcp"))
        .and(header("Mcp-Session-Id", "session-abc"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let transport = transport(&server, NotificationSink::discard());
    let system = RemoteSystem::new("remote", transport.clone());
    system.initialize().await.unwrap();

    system.shutdown().await.unwrap();
    // A second close is a no-op
    transport.close().await.unwrap();
    assert!(matches!(
        transport.request("ping", None).await,
        Err(SystemError::Closed)
    ));
}

#[tokio::test]
async fn test_tool_call_is_not_bound_by_request_limit() {
    let server = MockServer::start().await;
    let delayed = |body| {
        ResponseTemplate::new(200)
            .set_body_json(body)
            .set_delay(Duration::from_millis(1500))
    };
    Mock::given(method("POST"))
        .and(body_partial_json(json!({"method": "tools/list"})))
        .respond_with(delayed(json!({"jsonrpc": "2.0", "id": 1, "result": {"tools": []}})))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({"method": "tools/call"})))
        .respond_with(delayed(json!({"jsonrpc": "2.0", "id": 2, "result": {"content": []}})))
        .mount(&server)
        .await;

    let transport = HttpTransport::new(
        "remote",
        &format!("{}/mcp", server.uri()),
        Duration::from_secs(1),
        NotificationSink::discard(),
    )
    .unwrap();

    assert!(matches!(
        transport.request("tools/list", None).await,
        Err(SystemError::Timeout { .. })
    ));
    let result = transport.request("tools/call", None).await.unwrap();
    assert_eq!(result, json!({"content": []}));
}
