// ABOUTME: Tests for the HTTP sandbox client against a mock tool server
// ABOUTME: Verifies endpoints, auth headers, tool routing and health probing

use serde_json::json;
use std::time::Duration;
use warden_sandbox::client::SESSION_HEADER;
use warden_sandbox::{ClientError, ContainerModel, SandboxClient, SandboxHttpClient};
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client_for(server: &MockServer) -> SandboxHttpClient {
    let mut model = ContainerModel::for_endpoint(
        "c1", "warden_c1", "abc", "base", "localhost", 1, "secret-token", vec![1],
    );
    model.base_url = format!("{}/fastapi", server.uri());
    SandboxHttpClient::new(&model, Duration::from_secs(5)).unwrap()
}

#[tokio::test]
async fn test_health_check_sends_auth_and_session() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/fastapi/healthz"))
        .and(header("authorization", "Bearer secret-token"))
        .and(header(SESSION_HEADER, "sabc"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    assert!(client_for(&server).check_health().await);
}

#[tokio::test]
async fn test_unhealthy_status_and_unreachable_server() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/fastapi/healthz"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    assert!(!client_for(&server).check_health().await);

    let mut model = ContainerModel::for_endpoint("c", "n", "s", "base", "127.0.0.1", 1, "t", vec![1]);
    model.base_url = "http://127.0.0.1:1/fastapi".to_string();
    let unreachable = SandboxHttpClient::new(&model, Duration::from_secs(1)).unwrap();
    assert!(!unreachable.check_health().await);
}

#[tokio::test]
async fn test_wait_until_healthy_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/fastapi/healthz"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let err = client_for(&server)
        .wait_until_healthy(Duration::from_millis(500))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::HealthTimeout(_)));
}

#[tokio::test]
async fn test_mcp_tool_call_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/fastapi/mcp/call_tool"))
        .and(body_json(json!({
            "tool_name": "browser_navigate",
            "arguments": { "url": "https://example.com" }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "content": [{ "type": "text", "text": "ok" }]
        })))
        .mount(&server)
        .await;

    let result = client_for(&server)
        .call_tool("browser_navigate", json!({ "url": "https://example.com" }))
        .await
        .unwrap();
    assert_eq!(result["content"][0]["text"], "ok");
}

#[tokio::test]
async fn test_generic_tool_routes_to_tools_endpoint() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/fastapi/tools/run_shell_command"))
        .and(body_json(json!({ "command": "echo hi" })))
        .respond_with(ResponseTemplate::new(200).set_body_string("hi\n"))
        .mount(&server)
        .await;

    let result = client_for(&server)
        .call_tool("run_shell_command", json!({ "command": "echo hi" }))
        .await
        .unwrap();
    assert_eq!(result, json!("hi\n"));
}

#[tokio::test]
async fn test_tool_error_status_surfaces() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/fastapi/mcp/call_tool"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;

    let err = client_for(&server)
        .call_tool("anything", json!(null))
        .await
        .unwrap_err();
    match err {
        ClientError::ToolFailed { tool, status, body } => {
            assert_eq!(tool, "anything");
            assert_eq!(status, 500);
            assert_eq!(body, "boom");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_list_tools_merges_and_filters() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/fastapi/mcp/list_tools"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "browser": { "browser_navigate": { "name": "browser_navigate" } }
        })))
        .mount(&server)
        .await;
    let client = client_for(&server);

    let all = client.list_tools(None).await.unwrap();
    assert!(all["browser"]["browser_navigate"].is_object());
    assert!(all["generic"]["run_ipython_cell"].is_object());

    let generic = client.list_tools(Some("generic")).await.unwrap();
    assert_eq!(generic.as_object().unwrap().len(), 1);
    assert!(generic["generic"]["run_shell_command"].is_object());

    let missing = client.list_tools(Some("filesystem")).await.unwrap();
    assert_eq!(missing, json!({ "filesystem": {} }));
}

#[tokio::test]
async fn test_add_mcp_servers() {
    let server = MockServer::start().await;
    let configs = json!({ "mcpServers": { "time": { "command": "uvx", "args": ["mcp-server-time"] } } });
    Mock::given(method("POST"))
        .and(path("/fastapi/mcp/add_servers"))
        .and(body_json(json!({ "server_configs": configs.clone(), "overwrite": true })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "added": ["time"] })))
        .mount(&server)
        .await;

    let result = client_for(&server)
        .add_mcp_servers(configs, true)
        .await
        .unwrap();
    assert_eq!(result["added"][0], "time");
}
