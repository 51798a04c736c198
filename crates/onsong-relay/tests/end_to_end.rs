//! Drives a real relay listener with a scripted agent socket and tenant
//! HTTP calls.

use futures_util::{SinkExt, StreamExt};
use onsong_relay::{RelayConfig, RelayServer, RelayState};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;

const HOST: &str = "a.church.tools";

struct Relay {
    addr: SocketAddr,
    state: Arc<RelayState>,
    _shutdown: oneshot::Sender<()>,
}

async fn start_relay(request_timeout: Duration) -> Relay {
    let server = RelayServer::new(RelayConfig {
        bind: "127.0.0.1".into(),
        port: 0,
        request_timeout,
        ..RelayConfig::default()
    });
    let listener = server.bind().await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = server.state().clone();
    let (tx, rx) = oneshot::channel::<()>();
    tokio::spawn(server.serve(listener, async {
        let _ = rx.await;
    }));
    Relay {
        addr,
        state,
        _shutdown: tx,
    }
}

/// How the scripted agent answers `api-request`.
#[derive(Clone, Copy)]
enum Behaviour {
    Succeed,
    DeviceFails,
    Silent,
}

struct FakeAgent {
    close: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl FakeAgent {
    async fn connect(relay: &Relay, register: Value, behaviour: Behaviour) -> (Self, Value) {
        let url = format!("ws://{}/ws", relay.addr);
        let (ws, _) = connect_async(url.as_str()).await.unwrap();
        let (mut sink, mut stream) = ws.split();

        sink.send(WsMessage::Text(register.to_string())).await.unwrap();
        let reply = next_json(&mut stream).await;

        let (close, mut close_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut close_rx => {
                        let _ = sink.close().await;
                        break;
                    }
                    frame = stream.next() => {
                        let Some(Ok(WsMessage::Text(text))) = frame else { break };
                        let msg: Value = serde_json::from_str(&text).unwrap();
                        if let Some(reply) = answer(&msg, behaviour) {
                            sink.send(WsMessage::Text(reply.to_string())).await.unwrap();
                        }
                    }
                }
            }
        });

        (Self { close, task }, reply)
    }

    async fn disconnect(self) {
        let _ = self.close.send(());
        let _ = self.task.await;
    }
}

async fn next_json<S>(stream: &mut S) -> Value
where
    S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        match stream.next().await {
            Some(Ok(WsMessage::Text(text))) => return serde_json::from_str(&text).unwrap(),
            Some(Ok(_)) => continue,
            other => panic!("socket ended: {other:?}"),
        }
    }
}

fn answer(msg: &Value, behaviour: Behaviour) -> Option<Value> {
    let request_id = msg.get("requestId").cloned();
    match msg["type"].as_str()? {
        "ping" => Some(json!({ "type": "pong" })),
        "discover" => Some(json!({
            "type": "discover-response",
            "requestId": request_id,
            "success": true,
            "devices": [{
                "id": "dev-1",
                "name": "Stage iPad",
                "host": "stage.local",
                "addresses": ["10.0.0.5"],
                "port": 80,
                "attributes": { "role": "server", "id": "dev-1" }
            }]
        })),
        "api-request" => match behaviour {
            Behaviour::Succeed => Some(json!({
                "type": "api-response",
                "requestId": request_id,
                "success": true,
                "statusCode": 200,
                "headers": { "content-type": "application/json" },
                "data": { "echoPath": msg["path"], "method": msg["method"] }
            })),
            Behaviour::DeviceFails => Some(json!({
                "type": "api-response",
                "requestId": request_id,
                "success": false,
                "statusCode": 401,
                "error": "device rejected token"
            })),
            Behaviour::Silent => None,
        },
        _ => None,
    }
}

fn register_msg(id: &str, secret: &str, public: bool) -> Value {
    json!({
        "type": "register",
        "churchToolsUrl": format!("https://{HOST}"),
        "secret": secret,
        "uuid": id,
        "location": "Main hall",
        "public": public,
        "proxyVersion": "0.1.0"
    })
}

fn tenant_get(relay: &Relay, path: &str, id: Option<&str>, secret: Option<&str>) -> reqwest::RequestBuilder {
    let mut req = reqwest::Client::new()
        .get(format!("http://{}{path}", relay.addr))
        .header("referer", format!("https://{HOST}/songs"))
        .header("onsongip", "10.0.0.5");
    if let Some(id) = id {
        req = req.header("x-id", id);
    }
    if let Some(secret) = secret {
        req = req.header("x-auth", secret);
    }
    req
}

async fn wait_for_sessions(relay: &Relay, expected: usize) {
    for _ in 0..100 {
        if relay.state.registry.count().await == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("session count never reached {expected}");
}

#[tokio::test]
async fn registered_agent_serves_tenant_calls() {
    let relay = start_relay(Duration::from_secs(5)).await;
    let (agent, reply) =
        FakeAgent::connect(&relay, register_msg("u1", "s1", false), Behaviour::Succeed).await;
    assert_eq!(reply["type"], "registered");

    let resp = tenant_get(&relay, "/api/device/api/status?x=1", Some("u1"), Some("s1"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers()["content-type"], "application/json");
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["echoPath"], "/api/status?x=1");
    assert_eq!(body["method"], "GET");

    let resp = tenant_get(&relay, "/api/device/api/status", Some("u1"), Some("wrong"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "unauthorized");

    let resp = tenant_get(&relay, "/api/device/api/status", Some("u2"), Some("s1"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);

    agent.disconnect().await;
    wait_for_sessions(&relay, 0).await;

    let resp = tenant_get(&relay, "/api/device/api/status", Some("u1"), Some("s1"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["message"], "not connected");
}

#[tokio::test]
async fn missing_identity_and_origin() {
    let relay = start_relay(Duration::from_secs(5)).await;
    let (_agent, _) =
        FakeAgent::connect(&relay, register_msg("u1", "s1", false), Behaviour::Succeed).await;

    let resp = tenant_get(&relay, "/api/discover", None, Some("s1"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    let resp = reqwest::Client::new()
        .get(format!("http://{}/api/discover", relay.addr))
        .header("x-id", "u1")
        .header("x-auth", "s1")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn discover_returns_agent_devices() {
    let relay = start_relay(Duration::from_secs(5)).await;
    let (_agent, _) =
        FakeAgent::connect(&relay, register_msg("u1", "s1", false), Behaviour::Succeed).await;

    let resp = tenant_get(&relay, "/api/discover", Some("u1"), Some("s1"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["devices"][0]["id"], "dev-1");
    assert_eq!(body["devices"][0]["addresses"][0], "10.0.0.5");
}

#[tokio::test]
async fn device_failure_is_bad_gateway_and_silence_is_timeout() {
    let relay = start_relay(Duration::from_millis(300)).await;
    let (_failing, _) =
        FakeAgent::connect(&relay, register_msg("u1", "s1", false), Behaviour::DeviceFails).await;
    let (_silent, _) =
        FakeAgent::connect(&relay, register_msg("u2", "s2", false), Behaviour::Silent).await;

    let resp = tenant_get(&relay, "/api/device/api/auth", Some("u1"), Some("s1"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 502);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "upstream_failure");

    let resp = tenant_get(&relay, "/api/device/api/auth", Some("u2"), Some("s2"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 504);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "upstream_timeout");
}

#[tokio::test]
async fn public_session_and_presence_check() {
    let relay = start_relay(Duration::from_secs(5)).await;
    let (_agent, _) =
        FakeAgent::connect(&relay, register_msg("u1", "s1", true), Behaviour::Succeed).await;

    let resp = tenant_get(&relay, "/api/device/api/status", Some("u1"), None)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let resp = tenant_get(&relay, "/api/connection", Some("u1"), None)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    let resp = tenant_get(&relay, "/api/connection", Some("u1"), Some("s1"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["connected"], true);
    assert_eq!(body["location"], "Main hall");
}

#[tokio::test]
async fn reregistration_replaces_and_orphan_close_keeps_session() {
    let relay = start_relay(Duration::from_secs(5)).await;
    let (old, _) =
        FakeAgent::connect(&relay, register_msg("u1", "old", false), Behaviour::Succeed).await;
    let (_new, _) =
        FakeAgent::connect(&relay, register_msg("u1", "new", false), Behaviour::Succeed).await;
    wait_for_sessions(&relay, 1).await;

    old.disconnect().await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(relay.state.registry.count().await, 1);

    let resp = tenant_get(&relay, "/api/device/x", Some("u1"), Some("new"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let resp = tenant_get(&relay, "/api/device/x", Some("u1"), Some("old"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);
}

#[tokio::test]
async fn reregistering_same_socket_fails_pending_calls() {
    let relay = start_relay(Duration::from_secs(10)).await;
    let url = format!("ws://{}/ws", relay.addr);
    let (ws, _) = connect_async(url.as_str()).await.unwrap();
    let (mut sink, mut stream) = ws.split();
    let register = WsMessage::Text(register_msg("u1", "s1", false).to_string());

    sink.send(register.clone()).await.unwrap();
    assert_eq!(next_json(&mut stream).await["type"], "registered");

    let call = tokio::spawn(
        tenant_get(&relay, "/api/device/api/status", Some("u1"), Some("s1")).send(),
    );
    loop {
        if next_json(&mut stream).await["type"] == "api-request" {
            break;
        }
    }

    let started = std::time::Instant::now();
    sink.send(register).await.unwrap();
    let resp = tokio::time::timeout(Duration::from_secs(2), call)
        .await
        .expect("pending call outlived the re-registration")
        .unwrap()
        .unwrap();
    assert_eq!(resp.status(), 504);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "agent_disconnected");
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(relay.state.registry.count().await, 1);
}

#[tokio::test]
async fn invalid_registration_is_rejected() {
    let relay = start_relay(Duration::from_secs(5)).await;
    let (_agent, reply) = FakeAgent::connect(
        &relay,
        json!({ "type": "register", "churchToolsUrl": "https://a.church.tools" }),
        Behaviour::Succeed,
    )
    .await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["message"], "validation error: missing required fields: secret, uuid");
    assert_eq!(relay.state.registry.count().await, 0);
}

#[tokio::test]
async fn health_reports_sessions() {
    let relay = start_relay(Duration::from_secs(5)).await;
    let (_agent, _) =
        FakeAgent::connect(&relay, register_msg("u1", "s1", false), Behaviour::Succeed).await;

    let body: Value = reqwest::get(format!("http://{}/health", relay.addr))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["sessions"], 1);
}
