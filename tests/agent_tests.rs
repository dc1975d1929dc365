use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode},
};
use birdactyl::agent::engine::{
    ContainerConfig, ContainerEngine, ContainerStats, EngineError, HostConfig, LogStream,
};
use birdactyl::agent::pairing::OperatorPrompt;
use birdactyl::agent::{AgentState, router};
use birdactyl::config::{AgentConfig, NodesConfig};
use birdactyl::crypto::{NodeToken, is_lower_hex, sha256_hex};
use birdactyl::db::Store;
use birdactyl::protocol::{PairRequest, PairingError};
use birdactyl::services::{NodeError, NodeRegistration, NodeService};
use futures::StreamExt;
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

/// Answers every pairing prompt the same way.
struct ScriptedPrompt(bool);

#[async_trait]
impl OperatorPrompt for ScriptedPrompt {
    async fn confirm(&self, _request: &PairRequest) -> std::io::Result<bool> {
        Ok(self.0)
    }
}

#[derive(Default)]
struct Recorded {
    images: HashSet<String>,
    containers: HashMap<String, String>,
    pulled: Vec<String>,
    started: Vec<String>,
    stdin: Vec<(String, String)>,
}

#[derive(Default)]
struct FakeEngine {
    recorded: Mutex<Recorded>,
}

impl FakeEngine {
    fn with_image(image: &str) -> Self {
        let engine = Self::default();
        engine.recorded.lock().unwrap().images.insert(image.to_string());
        engine
    }

    fn known(&self, id: &str) -> Result<(), EngineError> {
        let recorded = self.recorded.lock().unwrap();
        if recorded.containers.values().any(|known| known == id) {
            Ok(())
        } else {
            Err(EngineError::NotFound(id.to_string()))
        }
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn init(&self) -> Result<String, EngineError> {
        Ok("27.0.1".to_string())
    }

    async fn pull_image(&self, image: &str) -> Result<(), EngineError> {
        let mut recorded = self.recorded.lock().unwrap();
        recorded.pulled.push(image.to_string());
        recorded.images.insert(image.to_string());
        Ok(())
    }

    async fn image_exists(&self, image: &str) -> bool {
        self.recorded.lock().unwrap().images.contains(image)
    }

    async fn create(
        &self,
        name: &str,
        _config: &ContainerConfig,
        _host: &HostConfig,
    ) -> Result<String, EngineError> {
        let id = format!("id-{name}");
        self.recorded
            .lock()
            .unwrap()
            .containers
            .insert(name.to_string(), id.clone());
        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<(), EngineError> {
        self.known(id)?;
        self.recorded.lock().unwrap().started.push(id.to_string());
        Ok(())
    }

    async fn stop(&self, id: &str, _timeout_secs: u32) -> Result<(), EngineError> {
        self.known(id)
    }

    async fn kill(&self, id: &str) -> Result<(), EngineError> {
        self.known(id)
    }

    async fn restart(&self, id: &str, _timeout_secs: u32) -> Result<(), EngineError> {
        self.known(id)
    }

    async fn remove(&self, id: &str, _force: bool) -> Result<(), EngineError> {
        self.known(id)?;
        self.recorded
            .lock()
            .unwrap()
            .containers
            .retain(|_, known| known != id);
        Ok(())
    }

    async fn exists(&self, name: &str) -> bool {
        self.recorded.lock().unwrap().containers.contains_key(name)
    }

    async fn id_of(&self, name: &str) -> Result<String, EngineError> {
        self.recorded
            .lock()
            .unwrap()
            .containers
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(name.to_string()))
    }

    async fn logs(&self, id: &str, _tail: Option<u32>, _follow: bool) -> Result<LogStream, EngineError> {
        self.known(id)?;
        let lines = vec![Ok("server starting".to_string()), Ok("done".to_string())];
        Ok(futures::stream::iter(lines).boxed())
    }

    async fn stats(&self, id: &str) -> Result<ContainerStats, EngineError> {
        self.known(id)?;
        Ok(ContainerStats {
            id: id.to_string(),
            name: "mc".to_string(),
            cpu_percent: 12.5,
            memory_percent: 40.0,
            memory_usage: "512MiB / 1GiB".to_string(),
            net_io: "1kB / 2kB".to_string(),
            block_io: "0B / 0B".to_string(),
            pids: 7,
        })
    }

    async fn send_stdin(&self, id: &str, line: &str) -> Result<(), EngineError> {
        self.known(id)?;
        self.recorded
            .lock()
            .unwrap()
            .stdin
            .push((id.to_string(), line.to_string()));
        Ok(())
    }
}

struct TestAgent {
    router: Router,
    state: Arc<AgentState>,
    engine: Arc<FakeEngine>,
}

fn spawn_agent(engine: FakeEngine, accept: bool) -> TestAgent {
    let engine = Arc::new(engine);
    let state = Arc::new(
        AgentState::new(
            AgentConfig::default(),
            None,
            engine.clone(),
            Arc::new(ScriptedPrompt(accept)),
            Some("27.0.1".to_string()),
        )
        .expect("Failed to create agent state"),
    );

    TestAgent {
        router: router(state.clone()),
        state,
        engine,
    }
}

async fn send(router: &Router, method: Method, uri: &str, token: Option<&str>, body: Option<Value>) -> (StatusCode, Vec<u8>) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, bytes.to_vec())
}

async fn send_json(router: &Router, method: Method, uri: &str, token: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
    let (status, bytes) = send(router, method, uri, token, body).await;
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

/// Pair the agent and return the credential the panel uses afterwards.
async fn pair(agent: &TestAgent) -> String {
    let daemon = NodeToken::generate();
    agent.state.pairing.arm(Duration::from_secs(60));

    let (status, body) = send_json(
        &agent.router,
        Method::POST,
        "/api/pair",
        None,
        Some(json!({
            "panel_url": "https://panel.example.com",
            "code": "ABCD2345",
            "daemon_token": daemon.to_header_value(),
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    daemon.to_header_value()
}

#[tokio::test]
async fn test_pairing_issues_token_once() {
    let agent = spawn_agent(FakeEngine::default(), true);
    agent.state.pairing.arm(Duration::from_secs(60));

    let request = json!({ "panel_url": "https://panel.example.com", "code": "ABCD2345" });
    let (status, body) = send_json(&agent.router, Method::POST, "/api/pair", None, Some(request.clone())).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert!(is_lower_hex(body["token_id"].as_str().unwrap(), 16));
    assert!(is_lower_hex(body["token"].as_str().unwrap(), 64));

    let panel = agent.state.config.panel().await;
    assert!(panel.is_paired());
    assert_eq!(panel.url.as_deref(), Some("https://panel.example.com"));

    let (status, body) = send_json(&agent.router, Method::POST, "/api/pair", None, Some(request)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "Pairing mode not active");
}

#[tokio::test]
async fn test_pairing_refused_when_not_armed() {
    let agent = spawn_agent(FakeEngine::default(), true);

    let (status, body) = send_json(
        &agent.router,
        Method::POST,
        "/api/pair",
        None,
        Some(json!({ "panel_url": "https://panel.example.com", "code": "ABCD2345" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "Pairing mode not active");
    assert!(!agent.state.config.panel().await.is_paired());
}

#[tokio::test]
async fn test_operator_rejection() {
    let agent = spawn_agent(FakeEngine::default(), false);
    agent.state.pairing.arm(Duration::from_secs(60));

    let (status, body) = send_json(
        &agent.router,
        Method::POST,
        "/api/pair",
        None,
        Some(json!({ "panel_url": "https://panel.example.com", "code": "ABCD2345" })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "Pairing rejected by user");
    assert!(!agent.state.config.panel().await.is_paired());
}

#[tokio::test]
async fn test_malformed_pair_request() {
    let agent = spawn_agent(FakeEngine::default(), true);
    agent.state.pairing.arm(Duration::from_secs(60));

    let (status, body) = send_json(
        &agent.router,
        Method::POST,
        "/api/pair",
        None,
        Some(json!({ "code": "ABCD2345" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn test_panel_routes_require_daemon_token() {
    let agent = spawn_agent(FakeEngine::default(), true);

    let (status, _) = send_json(&agent.router, Method::GET, "/api/system", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let daemon = pair(&agent).await;

    let forged = NodeToken::generate().to_header_value();
    let (status, _) = send_json(&agent.router, Method::GET, "/api/system", Some(&forged), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = send_json(&agent.router, Method::GET, "/api/system", Some(&daemon), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["engine_version"], "27.0.1");
    assert_eq!(body["data"]["os"], std::env::consts::OS);
}

#[tokio::test]
async fn test_create_container_pulls_missing_image() {
    let agent = spawn_agent(FakeEngine::default(), true);
    let daemon = pair(&agent).await;

    let (status, body) = send_json(
        &agent.router,
        Method::POST,
        "/api/containers",
        Some(&daemon),
        Some(json!({
            "name": "mc",
            "config": { "image": "itzg/minecraft-server", "env": { "EULA": "TRUE" } },
            "host": { "memory_mib": 1024, "ports": [{ "host_port": 25565, "container_port": 25565 }] },
            "start": true
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["id"], "id-mc");

    {
        let recorded = agent.engine.recorded.lock().unwrap();
        assert_eq!(recorded.pulled, vec!["itzg/minecraft-server".to_string()]);
        assert_eq!(recorded.started, vec!["id-mc".to_string()]);
    }

    let (status, _) = send_json(
        &agent.router,
        Method::POST,
        "/api/containers",
        Some(&daemon),
        Some(json!({ "name": "mc", "config": { "image": "itzg/minecraft-server" } })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_create_container_skips_pull_for_local_image() {
    let agent = spawn_agent(FakeEngine::with_image("nginx:alpine"), true);
    let daemon = pair(&agent).await;

    let (status, _) = send_json(
        &agent.router,
        Method::POST,
        "/api/containers",
        Some(&daemon),
        Some(json!({ "name": "web", "config": { "image": "nginx:alpine" } })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let recorded = agent.engine.recorded.lock().unwrap();
    assert!(recorded.pulled.is_empty());
    assert!(recorded.started.is_empty());
}

#[tokio::test]
async fn test_container_operations() {
    let agent = spawn_agent(FakeEngine::with_image("nginx:alpine"), true);
    let daemon = pair(&agent).await;

    send_json(
        &agent.router,
        Method::POST,
        "/api/containers",
        Some(&daemon),
        Some(json!({ "name": "web", "config": { "image": "nginx:alpine" } })),
    )
    .await;

    let (status, body) = send_json(&agent.router, Method::GET, "/api/containers/lookup/web", Some(&daemon), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["id"], "id-web");

    let (status, _) = send_json(
        &agent.router,
        Method::POST,
        "/api/containers/id-web/power",
        Some(&daemon),
        Some(json!({ "action": "restart" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send_json(
        &agent.router,
        Method::POST,
        "/api/containers/id-web/command",
        Some(&daemon),
        Some(json!({ "command": "say hello" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send_json(
        &agent.router,
        Method::POST,
        "/api/containers/id-web/command",
        Some(&daemon),
        Some(json!({ "command": "say hello\nstop" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, bytes) = send(&agent.router, Method::GET, "/api/containers/id-web/logs?tail=10", Some(&daemon), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(String::from_utf8(bytes).unwrap(), "server starting\ndone\n");

    let (status, body) = send_json(&agent.router, Method::GET, "/api/containers/id-web/stats", Some(&daemon), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["pids"], 7);

    let (status, _) = send_json(&agent.router, Method::DELETE, "/api/containers/id-web?force=true", Some(&daemon), None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send_json(&agent.router, Method::GET, "/api/containers/id-web/stats", Some(&daemon), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let recorded = agent.engine.recorded.lock().unwrap();
    assert_eq!(recorded.stdin, vec![("id-web".to_string(), "say hello".to_string())]);
}

/// Serve the agent on a loopback port so the panel reaches it over HTTP.
async fn listen(agent: &TestAgent) -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let router = agent.router.clone();
    tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });
    port
}

async fn panel_nodes() -> (Store, NodeService) {
    let url = format!(
        "sqlite:{}/birdactyl-test-{}.db",
        std::env::temp_dir().display(),
        uuid::Uuid::new_v4()
    );
    let store = Store::new(&url).await.unwrap();
    let nodes = NodeService::new(
        store.clone(),
        "https://panel.example.com".to_string(),
        NodesConfig::default(),
    )
    .unwrap();
    (store, nodes)
}

fn local_node(port: u16) -> NodeRegistration {
    NodeRegistration {
        name: "local".to_string(),
        fqdn: "127.0.0.1".to_string(),
        port,
        scheme: "http".to_string(),
    }
}

#[tokio::test]
async fn test_panel_stores_only_the_token_digest() {
    let agent = spawn_agent(FakeEngine::default(), true);
    let port = listen(&agent).await;
    let (store, nodes) = panel_nodes().await;

    let node = nodes.create(local_node(port), "admin-1").await.unwrap();
    assert!(node.token_hash.is_none());

    agent.state.pairing.arm(Duration::from_secs(60));
    let paired = nodes.pair(&node.id, "ABC234", "admin-1").await.unwrap();

    let link = agent.state.config.panel().await;
    assert_eq!(link.url.as_deref(), Some("https://panel.example.com"));
    assert_eq!(link.daemon_token.as_deref(), Some(node.daemon_token.as_str()));
    let (token_id, secret) = link.token.as_deref().unwrap().split_once('.').unwrap();

    assert_eq!(paired.token_id.as_deref(), Some(token_id));
    assert_eq!(paired.token_hash.as_deref(), Some(sha256_hex(secret).as_str()));
    assert!(paired.auth_error.is_none());

    let stored = store.nodes().get_by_id(&node.id).await.unwrap().unwrap();
    let columns = [
        Some(stored.name.as_str()),
        Some(stored.fqdn.as_str()),
        Some(stored.scheme.as_str()),
        Some(stored.daemon_token.as_str()),
        stored.token_id.as_deref(),
        stored.token_hash.as_deref(),
        stored.auth_error.as_deref(),
    ];
    assert!(columns.into_iter().flatten().all(|value| !value.contains(secret)));

    let by_token = store.nodes().get_by_token_id(token_id).await.unwrap().unwrap();
    assert_eq!(by_token.id, node.id);
}

#[tokio::test]
async fn test_panel_records_refused_pairing() {
    let agent = spawn_agent(FakeEngine::default(), false);
    let port = listen(&agent).await;
    let (store, nodes) = panel_nodes().await;

    let node = nodes.create(local_node(port), "admin-1").await.unwrap();
    agent.state.pairing.arm(Duration::from_secs(60));

    let err = nodes.pair(&node.id, "ABC234", "admin-1").await.unwrap_err();
    assert!(matches!(err, NodeError::Pairing(PairingError::Rejected)), "{err}");

    let stored = store.nodes().get_by_id(&node.id).await.unwrap().unwrap();
    assert_eq!(stored.auth_error.as_deref(), Some("Pairing rejected by user"));
    assert!(stored.token_id.is_none());
    assert!(stored.token_hash.is_none());
    assert!(!agent.state.config.panel().await.is_paired());
}
