//! MCP server lifecycle and protocol tests against a live listener.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use codectx::config::{McpServerConfig, StorageConfig};
use codectx::embedding::HashEmbedder;
use codectx::ingest;
use codectx::outline::{ParseOutput, ParsedSymbol, SourceParser};
use codectx::project::LocalProjectService;
use codectx::registry::ToolInfo;
use codectx::server::{McpManager, SHUTDOWN_TIMEOUT, STATUS_INTERVAL};
use codectx::status::{McpStatus, StatusObserver};
use codectx::settings::{MemorySettings, SettingsStore, DISABLED_TOOLS_KEY, SERVER_CONFIG_KEY};
use codectx::Error;
use serde_json::{json, Value};
use tempfile::TempDir;

const SOURCE: &str = "mod geometry {\n    fn area(w: f64, h: f64) -> f64 {\n        w * h\n    }\n}\n";

struct FixedParser;

impl SourceParser for FixedParser {
    fn parse_file(&self, _path: &str, _bytes: &[u8]) -> ParseOutput {
        ParseOutput {
            symbols: vec![
                ParsedSymbol::new("geometry", "module", "", 1, 5),
                ParsedSymbol::new("area", "function", "geometry", 2, 4),
            ],
            errors: Vec::new(),
        }
    }
}

fn find_free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

async fn wait_for_server(port: u16) {
    let client = reqwest::Client::new();
    let url = format!("http://127.0.0.1:{}/health", port);
    for _ in 0..50 {
        if let Ok(resp) = client.get(&url).send().await {
            if resp.status().is_success() {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("Server did not become ready within 5 seconds");
}

fn server_config(port: u16) -> McpServerConfig {
    McpServerConfig {
        host: "127.0.0.1".to_string(),
        port: i64::from(port),
        protocol: "http".to_string(),
        max_connections: 16,
    }
}

struct Fixture {
    _tmp: TempDir,
    manager: McpManager,
    settings: Arc<MemorySettings>,
    port: u16,
}

/// Manager with one indexed project `p1`, not yet started.
async fn fixture() -> Fixture {
    let tmp = TempDir::new().unwrap();
    let embedder = Arc::new(HashEmbedder::new(64));
    let service = Arc::new(LocalProjectService::new(
        StorageConfig {
            root: tmp.path().join("projects"),
            busy_timeout_ms: 5000,
        },
        embedder.clone(),
    ));
    service.create_project("p1", "Geometry", None).await.unwrap();
    let store = service.store("p1").await.unwrap();
    ingest::index_file(
        &store,
        &FixedParser,
        embedder.as_ref(),
        "src/geometry.rs",
        SOURCE.as_bytes(),
        "rust",
    )
    .await
    .unwrap();

    let port = find_free_port();
    let settings = Arc::new(MemorySettings::new());
    let manager = McpManager::new(server_config(port), service, settings.clone());
    Fixture {
        _tmp: tmp,
        manager,
        settings,
        port,
    }
}

// ─── MCP client helpers ─────────────────────────────────────────────

struct McpClient {
    http: reqwest::Client,
    url: String,
    session: Option<String>,
    next_id: u64,
}

impl McpClient {
    fn new(port: u16, path: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: format!("http://127.0.0.1:{}{}", port, path),
            session: None,
            next_id: 1,
        }
    }

    fn post(&self, body: &Value) -> reqwest::RequestBuilder {
        let mut req = self
            .http
            .post(&self.url)
            .header("Accept", "application/json, text/event-stream")
            .json(body);
        if let Some(ref session) = self.session {
            req = req.header("mcp-session-id", session);
        }
        req
    }

    /// Send a request and return the JSON-RPC response message.
    async fn request(&mut self, method: &str, params: Value) -> Value {
        let id = self.next_id;
        self.next_id += 1;
        let body = json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params});
        let resp = self.post(&body).send().await.unwrap();
        assert!(resp.status().is_success(), "{} -> {}", method, resp.status());
        if let Some(session) = resp.headers().get("mcp-session-id") {
            self.session = Some(session.to_str().unwrap().to_string());
        }
        let text = tokio::time::timeout(Duration::from_secs(10), resp.text())
            .await
            .expect("response did not complete")
            .unwrap();
        find_response(&text, id)
    }

    async fn initialize(&mut self) -> Value {
        let result = self
            .request(
                "initialize",
                json!({
                    "protocolVersion": "2025-03-26",
                    "capabilities": {},
                    "clientInfo": {"name": "codectx-tests", "version": "0.0.0"}
                }),
            )
            .await;
        let note = json!({"jsonrpc": "2.0", "method": "notifications/initialized"});
        let resp = self.post(&note).send().await.unwrap();
        assert!(resp.status().is_success(), "initialized -> {}", resp.status());
        result
    }

    async fn call_tool(&mut self, name: &str, arguments: Value) -> Value {
        let resp = self
            .request("tools/call", json!({"name": name, "arguments": arguments}))
            .await;
        resp["result"].clone()
    }

    async fn tool_names(&mut self) -> Vec<String> {
        let resp = self.request("tools/list", json!({})).await;
        resp["result"]["tools"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap().to_string())
            .collect()
    }
}

/// The message answering `id`, from a plain JSON body or an SSE stream.
fn find_response(body: &str, id: u64) -> Value {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        return value;
    }
    body.lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .filter_map(|data| serde_json::from_str::<Value>(data.trim()).ok())
        .find(|msg| msg["id"] == json!(id))
        .unwrap_or_else(|| panic!("no response for id {} in: {}", id, body))
}

fn tool_text(result: &Value) -> String {
    result["content"][0]["text"].as_str().unwrap().to_string()
}

// ─── Lifecycle ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_start_and_stop_are_idempotent() {
    let fx = fixture().await;
    assert!(!fx.manager.is_running());
    fx.manager.stop().await.unwrap();

    fx.manager.start().await.unwrap();
    let addr = fx.manager.local_addr().unwrap();
    assert_eq!(addr.port(), fx.port);
    fx.manager.start().await.unwrap();
    assert_eq!(fx.manager.local_addr(), Some(addr));
    wait_for_server(fx.port).await;

    let status = fx.manager.status();
    assert!(status.is_running);

    fx.manager.stop().await.unwrap();
    fx.manager.stop().await.unwrap();
    let status = fx.manager.status();
    assert!(!status.is_running);
    assert_eq!(status.active_connections, 0);
    assert_eq!(status.uptime_seconds, 0);
    assert!(reqwest::get(format!("http://127.0.0.1:{}/health", fx.port))
        .await
        .is_err());

    // Restartable after a stop.
    fx.manager.start().await.unwrap();
    wait_for_server(fx.port).await;
    fx.manager.stop().await.unwrap();
}

#[tokio::test]
async fn test_bind_failure_returns_to_stopped() {
    let fx = fixture().await;
    let _occupied = std::net::TcpListener::bind(("127.0.0.1", fx.port)).unwrap();

    let err = fx.manager.start().await.unwrap_err();
    assert!(matches!(err, Error::Transport(_)), "got {err}");
    assert!(!fx.manager.is_running());
    assert!(fx.manager.status().last_error.is_some());
}

#[tokio::test]
async fn test_invalid_config_is_rejected_without_mutation() {
    let fx = fixture().await;
    let before = fx.manager.config();

    for bad in [
        McpServerConfig {
            host: "   ".to_string(),
            ..before.clone()
        },
        McpServerConfig {
            port: 0,
            ..before.clone()
        },
        McpServerConfig {
            port: -8080,
            ..before.clone()
        },
    ] {
        let err = fx.manager.update_config(bad).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)), "got {err}");
    }
    assert_eq!(fx.manager.config(), before);
    assert_eq!(fx.settings.get(SERVER_CONFIG_KEY).await.unwrap(), None);

    // Optional fields fall back to defaults instead of failing.
    fx.manager
        .update_config(McpServerConfig {
            protocol: "carrier-pigeon".to_string(),
            max_connections: 0,
            ..before.clone()
        })
        .await
        .unwrap();
    let cfg = fx.manager.config();
    assert_eq!(cfg.protocol, "http");
    assert_eq!(cfg.max_connections, 64);
    let stored: Value =
        serde_json::from_str(&fx.settings.get(SERVER_CONFIG_KEY).await.unwrap().unwrap()).unwrap();
    assert_eq!(stored["maxConnections"], 64);
}

#[tokio::test]
async fn test_update_config_restarts_on_new_port() {
    let fx = fixture().await;
    fx.manager.start().await.unwrap();
    wait_for_server(fx.port).await;

    let new_port = find_free_port();
    fx.manager
        .update_config(server_config(new_port))
        .await
        .unwrap();
    assert!(fx.manager.is_running());
    assert_eq!(fx.manager.local_addr().unwrap().port(), new_port);
    wait_for_server(new_port).await;

    fx.manager.stop().await.unwrap();
}

#[tokio::test]
async fn test_load_prefers_persisted_config_and_disabled_tools() {
    let fx = fixture().await;
    let persisted = server_config(find_free_port());
    fx.settings
        .set(SERVER_CONFIG_KEY, &serde_json::to_string(&persisted).unwrap())
        .await
        .unwrap();
    fx.settings
        .set(DISABLED_TOOLS_KEY, r#"["nodeSource"]"#)
        .await
        .unwrap();

    let tmp = TempDir::new().unwrap();
    let service = Arc::new(LocalProjectService::new(
        StorageConfig {
            root: tmp.path().to_path_buf(),
            busy_timeout_ms: 5000,
        },
        Arc::new(HashEmbedder::new(8)),
    ));
    let loaded = McpManager::load(server_config(1), service, fx.settings.clone())
        .await
        .unwrap();
    assert_eq!(loaded.config(), persisted);
    let disabled: Vec<String> = loaded
        .tools()
        .into_iter()
        .filter(|t| !t.enabled)
        .map(|t| t.name)
        .collect();
    assert_eq!(disabled, vec!["nodeSource"]);
}

#[tokio::test]
async fn test_load_falls_back_when_persisted_config_is_unusable() {
    let fx = fixture().await;
    let seed = server_config(find_free_port());
    let service = || {
        Arc::new(LocalProjectService::new(
            StorageConfig {
                root: fx._tmp.path().join("projects"),
                busy_timeout_ms: 5000,
            },
            Arc::new(HashEmbedder::new(8)),
        ))
    };

    // Not a config at all: the seed wins.
    fx.settings.set(SERVER_CONFIG_KEY, "{not json").await.unwrap();
    let loaded = McpManager::load(seed.clone(), service(), fx.settings.clone())
        .await
        .unwrap();
    assert_eq!(loaded.config(), seed);

    // Wrongly typed optional fields take their defaults; the rest is kept.
    fx.settings
        .set(
            SERVER_CONFIG_KEY,
            r#"{"host":"127.0.0.1","port":9123,"protocol":null,"maxConnections":"lots"}"#,
        )
        .await
        .unwrap();
    let loaded = McpManager::load(seed.clone(), service(), fx.settings.clone())
        .await
        .unwrap();
    let cfg = loaded.config();
    assert_eq!(cfg.port, 9123);
    assert_eq!(cfg.protocol, "http");
    assert_eq!(cfg.max_connections, 64);

    fx.settings
        .set(SERVER_CONFIG_KEY, r#"{"host":"127.0.0.1","port":9123,"maxConnections":null}"#)
        .await
        .unwrap();
    let loaded = McpManager::load(seed, service(), fx.settings.clone())
        .await
        .unwrap();
    assert_eq!(loaded.config().max_connections, 64);
}

#[derive(Default)]
struct RecordingObserver {
    statuses: Mutex<Vec<McpStatus>>,
    tool_events: Mutex<usize>,
}

impl RecordingObserver {
    fn statuses(&self) -> Vec<McpStatus> {
        self.statuses.lock().unwrap().clone()
    }
}

impl StatusObserver for RecordingObserver {
    fn status(&self, status: &McpStatus) {
        self.statuses.lock().unwrap().push(status.clone());
    }

    fn tools_changed(&self, _tools: &[ToolInfo]) {
        *self.tool_events.lock().unwrap() += 1;
    }
}

#[tokio::test]
async fn test_status_is_emitted_periodically_until_stop() {
    let fx = fixture().await;
    let observer = Arc::new(RecordingObserver::default());
    let manager = fx.manager.with_observer(observer.clone());

    manager.start().await.unwrap();
    assert_eq!(*observer.tool_events.lock().unwrap(), 1);
    tokio::time::sleep(STATUS_INTERVAL * 2 + Duration::from_millis(500)).await;

    let running = observer.statuses();
    assert!(running.len() >= 2, "got {} status events", running.len());
    assert!(running.iter().all(|s| s.is_running));

    manager.stop().await.unwrap();
    let after_stop = observer.statuses();
    let last = after_stop.last().unwrap();
    assert!(!last.is_running);
    assert_eq!(last.active_connections, 0);

    tokio::time::sleep(STATUS_INTERVAL + Duration::from_millis(500)).await;
    assert_eq!(observer.statuses().len(), after_stop.len());
}

#[tokio::test]
async fn test_stop_is_prompt_with_open_event_stream() {
    let fx = fixture().await;
    fx.manager.start().await.unwrap();
    wait_for_server(fx.port).await;

    let mut client = McpClient::new(fx.port, "/mcp/p1");
    client.initialize().await;
    let stream = client
        .http
        .get(&client.url)
        .header("Accept", "text/event-stream")
        .header("mcp-session-id", client.session.clone().unwrap())
        .send()
        .await
        .unwrap();
    assert!(stream.status().is_success(), "GET stream -> {}", stream.status());

    let started = Instant::now();
    fx.manager.stop().await.unwrap();
    assert!(
        started.elapsed() < SHUTDOWN_TIMEOUT,
        "stop took {:?}",
        started.elapsed()
    );
    assert_eq!(fx.manager.status().last_error, None);
    drop(stream);
}

// ─── HTTP surface ───────────────────────────────────────────────────

#[tokio::test]
async fn test_health_and_tool_list_endpoints() {
    let fx = fixture().await;
    fx.manager.start().await.unwrap();
    wait_for_server(fx.port).await;
    let client = reqwest::Client::new();

    let health: Value = client
        .get(format!("http://127.0.0.1:{}/health", fx.port))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["version"], env!("CARGO_PKG_VERSION"));

    let list: Value = client
        .get(format!("http://127.0.0.1:{}/tools/list", fx.port))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let names: Vec<&str> = list["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["search", "outline", "nodeSource"]);
    assert_eq!(list["tools"][0]["enabled"], true);
    assert_eq!(list["tools"][0]["callCount"], 0);

    let bad = client
        .post(format!("http://127.0.0.1:{}/mcp/a..b", fx.port))
        .header("Accept", "application/json, text/event-stream")
        .json(&json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}))
        .send()
        .await
        .unwrap();
    assert_eq!(bad.status(), 400);
    let body: Value = bad.json().await.unwrap();
    assert_eq!(body["error"]["code"], "bad_request");

    fx.manager.stop().await.unwrap();
}

// ─── MCP protocol ───────────────────────────────────────────────────

#[tokio::test]
async fn test_bound_project_tools_over_mcp() {
    let fx = fixture().await;
    fx.manager.start().await.unwrap();
    wait_for_server(fx.port).await;

    let mut client = McpClient::new(fx.port, "/mcp/p1");
    let init = client.initialize().await;
    assert_eq!(init["result"]["serverInfo"]["name"], "codectx");
    assert!(client.session.is_some());

    assert_eq!(
        client.tool_names().await,
        vec!["search", "outline", "nodeSource"]
    );

    let result = client
        .call_tool("search", json!({"query": "area of a rectangle", "k": 1}))
        .await;
    assert_ne!(result["isError"], json!(true));
    let search: Value = serde_json::from_str(&tool_text(&result)).unwrap();
    assert_eq!(search["totalResults"], 1);
    assert_eq!(search["results"][0]["filePath"], "src/geometry.rs");

    let result = client
        .call_tool("outline", json!({"path": "src/geometry.rs"}))
        .await;
    let outline: Value = serde_json::from_str(&tool_text(&result)).unwrap();
    assert_eq!(outline["outline"][0]["name"], "geometry");
    assert_eq!(outline["outline"][0]["children"][0]["name"], "area");
    let area_id = outline["outline"][0]["children"][0]["id"]
        .as_str()
        .unwrap()
        .to_string();

    let result = client.call_tool("nodeSource", json!({"id": area_id})).await;
    let source: Value = serde_json::from_str(&tool_text(&result)).unwrap();
    assert_eq!(source["startLine"], 2);
    assert_eq!(source["endLine"], 4);
    assert!(source["source"].as_str().unwrap().contains("w * h"));

    let result = client
        .call_tool("outline", json!({"path": "src/missing.rs"}))
        .await;
    assert_eq!(result["isError"], json!(true));

    let status = fx.manager.status();
    assert!(status.total_requests >= 4);
    assert!(status.last_error.is_some());
    let counts: Vec<(String, u64)> = fx
        .manager
        .tools()
        .into_iter()
        .map(|t| (t.name, t.call_count))
        .collect();
    assert_eq!(
        counts,
        vec![
            ("search".to_string(), 1),
            ("outline".to_string(), 2),
            ("nodeSource".to_string(), 1),
        ]
    );

    fx.manager.stop().await.unwrap();
}

#[tokio::test]
async fn test_unbound_endpoint_fails_tool_calls() {
    let fx = fixture().await;
    fx.manager.start().await.unwrap();
    wait_for_server(fx.port).await;

    let mut client = McpClient::new(fx.port, "/mcp");
    client.initialize().await;
    let result = client.call_tool("search", json!({"query": "area"})).await;
    assert_eq!(result["isError"], json!(true));
    assert!(tool_text(&result).contains("no project bound"));

    // The failure did not take the listener down.
    let mut bound = McpClient::new(fx.port, "/mcp/p1");
    bound.initialize().await;
    let result = bound.call_tool("search", json!({"query": "area"})).await;
    assert_ne!(result["isError"], json!(true));

    fx.manager.stop().await.unwrap();
}

#[tokio::test]
async fn test_toggle_applies_to_live_sessions() {
    let fx = fixture().await;
    fx.manager.start().await.unwrap();
    wait_for_server(fx.port).await;

    let mut client = McpClient::new(fx.port, "/mcp/p1");
    client.initialize().await;
    client.call_tool("search", json!({"query": "area"})).await;

    assert!(!fx.manager.toggle_tool("outline").await.unwrap());
    assert_eq!(client.tool_names().await, vec!["search", "nodeSource"]);
    assert_eq!(
        fx.settings.get(DISABLED_TOOLS_KEY).await.unwrap().as_deref(),
        Some(r#"["outline"]"#)
    );

    // Instances built after the toggle also skip the disabled tool.
    let mut other = McpClient::new(fx.port, "/mcp/p2");
    other.initialize().await;
    assert_eq!(other.tool_names().await, vec!["search", "nodeSource"]);

    assert!(fx.manager.toggle_tool("outline").await.unwrap());
    let names = client.tool_names().await;
    assert!(names.contains(&"outline".to_string()));
    assert_eq!(fx.manager.registry().call_count("search"), Some(1));

    let err = fx.manager.toggle_tool("nope").await.unwrap_err();
    assert!(err.is_not_found());

    fx.manager.stop().await.unwrap();
}
