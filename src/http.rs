//! HTTP surface of the MCP listener.
//!
//! One listener serves every project. The request path selects the server
//! instance:
//!
//! | Path | Instance |
//! |------|----------|
//! | `/mcp` | unbound (tools fail with a missing-project error) |
//! | `/mcp/{projectId}` | the project's instance |
//! | `GET /health` | liveness check |
//! | `GET /tools/list` | registry view: names, enabled flags, call counts |
//!
//! Instances are built on first use and cached for the life of the listener.
//! Each instance owns its own rmcp streamable HTTP service and session
//! manager, so an MCP session never crosses projects.

use axum::{
    extract::{Request, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{any, get},
    Json, Router,
};
use rmcp::transport::streamable_http_server::{
    session::local::LocalSessionManager, StreamableHttpServerConfig, StreamableHttpService,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::debug;

use crate::mcp::{McpBridge, ServerInstance};
use crate::project::{validate_project_id, ProjectService};
use crate::registry::{ToolInfo, ToolRegistry};

pub const MCP_PREFIX: &str = "/mcp";

/// Extract the project id from a request path under `prefix`.
///
/// `/mcp`, `/mcp/`, and paths outside the prefix yield `None`; `/mcp/p1` and
/// `/mcp/p1/anything` yield `Some("p1")`.
pub fn parse_project_id(path: &str, prefix: &str) -> Option<String> {
    let rest = path.strip_prefix(prefix)?;
    let rest = rest.strip_prefix('/')?;
    let segment = rest.split('/').next().unwrap_or("");
    if segment.is_empty() {
        None
    } else {
        Some(segment.to_string())
    }
}

// ============ Instance cache ============

type McpService = StreamableHttpService<McpBridge, LocalSessionManager>;

struct CachedInstance {
    instance: Arc<ServerInstance>,
    service: Arc<McpService>,
}

/// Lazily built per-project server instances. Never evicted.
///
/// Cancelling `shutdown` ends every open MCP stream of every instance.
pub struct InstanceCache {
    service: Arc<dyn ProjectService>,
    registry: Arc<ToolRegistry>,
    shutdown: CancellationToken,
    entries: Mutex<HashMap<String, CachedInstance>>,
}

impl InstanceCache {
    pub fn new(
        service: Arc<dyn ProjectService>,
        registry: Arc<ToolRegistry>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            service,
            registry,
            shutdown,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// The instance for `project_id` (`None` for unbound), building it if needed.
    pub fn instance(&self, project_id: Option<&str>) -> Arc<ServerInstance> {
        self.get_or_build(project_id).0
    }

    /// All instances built so far.
    pub fn live_instances(&self) -> Vec<Arc<ServerInstance>> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.values().map(|c| c.instance.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get_or_build(&self, project_id: Option<&str>) -> (Arc<ServerInstance>, Arc<McpService>) {
        let key = project_id.unwrap_or("").to_string();
        // Binding and inserting happen under one lock, so a concurrent toggle
        // either sees the new instance or has already flipped the state it binds.
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let cached = entries
            .entry(key)
            .or_insert_with(|| self.build(project_id));
        (cached.instance.clone(), cached.service.clone())
    }

    fn build(&self, project_id: Option<&str>) -> CachedInstance {
        let instance = Arc::new(ServerInstance::new(
            project_id.map(str::to_string),
            self.service.clone(),
        ));
        self.registry.bind_enabled(&instance);
        debug!(project = project_id.unwrap_or("<unbound>"), "built server instance");

        let bridge = McpBridge::new(instance.clone(), self.registry.clone());
        let service = StreamableHttpService::new(
            move || Ok(bridge.clone()),
            LocalSessionManager::default().into(),
            StreamableHttpServerConfig {
                cancellation_token: self.shutdown.child_token(),
                ..Default::default()
            },
        );
        CachedInstance {
            instance,
            service: Arc::new(service),
        }
    }
}

// ============ Router ============

#[derive(Clone)]
struct AppState {
    cache: Arc<InstanceCache>,
    registry: Arc<ToolRegistry>,
}

pub fn router(cache: Arc<InstanceCache>, registry: Arc<ToolRegistry>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/tools/list", get(handle_list_tools))
        .route(MCP_PREFIX, any(handle_mcp))
        .route("/mcp/{project_id}", any(handle_mcp))
        .layer(cors)
        .with_state(AppState { cache, registry })
}

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

async fn handle_mcp(State(state): State<AppState>, request: Request) -> Response {
    let project_id = parse_project_id(request.uri().path(), MCP_PREFIX);
    if let Some(ref id) = project_id {
        if let Err(e) = validate_project_id(id) {
            return AppError {
                status: StatusCode::BAD_REQUEST,
                code: "bad_request",
                message: e.to_string(),
            }
            .into_response();
        }
    }

    let (_, service) = state.cache.get_or_build(project_id.as_deref());
    service.handle(request).await.map(axum::body::Body::new)
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

#[derive(Serialize)]
struct ToolListResponse {
    tools: Vec<ToolInfo>,
}

async fn handle_list_tools(State(state): State<AppState>) -> Json<ToolListResponse> {
    Json(ToolListResponse {
        tools: state.registry.infos(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, Result};
    use crate::models::{Chunk, OutlineTree, ProjectMeta};
    use crate::project::SearchResponse;
    use crate::settings::MemorySettings;
    use crate::status::Metrics;
    use async_trait::async_trait;

    struct NoProjects;

    #[async_trait]
    impl ProjectService for NoProjects {
        async fn search(&self, p: &str, _q: &str, _k: usize) -> Result<SearchResponse> {
            Err(Error::not_found("project", p))
        }
        async fn get_file_outline(&self, p: &str, _path: &str) -> Result<Vec<OutlineTree>> {
            Err(Error::not_found("project", p))
        }
        async fn get_chunk_by_id(&self, _p: &str, _id: &str) -> Result<Option<Chunk>> {
            Ok(None)
        }
        async fn get_project(&self, _p: &str) -> Result<Option<ProjectMeta>> {
            Ok(None)
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn instances_built_during_toggles_match_registry() {
        let registry = Arc::new(ToolRegistry::with_builtins(
            Arc::new(Metrics::new()),
            Arc::new(MemorySettings::new()),
        ));
        let cache = Arc::new(InstanceCache::new(
            Arc::new(NoProjects),
            registry.clone(),
            CancellationToken::new(),
        ));

        let builder = {
            let cache = cache.clone();
            tokio::task::spawn_blocking(move || {
                for i in 0..200 {
                    cache.instance(Some(&format!("p{i}")));
                }
            })
        };
        for _ in 0..7 {
            let live = cache.clone();
            registry
                .toggle_with("outline", move || live.live_instances())
                .await
                .unwrap();
            tokio::task::yield_now().await;
        }
        builder.await.unwrap();

        let enabled = registry.is_enabled("outline").unwrap();
        assert!(!enabled);
        assert_eq!(cache.len(), 200);
        for instance in cache.live_instances() {
            assert_eq!(instance.tool("outline").is_some(), enabled);
        }
    }

    #[test]
    fn project_id_from_path() {
        assert_eq!(parse_project_id("/mcp", MCP_PREFIX), None);
        assert_eq!(parse_project_id("/mcp/", MCP_PREFIX), None);
        assert_eq!(parse_project_id("/mcp/p1", MCP_PREFIX), Some("p1".to_string()));
        assert_eq!(parse_project_id("/mcp/p1/", MCP_PREFIX), Some("p1".to_string()));
        assert_eq!(
            parse_project_id("/mcp/p1/extra", MCP_PREFIX),
            Some("p1".to_string())
        );
        assert_eq!(parse_project_id("/mcpx/p1", MCP_PREFIX), None);
        assert_eq!(parse_project_id("/other/p1", MCP_PREFIX), None);
    }
}
