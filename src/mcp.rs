//! MCP JSON-RPC protocol bridge.
//!
//! A [`ServerInstance`] is the per-project tool host: it knows which project
//! it is bound to (or that it is unbound) and which tools are currently
//! registered on it. [`McpBridge`] adapts an instance to rmcp's
//! [`ServerHandler`], so every MCP session opened on `/mcp/<projectId>`
//! lists and calls that instance's tools.
//!
//! Tool failures are returned as `isError` tool results, never as transport
//! errors, and are recorded as the server's last error.

use std::borrow::Cow;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use rmcp::model::*;
use rmcp::{ErrorData as McpError, ServerHandler};
use serde_json::Value;
use tracing::warn;

use crate::error::{Error, Result};
use crate::project::ProjectService;
use crate::registry::ToolRegistry;
use crate::tools::{Tool as CodeTool, ToolContext};

pub struct ServerInstance {
    ctx: ToolContext,
    tools: RwLock<Vec<Arc<dyn CodeTool>>>,
}

impl ServerInstance {
    /// A new instance with no tools. `None` (or an empty id) builds the unbound instance.
    pub fn new(project_id: Option<String>, service: Arc<dyn ProjectService>) -> Self {
        Self {
            ctx: ToolContext::new(project_id, service),
            tools: RwLock::new(Vec::new()),
        }
    }

    pub fn project_id(&self) -> Option<&str> {
        self.ctx.project_id()
    }

    /// Add a tool, replacing a registered tool of the same name in place.
    pub fn add_tool(&self, tool: Arc<dyn CodeTool>) {
        let mut tools = self.tools.write().unwrap_or_else(|e| e.into_inner());
        match tools.iter_mut().find(|t| t.name() == tool.name()) {
            Some(existing) => *existing = tool,
            None => tools.push(tool),
        }
    }

    pub fn remove_tool(&self, name: &str) -> bool {
        let mut tools = self.tools.write().unwrap_or_else(|e| e.into_inner());
        let before = tools.len();
        tools.retain(|t| t.name() != name);
        tools.len() != before
    }

    pub fn tool(&self, name: &str) -> Option<Arc<dyn CodeTool>> {
        let tools = self.tools.read().unwrap_or_else(|e| e.into_inner());
        tools.iter().find(|t| t.name() == name).cloned()
    }

    pub fn tools(&self) -> Vec<Arc<dyn CodeTool>> {
        self.tools.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools()
            .iter()
            .map(|t| t.name().to_string())
            .collect()
    }

    /// Run a registered tool against this instance's project.
    pub async fn call(&self, name: &str, params: Value) -> Result<Value> {
        let tool = self
            .tool(name)
            .ok_or_else(|| Error::not_found("tool", name))?;
        tool.execute(params, &self.ctx).await
    }
}

/// Bridges one [`ServerInstance`] to the MCP protocol.
///
/// rmcp creates one handler per session; clones share the instance and the registry.
#[derive(Clone)]
pub struct McpBridge {
    instance: Arc<ServerInstance>,
    registry: Arc<ToolRegistry>,
}

impl McpBridge {
    pub fn new(instance: Arc<ServerInstance>, registry: Arc<ToolRegistry>) -> Self {
        Self { instance, registry }
    }

    /// Convert a code tool into an rmcp `Tool` descriptor.
    fn to_mcp_tool(tool: &dyn CodeTool) -> Tool {
        let input_schema: Arc<serde_json::Map<String, Value>> = match tool.parameters_schema() {
            Value::Object(map) => Arc::new(map),
            _ => Arc::new(serde_json::Map::new()),
        };

        Tool {
            name: Cow::Owned(tool.name().to_string()),
            title: None,
            description: Some(Cow::Owned(tool.description().to_string())),
            input_schema,
            output_schema: None,
            annotations: Some(ToolAnnotations::new().read_only(true)),
            execution: None,
            icons: None,
            meta: None,
        }
    }

    fn instructions(&self) -> String {
        match self.instance.project_id() {
            Some(id) => format!(
                "Code index for project '{}'. Use search to find relevant code, outline to see \
                 a file's structure, and nodeSource to read a chunk or outline node by id.",
                id
            ),
            None => "No project is bound to this endpoint. Connect to /mcp/<projectId> to use \
                     the search, outline, and nodeSource tools."
                .to_string(),
        }
    }
}

impl ServerHandler for McpBridge {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::LATEST,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "codectx".to_string(),
                title: Some("codectx".to_string()),
                version: env!("CARGO_PKG_VERSION").to_string(),
                description: None,
                icons: None,
                website_url: None,
            },
            instructions: Some(self.instructions()),
        }
    }

    fn list_tools(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: rmcp::service::RequestContext<rmcp::RoleServer>,
    ) -> impl std::future::Future<Output = std::result::Result<ListToolsResult, McpError>> + Send + '_
    {
        let tools: Vec<Tool> = self
            .instance
            .tools()
            .iter()
            .map(|t| Self::to_mcp_tool(t.as_ref()))
            .collect();
        std::future::ready(Ok(ListToolsResult::with_all_items(tools)))
    }

    fn get_tool(&self, name: &str) -> Option<Tool> {
        self.instance
            .tool(name)
            .map(|t| Self::to_mcp_tool(t.as_ref()))
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParams,
        _context: rmcp::service::RequestContext<rmcp::RoleServer>,
    ) -> std::result::Result<CallToolResult, McpError> {
        let tool = self.instance.tool(&request.name).ok_or_else(|| {
            McpError::new(
                ErrorCode::METHOD_NOT_FOUND,
                format!("no tool registered with name: {}", request.name),
                None,
            )
        })?;

        let params = request
            .arguments
            .map(Value::Object)
            .unwrap_or(Value::Object(serde_json::Map::new()));

        let started = Instant::now();
        let result = tool.execute(params, &self.instance.ctx).await;
        self.registry.record_call(tool.name(), started.elapsed());

        match result {
            Ok(value) => {
                let text = serde_json::to_string_pretty(&value).unwrap_or_default();
                Ok(CallToolResult::success(vec![Content::text(text)]))
            }
            Err(e) => {
                let project = self.instance.project_id().unwrap_or("<unbound>");
                warn!(tool = tool.name(), project, error = %e, "tool call failed");
                self.registry
                    .metrics()
                    .record_error(format!("{}: {}", tool.name(), e));
                Ok(CallToolResult::error(vec![Content::text(e.to_string())]))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Chunk, OutlineTree, ProjectMeta};
    use crate::project::SearchResponse;
    use crate::settings::MemorySettings;
    use crate::status::Metrics;
    use async_trait::async_trait;

    struct EmptyService;

    #[async_trait]
    impl ProjectService for EmptyService {
        async fn search(&self, _p: &str, _q: &str, _k: usize) -> Result<SearchResponse> {
            Ok(SearchResponse {
                results: Vec::new(),
                total_results: 0,
                query_time_ms: 0,
            })
        }
        async fn get_file_outline(&self, _p: &str, _path: &str) -> Result<Vec<OutlineTree>> {
            Ok(Vec::new())
        }
        async fn get_chunk_by_id(&self, _p: &str, _id: &str) -> Result<Option<Chunk>> {
            Ok(None)
        }
        async fn get_project(&self, _p: &str) -> Result<Option<ProjectMeta>> {
            Ok(None)
        }
    }

    fn bound_instance(project: Option<&str>) -> Arc<ServerInstance> {
        let registry =
            ToolRegistry::with_builtins(Arc::new(Metrics::new()), Arc::new(MemorySettings::new()));
        let instance = Arc::new(ServerInstance::new(
            project.map(str::to_string),
            Arc::new(EmptyService),
        ));
        registry.bind_enabled(&instance);
        instance
    }

    #[test]
    fn add_tool_replaces_by_name() {
        let instance = bound_instance(Some("p1"));
        assert_eq!(instance.tool_names(), vec!["search", "outline", "nodeSource"]);
        instance.add_tool(Arc::new(crate::tools::SearchTool));
        assert_eq!(instance.tool_names().len(), 3);
        assert!(instance.remove_tool("outline"));
        assert!(!instance.remove_tool("outline"));
        assert_eq!(instance.tool_names(), vec!["search", "nodeSource"]);
    }

    #[tokio::test]
    async fn unbound_instance_rejects_calls() {
        let instance = bound_instance(None);
        let err = instance
            .call("search", serde_json::json!({"query": "x"}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MissingProject));

        let instance = bound_instance(Some(""));
        assert_eq!(instance.project_id(), None);
    }

    #[tokio::test]
    async fn bound_instance_calls_service() {
        let instance = bound_instance(Some("p1"));
        let out = instance
            .call("search", serde_json::json!({"query": "x", "k": 3}))
            .await
            .unwrap();
        assert_eq!(out["totalResults"], 0);

        let err = instance.call("missing", Value::Null).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn descriptors_are_read_only() {
        let tool = McpBridge::to_mcp_tool(&crate::tools::OutlineTool);
        assert_eq!(tool.name, "outline");
        assert_eq!(tool.input_schema.get("type"), Some(&serde_json::json!("object")));
        assert_eq!(
            tool.annotations.and_then(|a| a.read_only_hint),
            Some(true)
        );
    }
}
