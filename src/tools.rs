//! Retrieval tools exposed to MCP clients.
//!
//! Each tool implements [`Tool`]: a stable name, a description, a JSON Schema
//! for its arguments, and an async `execute`. Tools are stateless; the
//! project they operate on comes from the [`ToolContext`] of the server
//! instance they are registered on. On the unbound instance every tool fails
//! with [`Error::MissingProject`].
//!
//! | Tool | Arguments | Result |
//! |------|-----------|--------|
//! | `search` | `query`, `k?` | `{results, totalResults, queryTimeMs}` |
//! | `outline` | `path`, `depth?` | `{outline}` |
//! | `nodeSource` | `id`, `collapseBody?` | `{chunkId, filePath, source, startLine, endLine, ...}` |

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::outline;
use crate::project::ProjectService;

pub const SEARCH: &str = "search";
pub const OUTLINE: &str = "outline";
pub const NODE_SOURCE: &str = "nodeSource";

pub const DEFAULT_K: usize = 8;
pub const MAX_K: usize = 50;

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON Schema of the arguments object.
    fn parameters_schema(&self) -> Value;

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value>;
}

/// What a tool call runs against: the bound project (if any) and the service.
#[derive(Clone)]
pub struct ToolContext {
    project_id: Option<String>,
    service: Arc<dyn ProjectService>,
}

impl ToolContext {
    pub fn new(project_id: Option<String>, service: Arc<dyn ProjectService>) -> Self {
        Self {
            project_id: project_id.filter(|id| !id.is_empty()),
            service,
        }
    }

    pub fn project_id(&self) -> Option<&str> {
        self.project_id.as_deref()
    }

    /// The bound project, or [`Error::MissingProject`] on the unbound instance.
    pub fn require_project(&self) -> Result<&str> {
        self.project_id.as_deref().ok_or(Error::MissingProject)
    }

    pub fn service(&self) -> &dyn ProjectService {
        self.service.as_ref()
    }
}

/// Absent or non-positive `k` becomes [`DEFAULT_K`]; larger values are capped at [`MAX_K`].
pub fn clamp_k(k: Option<i64>) -> usize {
    match k {
        Some(k) if k > 0 => (k as u64).min(MAX_K as u64) as usize,
        _ => DEFAULT_K,
    }
}

fn required_str<'a>(params: &'a Value, field: &str) -> Result<&'a str> {
    match params.get(field).and_then(Value::as_str) {
        Some(s) if !s.trim().is_empty() => Ok(s),
        _ => Err(Error::Validation(format!("{} must not be empty", field))),
    }
}

// ============ search ============

pub struct SearchTool;

#[async_trait]
impl Tool for SearchTool {
    fn name(&self) -> &str {
        SEARCH
    }

    fn description(&self) -> &str {
        "Semantic search over the project's indexed code chunks"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "Natural-language or code query" },
                "k": {
                    "type": "integer",
                    "description": "Number of results (1-50)",
                    "default": DEFAULT_K
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let project = ctx.require_project()?;
        let query = required_str(&params, "query")?;
        let k = clamp_k(params.get("k").and_then(Value::as_i64));

        let response = ctx.service().search(project, query, k).await?;
        Ok(serde_json::to_value(response)?)
    }
}

// ============ outline ============

pub struct OutlineTool;

#[async_trait]
impl Tool for OutlineTool {
    fn name(&self) -> &str {
        OUTLINE
    }

    fn description(&self) -> &str {
        "Structural outline (classes, functions, methods) of one file"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "File path relative to the project root" },
                "depth": {
                    "type": "integer",
                    "description": "Levels to keep; 1 returns top-level symbols only"
                }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let project = ctx.require_project()?;
        let path = required_str(&params, "path")?;

        let mut forest = ctx.service().get_file_outline(project, path).await?;
        if let Some(depth) = params.get("depth").and_then(Value::as_i64) {
            if depth > 0 {
                outline::truncate_depth(&mut forest, depth as usize);
            }
        }
        Ok(json!({ "outline": forest }))
    }
}

// ============ nodeSource ============

/// Body collapsing parameters for `nodeSource`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollapseOptions {
    /// Bodies with more lines than this are collapsed.
    pub max_lines: usize,
    pub head: usize,
    pub tail: usize,
}

impl Default for CollapseOptions {
    fn default() -> Self {
        Self {
            max_lines: 120,
            head: 60,
            tail: 40,
        }
    }
}

/// Replace the middle of an overlong body with a one-line marker.
///
/// Returns the body unchanged when it has at most `max_lines` lines. When
/// `head + tail` would exceed `max_lines` the split is shrunk evenly. Kept
/// lines keep their original line endings.
pub fn collapse_body(source: &str, opts: CollapseOptions) -> String {
    let lines: Vec<&str> = source.split_inclusive('\n').collect();
    if lines.len() <= opts.max_lines {
        return source.to_string();
    }

    let (head, tail) = if opts.head + opts.tail > opts.max_lines {
        let head = opts.max_lines / 2;
        (head, opts.max_lines - head)
    } else {
        (opts.head, opts.tail)
    };

    let elided = lines.len() - head - tail;
    let newline = match head.checked_sub(1).map(|i| lines[i]) {
        Some(line) if line.ends_with("\r\n") => "\r\n",
        _ => "\n",
    };
    let mut out = String::with_capacity(source.len());
    for line in &lines[..head] {
        out.push_str(line);
    }
    out.push_str(&format!("... {} lines collapsed ...{}", elided, newline));
    for line in &lines[lines.len() - tail..] {
        out.push_str(line);
    }
    out
}

pub struct NodeSourceTool {
    collapse: CollapseOptions,
}

impl NodeSourceTool {
    pub fn new(collapse: CollapseOptions) -> Self {
        Self { collapse }
    }
}

impl Default for NodeSourceTool {
    fn default() -> Self {
        Self::new(CollapseOptions::default())
    }
}

#[async_trait]
impl Tool for NodeSourceTool {
    fn name(&self) -> &str {
        NODE_SOURCE
    }

    fn description(&self) -> &str {
        "Source code of a chunk or outline node by id"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "id": { "type": "string", "description": "Chunk id or outline node id" },
                "collapseBody": {
                    "type": "boolean",
                    "description": "Elide the middle of long bodies",
                    "default": false
                }
            },
            "required": ["id"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let project = ctx.require_project()?;
        let id = required_str(&params, "id")?;
        let collapse = params
            .get("collapseBody")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let chunk = ctx
            .service()
            .get_chunk_by_id(project, id)
            .await?
            .ok_or_else(|| Error::not_found("node", id))?;

        let source = match chunk.source_code.as_deref() {
            Some(src) if !src.is_empty() => src,
            _ => chunk.content.as_str(),
        };
        let source = if collapse {
            collapse_body(source, self.collapse)
        } else {
            source.to_string()
        };

        let mut out = json!({
            "chunkId": chunk.id,
            "filePath": chunk.file_path,
            "source": source,
            "startLine": chunk.line_start,
            "endLine": chunk.line_end,
        });
        for (key, value) in [
            ("language", &chunk.language),
            ("symbolName", &chunk.symbol_name),
            ("symbolKind", &chunk.symbol_kind),
        ] {
            if !value.is_empty() {
                out[key] = json!(value);
            }
        }
        Ok(out)
    }
}

/// The built-in tools, in registration order.
pub fn builtin_tools() -> Vec<Arc<dyn Tool>> {
    vec![
        Arc::new(SearchTool),
        Arc::new(OutlineTool),
        Arc::new(NodeSourceTool::default()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Chunk, OutlineTree, ProjectMeta};
    use crate::project::SearchResponse;

    struct FakeService;

    fn chunk(id: &str, source: Option<&str>, content: &str) -> Chunk {
        Chunk {
            id: id.to_string(),
            file_pk: 1,
            file_path: "calc.go".to_string(),
            content: content.to_string(),
            embedding: Vec::new(),
            line_start: 5,
            line_end: 7,
            char_start: 0,
            char_end: 0,
            language: "go".to_string(),
            symbol_name: "Multiply".to_string(),
            symbol_kind: String::new(),
            parent: String::new(),
            signature: String::new(),
            visibility: String::new(),
            package_name: String::new(),
            doc_string: None,
            token_count: None,
            is_collapsed: false,
            source_code: source.map(str::to_string),
            embedding_model_id: String::new(),
            created_at: 0,
            updated_at: 0,
        }
    }

    #[async_trait]
    impl ProjectService for FakeService {
        async fn search(&self, _p: &str, query: &str, k: usize) -> Result<SearchResponse> {
            let results = (0..k.min(3))
                .map(|i| crate::models::ScoredChunk {
                    chunk: chunk(&format!("{}-{}", query, i), None, "x"),
                    score: 1.0,
                })
                .collect::<Vec<_>>();
            Ok(SearchResponse {
                total_results: results.len(),
                results,
                query_time_ms: k as i64,
            })
        }

        async fn get_file_outline(&self, _p: &str, path: &str) -> Result<Vec<OutlineTree>> {
            let leaf = |name: &str| OutlineTree {
                id: name.to_string(),
                name: name.to_string(),
                kind: "k".to_string(),
                start_line: 1,
                end_line: 1,
                children: Vec::new(),
            };
            let mut mid = leaf("mid");
            mid.children.push(leaf("leaf"));
            let mut root = leaf(path);
            root.children.push(mid);
            Ok(vec![root])
        }

        async fn get_chunk_by_id(&self, _p: &str, id: &str) -> Result<Option<Chunk>> {
            Ok(match id {
                "both" => Some(chunk(id, Some("canonical"), "generic")),
                "content-only" => Some(chunk(id, None, "generic")),
                "long" => {
                    let body = (1..=200).map(|i| format!("l{}", i)).collect::<Vec<_>>();
                    Some(chunk(id, Some(body.join("\n").as_str()), "generic"))
                }
                _ => None,
            })
        }

        async fn get_project(&self, _p: &str) -> Result<Option<ProjectMeta>> {
            Ok(None)
        }
    }

    fn bound() -> ToolContext {
        ToolContext::new(Some("p1".to_string()), Arc::new(FakeService))
    }

    fn unbound() -> ToolContext {
        ToolContext::new(None, Arc::new(FakeService))
    }

    #[test]
    fn k_is_clamped() {
        assert_eq!(clamp_k(None), 8);
        assert_eq!(clamp_k(Some(0)), 8);
        assert_eq!(clamp_k(Some(-4)), 8);
        assert_eq!(clamp_k(Some(1)), 1);
        assert_eq!(clamp_k(Some(50)), 50);
        assert_eq!(clamp_k(Some(1000)), 50);
    }

    #[test]
    fn collapse_two_hundred_lines() {
        let body: Vec<String> = (1..=200).map(|i| format!("line {}", i)).collect();
        let out = collapse_body(&body.join("\n"), CollapseOptions::default());
        let lines: Vec<&str> = out.lines().collect();

        assert_eq!(lines.len(), 101);
        assert_eq!(lines[..60], body[..60].iter().map(String::as_str).collect::<Vec<_>>()[..]);
        assert_eq!(lines[60], "... 100 lines collapsed ...");
        assert_eq!(lines[61..], body[160..].iter().map(String::as_str).collect::<Vec<_>>()[..]);
    }

    #[test]
    fn collapse_leaves_short_bodies_alone() {
        let body = (0..120).map(|i| i.to_string()).collect::<Vec<_>>().join("\n");
        assert_eq!(collapse_body(&body, CollapseOptions::default()), body);
    }

    #[test]
    fn collapse_shrinks_oversized_split() {
        let body = (0..30).map(|i| i.to_string()).collect::<Vec<_>>().join("\n");
        let opts = CollapseOptions {
            max_lines: 10,
            head: 8,
            tail: 8,
        };
        let out = collapse_body(&body, opts);
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 11);
        assert_eq!(lines[4], "4");
        assert_eq!(lines[5], "... 20 lines collapsed ...");
        assert_eq!(lines[6], "25");
    }

    #[test]
    fn collapse_keeps_crlf_line_endings() {
        let body: String = (0..10).map(|i| format!("{}\r\n", i)).collect();
        let opts = CollapseOptions {
            max_lines: 4,
            head: 2,
            tail: 2,
        };
        assert_eq!(
            collapse_body(&body, opts),
            "0\r\n1\r\n... 6 lines collapsed ...\r\n8\r\n9\r\n"
        );
    }

    #[tokio::test]
    async fn unbound_tools_fail_with_missing_project() {
        let ctx = unbound();
        for tool in builtin_tools() {
            let err = tool
                .execute(json!({"query": "q", "path": "a", "id": "b"}), &ctx)
                .await
                .unwrap_err();
            assert!(matches!(err, Error::MissingProject), "{}", tool.name());
        }
    }

    #[tokio::test]
    async fn search_defaults_and_validates() {
        let out = SearchTool
            .execute(json!({"query": "mul"}), &bound())
            .await
            .unwrap();
        assert_eq!(out["queryTimeMs"], 8);
        assert_eq!(out["totalResults"], 3);

        let err = SearchTool
            .execute(json!({"query": "  "}), &bound())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn outline_depth_truncation() {
        let out = OutlineTool
            .execute(json!({"path": "a.go", "depth": 1}), &bound())
            .await
            .unwrap();
        assert!(out["outline"][0].get("children").is_none());

        let out = OutlineTool
            .execute(json!({"path": "a.go", "depth": 2}), &bound())
            .await
            .unwrap();
        assert_eq!(out["outline"][0]["children"][0]["name"], "mid");
        assert!(out["outline"][0]["children"][0].get("children").is_none());

        let out = OutlineTool
            .execute(json!({"path": "a.go"}), &bound())
            .await
            .unwrap();
        assert_eq!(out["outline"][0]["children"][0]["children"][0]["name"], "leaf");
    }

    #[tokio::test]
    async fn node_source_prefers_canonical_source() {
        let tool = NodeSourceTool::default();
        let out = tool.execute(json!({"id": "both"}), &bound()).await.unwrap();
        assert_eq!(out["source"], "canonical");
        assert_eq!(out["chunkId"], "both");
        assert_eq!(out["symbolName"], "Multiply");
        assert!(out.get("symbolKind").is_none());

        let out = tool
            .execute(json!({"id": "content-only"}), &bound())
            .await
            .unwrap();
        assert_eq!(out["source"], "generic");

        let full = tool.execute(json!({"id": "long"}), &bound()).await.unwrap();
        assert_eq!(full["source"].as_str().unwrap().lines().count(), 200);
        let collapsed = tool
            .execute(json!({"id": "long", "collapseBody": true}), &bound())
            .await
            .unwrap();
        let lines: Vec<&str> = collapsed["source"].as_str().unwrap().lines().collect();
        assert_eq!(lines.len(), 101);
        assert_eq!(lines[0], "l1");
        assert_eq!(lines[59], "l60");
        assert_eq!(lines[60], "... 100 lines collapsed ...");
        assert_eq!(lines[61], "l161");
        assert_eq!(lines[100], "l200");

        let err = tool.execute(json!({"id": "nope"}), &bound()).await.unwrap_err();
        assert!(err.is_not_found());
        let err = tool.execute(json!({}), &bound()).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
