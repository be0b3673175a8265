//! Project service: the read interface the MCP tools delegate to.
//!
//! [`LocalProjectService`] resolves a project id to its store under
//! `[storage].root`, opening (and migrating) stores lazily and keeping them
//! open. An id without an existing store is reported as not found; stores
//! are only created by `codectx init`.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::config::StorageConfig;
use crate::embedding::Embedder;
use crate::error::{Error, Result};
use crate::models::{Chunk, OutlineTree, ProjectMeta, ScoredChunk};
use crate::store::ProjectStore;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResponse {
    pub results: Vec<ScoredChunk>,
    pub total_results: usize,
    pub query_time_ms: i64,
}

#[async_trait]
pub trait ProjectService: Send + Sync {
    async fn search(&self, project_id: &str, query: &str, k: usize) -> Result<SearchResponse>;

    async fn get_file_outline(&self, project_id: &str, path: &str) -> Result<Vec<OutlineTree>>;

    /// Chunk by id; an outline node id resolves to the chunk at the node's location.
    async fn get_chunk_by_id(&self, project_id: &str, id: &str) -> Result<Option<Chunk>>;

    async fn get_project(&self, project_id: &str) -> Result<Option<ProjectMeta>>;
}

/// Reject ids that could escape the storage root.
pub fn validate_project_id(project_id: &str) -> Result<()> {
    let valid = !project_id.is_empty()
        && project_id != "."
        && !project_id.contains("..")
        && project_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "invalid project id '{}': use letters, digits, '.', '_' or '-'",
            project_id
        )))
    }
}

pub struct LocalProjectService {
    storage: StorageConfig,
    embedder: Arc<dyn Embedder>,
    stores: Mutex<HashMap<String, ProjectStore>>,
}

impl LocalProjectService {
    pub fn new(storage: StorageConfig, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            storage,
            embedder,
            stores: Mutex::new(HashMap::new()),
        }
    }

    /// Open store for `project_id`, or `NotFound` if the project was never created.
    pub async fn store(&self, project_id: &str) -> Result<ProjectStore> {
        validate_project_id(project_id)?;
        if let Some(store) = self.cached(project_id) {
            return Ok(store);
        }

        let path = self.storage.project_db_path(project_id);
        if !path.exists() {
            return Err(Error::not_found("project", project_id));
        }

        let opened = ProjectStore::open(&path, self.storage.busy_timeout()).await?;
        let mut stores = self.stores.lock().unwrap_or_else(|e| e.into_inner());
        // Another caller may have opened it meanwhile; keep the first.
        let store = stores
            .entry(project_id.to_string())
            .or_insert(opened)
            .clone();
        Ok(store)
    }

    /// Create the project's store and record its metadata.
    pub async fn create_project(
        &self,
        project_id: &str,
        name: &str,
        description: Option<&str>,
    ) -> Result<ProjectMeta> {
        validate_project_id(project_id)?;
        let path = self.storage.project_db_path(project_id);
        let store = ProjectStore::open(&path, self.storage.busy_timeout()).await?;
        let meta = store.create_project_meta(project_id, name, description).await?;

        let mut stores = self.stores.lock().unwrap_or_else(|e| e.into_inner());
        stores.entry(project_id.to_string()).or_insert(store);
        Ok(meta)
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    fn cached(&self, project_id: &str) -> Option<ProjectStore> {
        let stores = self.stores.lock().unwrap_or_else(|e| e.into_inner());
        stores.get(project_id).cloned()
    }
}

#[async_trait]
impl ProjectService for LocalProjectService {
    async fn search(&self, project_id: &str, query: &str, k: usize) -> Result<SearchResponse> {
        let start = Instant::now();
        let store = self.store(project_id).await?;
        let query_vec = self.embedder.embed_one(query).await?;
        let results = store
            .search_embeddings(&query_vec, self.embedder.model_id(), k)
            .await?;
        Ok(SearchResponse {
            total_results: results.len(),
            results,
            query_time_ms: start.elapsed().as_millis() as i64,
        })
    }

    async fn get_file_outline(&self, project_id: &str, path: &str) -> Result<Vec<OutlineTree>> {
        let store = self.store(project_id).await?;
        store.get_outline(path).await
    }

    async fn get_chunk_by_id(&self, project_id: &str, id: &str) -> Result<Option<Chunk>> {
        let store = self.store(project_id).await?;
        if let Some(chunk) = store.get_chunk_by_id(id).await? {
            return Ok(Some(chunk));
        }
        match store.find_outline_node(id).await? {
            Some((file, node)) => store.chunk_at(file.pk, node.start_line, node.end_line).await,
            None => Ok(None),
        }
    }

    async fn get_project(&self, project_id: &str) -> Result<Option<ProjectMeta>> {
        match self.store(project_id).await {
            Ok(store) => store.get_project_meta().await,
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}
