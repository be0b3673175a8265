//! Core data models stored in a project's index.
//!
//! Every row belongs to exactly one project store. Files carry a store-local
//! integer surrogate (`pk`) that chunks, symbols, and outline nodes reference;
//! it never leaves the store, so it is skipped during serialization.

use serde::{Deserialize, Serialize};

/// An indexed source file.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct File {
    #[serde(skip)]
    pub pk: i64,
    pub id: String,
    pub path: String,
    pub hash: String,
    pub last_modified: i64,
    pub chunk_count: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Input for [`crate::store::ProjectStore::upsert_file`]. Rows are keyed by `path`.
#[derive(Debug, Clone)]
pub struct NewFile {
    pub id: String,
    pub path: String,
    pub hash: String,
    pub last_modified: i64,
    pub chunk_count: i64,
}

/// A contiguous span of a file with its embedding and semantic metadata.
///
/// At most one chunk exists per `(file, line_start, line_end)`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    pub id: String,
    #[serde(skip)]
    pub file_pk: i64,
    pub file_path: String,
    pub content: String,
    #[serde(skip)]
    pub embedding: Vec<f32>,
    pub line_start: i64,
    pub line_end: i64,
    pub char_start: i64,
    pub char_end: i64,
    pub language: String,
    pub symbol_name: String,
    pub symbol_kind: String,
    pub parent: String,
    pub signature: String,
    pub visibility: String,
    pub package_name: String,
    pub doc_string: Option<String>,
    pub token_count: Option<i64>,
    pub is_collapsed: bool,
    pub source_code: Option<String>,
    pub embedding_model_id: String,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Input for [`crate::store::ProjectStore::upsert_chunk`].
#[derive(Debug, Clone, Default)]
pub struct NewChunk {
    pub id: String,
    pub file_pk: i64,
    pub content: String,
    pub embedding: Vec<f32>,
    pub line_start: i64,
    pub line_end: i64,
    pub char_start: i64,
    pub char_end: i64,
    pub language: String,
    pub symbol_name: String,
    pub symbol_kind: String,
    pub parent: String,
    pub signature: String,
    pub visibility: String,
    pub package_name: String,
    pub doc_string: Option<String>,
    pub token_count: Option<i64>,
    pub is_collapsed: bool,
    pub source_code: Option<String>,
    pub embedding_model_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Symbol {
    pub id: String,
    #[serde(skip)]
    pub file_pk: i64,
    pub name: String,
    pub kind: String,
    pub line: i64,
    pub character: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone)]
pub struct NewSymbol {
    pub id: String,
    pub file_pk: i64,
    pub name: String,
    pub kind: String,
    pub line: i64,
    pub character: i64,
}

/// Join row: the symbol's line falls inside the chunk's line range.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChunkSymbol {
    pub chunk_id: String,
    pub symbol_id: String,
}

/// One entry of a file's structural outline, stored flat.
///
/// `position` is the node's index among its siblings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutlineNode {
    pub id: String,
    pub parent_id: Option<String>,
    pub name: String,
    pub kind: String,
    pub start_line: i64,
    pub end_line: i64,
    pub position: i64,
}

/// Nested view of outline nodes, as returned to protocol clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutlineTree {
    pub id: String,
    pub name: String,
    pub kind: String,
    pub start_line: i64,
    pub end_line: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<OutlineTree>,
}

/// Project description persisted inside the project's own store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectMeta {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub config_json: String,
    pub is_indexing: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A chunk ranked by similarity to a query.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoredChunk {
    #[serde(flatten)]
    pub chunk: Chunk,
    pub score: f32,
}

/// Row counts for one store.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub files: i64,
    pub chunks: i64,
    pub symbols: i64,
    pub outline_nodes: i64,
    /// Chunk counts per `embedding_model_id`.
    pub embedding_models: Vec<(String, i64)>,
}
