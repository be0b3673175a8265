//! Single-file indexing pipeline.
//!
//! Parser → outline assembly → outline/symbol rows, and chunk boundaries →
//! embedder → chunk rows. One outline node yields one chunk with the same
//! id, so an outline node id can be handed to `nodeSource` directly. A file
//! without symbols becomes a single whole-file chunk.
//!
//! Unchanged files (same content hash, already chunked) are skipped. Parse
//! errors are logged and do not stop indexing of the symbols that were found.

use sha2::{Digest, Sha256};
use std::collections::HashSet;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::embedding::Embedder;
use crate::error::Result;
use crate::models::{NewChunk, NewFile, NewSymbol, OutlineNode};
use crate::outline::{self, SourceParser};
use crate::store::ProjectStore;

/// Outcome of indexing one file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexReport {
    pub file_pk: i64,
    pub skipped: bool,
    pub chunks: usize,
    pub symbols: usize,
    pub outline_nodes: usize,
    pub parse_errors: usize,
}

/// Index (or re-index) `path` with contents `bytes`.
pub async fn index_file(
    store: &ProjectStore,
    parser: &dyn SourceParser,
    embedder: &dyn Embedder,
    path: &str,
    bytes: &[u8],
    language: &str,
) -> Result<IndexReport> {
    let hash = hex::encode(Sha256::digest(bytes));

    let existing = store.get_file_by_path(path).await?;
    if let Some(ref file) = existing {
        if file.hash == hash && file.chunk_count > 0 {
            debug!(path, "unchanged, skipping");
            return Ok(IndexReport {
                file_pk: file.pk,
                skipped: true,
                ..IndexReport::default()
            });
        }
    }

    let file = store
        .upsert_file(&NewFile {
            id: existing
                .map(|f| f.id)
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            path: path.to_string(),
            hash,
            last_modified: chrono::Utc::now().timestamp(),
            chunk_count: 0,
        })
        .await?;

    let parsed = parser.parse_file(path, bytes);
    for err in &parsed.errors {
        warn!(path, error = %err, "parse error");
    }

    let nodes = outline::build_outline(path, &parsed.symbols);
    store.replace_outline(file.pk, &nodes).await?;

    let text = String::from_utf8_lossy(bytes);
    let lines = LineIndex::new(&text);

    // One chunk per distinct location; the first node at a location wins.
    let mut seen_locations = HashSet::new();
    let mut spans: Vec<ChunkSpan> = Vec::new();
    for (i, node) in nodes.iter().enumerate() {
        if node.end_line < node.start_line {
            warn!(
                path,
                node = %node.name,
                start = node.start_line,
                end = node.end_line,
                "skipping chunk with inverted line range"
            );
            continue;
        }
        if !seen_locations.insert((node.start_line, node.end_line)) {
            continue;
        }
        let parent = parsed
            .symbols
            .get(i)
            .map(|s| s.parent.clone())
            .unwrap_or_default();
        spans.push(ChunkSpan::from_node(node, parent));
    }
    if spans.is_empty() && lines.count() > 0 {
        let end = lines.count() as i64;
        spans.push(ChunkSpan {
            id: outline::node_id(path, 1, end, path),
            start_line: 1,
            end_line: end,
            symbol_name: String::new(),
            symbol_kind: String::new(),
            parent: String::new(),
        });
    }

    let texts: Vec<String> = spans
        .iter()
        .map(|s| lines.slice(s.start_line, s.end_line).to_string())
        .collect();
    let vectors = if texts.is_empty() {
        Vec::new()
    } else {
        embedder.embed(&texts).await?
    };

    let keep: Vec<String> = spans.iter().map(|s| s.id.clone()).collect();
    store.delete_chunks_except(file.pk, &keep).await?;
    store.delete_symbols_for_file(file.pk).await?;

    let mut chunks = 0;
    for ((span, content), vector) in spans.iter().zip(texts).zip(vectors) {
        let (char_start, char_end) = lines.char_range(span.start_line, span.end_line);
        let chunk = NewChunk {
            id: span.id.clone(),
            file_pk: file.pk,
            token_count: Some(content.split_whitespace().count() as i64),
            source_code: Some(content.clone()),
            content,
            embedding: vector,
            line_start: span.start_line,
            line_end: span.end_line,
            char_start,
            char_end,
            language: language.to_string(),
            symbol_name: span.symbol_name.clone(),
            symbol_kind: span.symbol_kind.clone(),
            parent: span.parent.clone(),
            embedding_model_id: embedder.model_id().to_string(),
            ..NewChunk::default()
        };
        match store.upsert_chunk(&chunk).await {
            Ok(_) => chunks += 1,
            Err(e) if e.is_conflict() => warn!(path, chunk = %chunk.id, "skipping chunk: {}", e),
            Err(e) => return Err(e),
        }
    }

    let mut symbols = 0;
    let mut seen_symbols = HashSet::new();
    for node in &nodes {
        if !seen_symbols.insert(node.id.as_str()) {
            continue;
        }
        store
            .upsert_symbol(&NewSymbol {
                id: node.id.clone(),
                file_pk: file.pk,
                name: node.name.clone(),
                kind: node.kind.clone(),
                line: node.start_line,
                character: 0,
            })
            .await?;
        symbols += 1;
    }

    store.set_chunk_count(file.pk, chunks as i64).await?;

    Ok(IndexReport {
        file_pk: file.pk,
        skipped: false,
        chunks,
        symbols,
        outline_nodes: seen_symbols.len(),
        parse_errors: parsed.errors.len(),
    })
}

/// Run `f` with the project's `is_indexing` flag raised, lowering it afterwards
/// whether or not `f` succeeded.
pub async fn with_indexing<F, Fut, T>(store: &ProjectStore, f: F) -> Result<T>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    store.set_indexing(true).await?;
    let result = f().await;
    store.set_indexing(false).await?;
    result
}

/// Re-embed every chunk whose vector is missing or came from another model.
/// Returns the number of chunks updated.
pub async fn reembed_stale(store: &ProjectStore, embedder: &dyn Embedder) -> Result<usize> {
    const BATCH: usize = 32;

    let stale = store.stale_chunk_ids(embedder.model_id()).await?;
    let mut updated = 0;
    for batch in stale.chunks(BATCH) {
        let mut ids = Vec::with_capacity(batch.len());
        let mut texts = Vec::with_capacity(batch.len());
        for id in batch {
            if let Some(chunk) = store.get_chunk_by_id(id).await? {
                ids.push(chunk.id);
                texts.push(chunk.content);
            }
        }
        if texts.is_empty() {
            continue;
        }
        let vectors = embedder.embed(&texts).await?;
        for (id, vector) in ids.iter().zip(vectors) {
            if store
                .update_chunk_embedding(id, &vector, embedder.model_id())
                .await?
            {
                updated += 1;
            }
        }
    }
    Ok(updated)
}

struct ChunkSpan {
    id: String,
    start_line: i64,
    end_line: i64,
    symbol_name: String,
    symbol_kind: String,
    parent: String,
}

impl ChunkSpan {
    fn from_node(node: &OutlineNode, parent: String) -> Self {
        Self {
            id: node.id.clone(),
            start_line: node.start_line,
            end_line: node.end_line,
            symbol_name: node.name.clone(),
            symbol_kind: node.kind.clone(),
            parent,
        }
    }
}

/// Byte offsets of line starts, for slicing 1-based inclusive line ranges.
struct LineIndex<'a> {
    text: &'a str,
    starts: Vec<usize>,
}

impl<'a> LineIndex<'a> {
    fn new(text: &'a str) -> Self {
        let mut starts = vec![0];
        for (i, b) in text.bytes().enumerate() {
            if b == b'\n' && i + 1 < text.len() {
                starts.push(i + 1);
            }
        }
        if text.is_empty() {
            starts.clear();
        }
        Self { text, starts }
    }

    fn count(&self) -> usize {
        self.starts.len()
    }

    fn byte_range(&self, start_line: i64, end_line: i64) -> (usize, usize) {
        if self.starts.is_empty() {
            return (0, 0);
        }
        let last = self.starts.len() as i64;
        let start = start_line.clamp(1, last) as usize - 1;
        let end = end_line.clamp(start as i64 + 1, last) as usize;
        let from = self.starts[start];
        let to = self
            .starts
            .get(end)
            .copied()
            .unwrap_or(self.text.len());
        (from, to)
    }

    fn slice(&self, start_line: i64, end_line: i64) -> &'a str {
        let (from, to) = self.byte_range(start_line, end_line);
        self.text[from..to].trim_end_matches(&['\n', '\r'][..])
    }

    /// Character (not byte) offsets of the range.
    fn char_range(&self, start_line: i64, end_line: i64) -> (i64, i64) {
        let (from, to) = self.byte_range(start_line, end_line);
        let char_from = self.text[..from].chars().count() as i64;
        let char_to = char_from + self.text[from..to].chars().count() as i64;
        (char_from, char_to)
    }
}
