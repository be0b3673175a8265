//! Per-project index store.
//!
//! A [`ProjectStore`] owns one SQLite database (`<root>/<projectId>/index.sqlite`)
//! holding the project's files, chunks, symbols, outline, and metadata.
//! Opening a store applies pending migrations; a store that fails to migrate
//! is never returned.
//!
//! Write paths keep transactions short: each upsert or replace is a single
//! transaction so the indexing writer and the read-serving MCP path interleave
//! under WAL without long lock holds.

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::db;
use crate::embedding;
use crate::error::{Error, Result};
use crate::migrate;
use crate::models::{
    Chunk, File, NewChunk, NewFile, NewSymbol, OutlineNode, OutlineTree, ProjectMeta,
    ScoredChunk, StoreStats, Symbol,
};
use crate::outline;

const FILE_COLUMNS: &str =
    "pk, id, path, hash, last_modified, chunk_count, created_at, updated_at";

const CHUNK_COLUMNS: &str = r#"
    c.id, c.file_pk, f.path AS file_path, c.content, c.embedding,
    c.line_start, c.line_end, c.char_start, c.char_end,
    c.language, c.symbol_name, c.symbol_kind, c.parent, c.signature,
    c.visibility, c.package_name, c.doc_string, c.token_count,
    c.is_collapsed, c.source_code, c.embedding_model_id,
    c.created_at, c.updated_at
"#;

const SYMBOL_COLUMNS: &str = "s.id, s.file_pk, s.name, s.kind, s.line, s.character, s.created_at, s.updated_at";

const OUTLINE_COLUMNS: &str = "o.id, o.parent_id, o.name, o.kind, o.start_line, o.end_line, o.position";

#[derive(Clone)]
pub struct ProjectStore {
    pool: SqlitePool,
    path: PathBuf,
}

impl ProjectStore {
    /// Open (creating if missing) and migrate the store at `path`.
    pub async fn open(path: &Path, busy_timeout: Duration) -> Result<Self> {
        let pool = db::connect(path, busy_timeout).await?;
        if let Err(e) = migrate::run(&pool).await {
            pool.close().await;
            return Err(e);
        }
        Ok(Self {
            pool,
            path: path.to_path_buf(),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn schema_version(&self) -> Result<i64> {
        migrate::current_version(&self.pool).await
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    // ============ Files ============

    /// Insert or update the file keyed by `path`. An existing row keeps its id and pk.
    pub async fn upsert_file(&self, file: &NewFile) -> Result<File> {
        if file.path.is_empty() {
            return Err(Error::Validation("file path must not be empty".to_string()));
        }
        if file.id.is_empty() {
            return Err(Error::Validation("file id must not be empty".to_string()));
        }
        let now = chrono::Utc::now().timestamp();

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO files (id, path, hash, last_modified, chunk_count, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(path) DO UPDATE SET
                hash = excluded.hash,
                last_modified = excluded.last_modified,
                chunk_count = excluded.chunk_count,
                updated_at = excluded.updated_at
            RETURNING {}
            "#,
            FILE_COLUMNS
        ))
        .bind(&file.id)
        .bind(&file.path)
        .bind(&file.hash)
        .bind(file.last_modified)
        .bind(file.chunk_count)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if Error::is_unique_violation(&e) {
                Error::Conflict(format!("file id {} is used by another path", file.id))
            } else {
                Error::Database(e)
            }
        })?;

        row_to_file(&row)
    }

    pub async fn get_file_by_path(&self, path: &str) -> Result<Option<File>> {
        let row = sqlx::query(&format!("SELECT {} FROM files WHERE path = ?", FILE_COLUMNS))
            .bind(path)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_file).transpose()
    }

    /// Files whose path starts with `prefix`, ordered by path. An empty prefix lists all files.
    pub async fn list_files_by_path(&self, prefix: &str) -> Result<Vec<File>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM files WHERE substr(path, 1, length(?1)) = ?1 ORDER BY path",
            FILE_COLUMNS
        ))
        .bind(prefix)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_file).collect()
    }

    /// Delete a file and, by cascade, its chunks, symbols, outline, and links.
    /// Returns whether a file was removed.
    pub async fn delete_file(&self, path: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM files WHERE path = ?")
            .bind(path)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_chunk_count(&self, file_pk: i64, chunk_count: i64) -> Result<()> {
        sqlx::query("UPDATE files SET chunk_count = ?, updated_at = ? WHERE pk = ?")
            .bind(chunk_count)
            .bind(chrono::Utc::now().timestamp())
            .bind(file_pk)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ============ Chunks ============

    /// Insert a chunk or update the chunk with the same id in place.
    ///
    /// Fails with [`Error::Conflict`] when a chunk with a different id already
    /// occupies the same `(file, line_start, line_end)`; nothing is written in
    /// that case.
    pub async fn upsert_chunk(&self, chunk: &NewChunk) -> Result<Chunk> {
        if chunk.id.is_empty() {
            return Err(Error::Validation("chunk id must not be empty".to_string()));
        }
        if chunk.line_end < chunk.line_start {
            return Err(Error::Validation(format!(
                "chunk {} ends (line {}) before it starts (line {})",
                chunk.id, chunk.line_end, chunk.line_start
            )));
        }
        let now = chrono::Utc::now().timestamp();
        let blob = if chunk.embedding.is_empty() {
            None
        } else {
            Some(embedding::vec_to_blob(&chunk.embedding))
        };

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO chunks (id, file_pk, content, embedding, line_start, line_end,
                                char_start, char_end, language, symbol_name, symbol_kind,
                                parent, signature, visibility, package_name, doc_string,
                                token_count, is_collapsed, source_code, embedding_model_id,
                                created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                file_pk = excluded.file_pk,
                content = excluded.content,
                embedding = excluded.embedding,
                line_start = excluded.line_start,
                line_end = excluded.line_end,
                char_start = excluded.char_start,
                char_end = excluded.char_end,
                language = excluded.language,
                symbol_name = excluded.symbol_name,
                symbol_kind = excluded.symbol_kind,
                parent = excluded.parent,
                signature = excluded.signature,
                visibility = excluded.visibility,
                package_name = excluded.package_name,
                doc_string = excluded.doc_string,
                token_count = excluded.token_count,
                is_collapsed = excluded.is_collapsed,
                source_code = excluded.source_code,
                embedding_model_id = excluded.embedding_model_id,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&chunk.id)
        .bind(chunk.file_pk)
        .bind(&chunk.content)
        .bind(blob)
        .bind(chunk.line_start)
        .bind(chunk.line_end)
        .bind(chunk.char_start)
        .bind(chunk.char_end)
        .bind(&chunk.language)
        .bind(&chunk.symbol_name)
        .bind(&chunk.symbol_kind)
        .bind(&chunk.parent)
        .bind(&chunk.signature)
        .bind(&chunk.visibility)
        .bind(&chunk.package_name)
        .bind(&chunk.doc_string)
        .bind(chunk.token_count)
        .bind(chunk.is_collapsed)
        .bind(&chunk.source_code)
        .bind(&chunk.embedding_model_id)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_write_error(e, chunk))?;

        sqlx::query("DELETE FROM chunk_symbols WHERE chunk_id = ?")
            .bind(&chunk.id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO chunk_symbols (chunk_id, symbol_id)
            SELECT ?, s.id FROM symbols s
            WHERE s.file_pk = ? AND s.line BETWEEN ? AND ?
            "#,
        )
        .bind(&chunk.id)
        .bind(chunk.file_pk)
        .bind(chunk.line_start)
        .bind(chunk.line_end)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        self.get_chunk_by_id(&chunk.id)
            .await?
            .ok_or_else(|| Error::not_found("chunk", chunk.id.clone()))
    }

    pub async fn get_chunk_by_id(&self, id: &str) -> Result<Option<Chunk>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM chunks c JOIN files f ON f.pk = c.file_pk WHERE c.id = ?",
            CHUNK_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_chunk).transpose()
    }

    /// The chunk covering exactly `[line_start, line_end]` of the file, if any.
    pub async fn chunk_at(&self, file_pk: i64, line_start: i64, line_end: i64) -> Result<Option<Chunk>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {} FROM chunks c JOIN files f ON f.pk = c.file_pk
            WHERE c.file_pk = ? AND c.line_start = ? AND c.line_end = ?
            "#,
            CHUNK_COLUMNS
        ))
        .bind(file_pk)
        .bind(line_start)
        .bind(line_end)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_chunk).transpose()
    }

    pub async fn chunks_for_file(&self, file_pk: i64) -> Result<Vec<Chunk>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM chunks c JOIN files f ON f.pk = c.file_pk
            WHERE c.file_pk = ?
            ORDER BY c.line_start, c.line_end
            "#,
            CHUNK_COLUMNS
        ))
        .bind(file_pk)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_chunk).collect()
    }

    /// Delete every chunk of the file whose id is not in `keep`. Returns the number removed.
    pub async fn delete_chunks_except(&self, file_pk: i64, keep: &[String]) -> Result<u64> {
        let keep: HashSet<&str> = keep.iter().map(String::as_str).collect();
        let mut tx = self.pool.begin().await?;

        let ids: Vec<String> = sqlx::query_scalar("SELECT id FROM chunks WHERE file_pk = ?")
            .bind(file_pk)
            .fetch_all(&mut *tx)
            .await?;

        let mut removed = 0;
        for id in ids.iter().filter(|id| !keep.contains(id.as_str())) {
            removed += sqlx::query("DELETE FROM chunks WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }

        tx.commit().await?;
        Ok(removed)
    }

    // ============ Symbols ============

    pub async fn upsert_symbol(&self, symbol: &NewSymbol) -> Result<Symbol> {
        if symbol.id.is_empty() || symbol.name.is_empty() {
            return Err(Error::Validation(
                "symbol id and name must not be empty".to_string(),
            ));
        }
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            r#"
            INSERT INTO symbols (id, file_pk, name, kind, line, character, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                file_pk = excluded.file_pk,
                name = excluded.name,
                kind = excluded.kind,
                line = excluded.line,
                character = excluded.character,
                updated_at = excluded.updated_at
            RETURNING id, file_pk, name, kind, line, character, created_at, updated_at
            "#,
        )
        .bind(&symbol.id)
        .bind(symbol.file_pk)
        .bind(&symbol.name)
        .bind(&symbol.kind)
        .bind(symbol.line)
        .bind(symbol.character)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            if is_foreign_key_violation(&e) {
                Error::not_found("file", symbol.file_pk.to_string())
            } else {
                Error::Database(e)
            }
        })?;
        let stored = row_to_symbol(&row)?;

        sqlx::query("DELETE FROM chunk_symbols WHERE symbol_id = ?")
            .bind(&symbol.id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO chunk_symbols (chunk_id, symbol_id)
            SELECT c.id, ? FROM chunks c
            WHERE c.file_pk = ? AND ? BETWEEN c.line_start AND c.line_end
            "#,
        )
        .bind(&symbol.id)
        .bind(symbol.file_pk)
        .bind(symbol.line)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(stored)
    }

    pub async fn delete_symbols_for_file(&self, file_pk: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM symbols WHERE file_pk = ?")
            .bind(file_pk)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Symbols linked to a chunk, in line order.
    pub async fn symbols_for_chunk(&self, chunk_id: &str) -> Result<Vec<Symbol>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM symbols s
            JOIN chunk_symbols cs ON cs.symbol_id = s.id
            WHERE cs.chunk_id = ?
            ORDER BY s.line, s.character, s.id
            "#,
            SYMBOL_COLUMNS
        ))
        .bind(chunk_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_symbol).collect()
    }

    // ============ Outline ============

    /// Atomically replace a file's outline with `nodes`.
    ///
    /// Nodes must list parents before children (as [`outline::build_outline`]
    /// does). A parent reference to a node not in `nodes` is stored as a root;
    /// nodes repeating an id already inserted are skipped.
    pub async fn replace_outline(&self, file_pk: i64, nodes: &[OutlineNode]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM outline_nodes WHERE file_pk = ?")
            .bind(file_pk)
            .execute(&mut *tx)
            .await?;

        let mut inserted: HashSet<&str> = HashSet::new();
        for node in nodes {
            if inserted.contains(node.id.as_str()) {
                continue;
            }
            let parent_id = node
                .parent_id
                .as_deref()
                .filter(|p| inserted.contains(p));
            sqlx::query(
                r#"
                INSERT INTO outline_nodes (id, file_pk, parent_id, name, kind, start_line, end_line, position)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&node.id)
            .bind(file_pk)
            .bind(parent_id)
            .bind(&node.name)
            .bind(&node.kind)
            .bind(node.start_line)
            .bind(node.end_line)
            .bind(node.position)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                if is_foreign_key_violation(&e) {
                    Error::not_found("file", file_pk.to_string())
                } else if Error::is_unique_violation(&e) {
                    Error::Conflict(format!("outline node {} belongs to another file", node.id))
                } else {
                    Error::Database(e)
                }
            })?;
            inserted.insert(node.id.as_str());
        }

        tx.commit().await?;
        Ok(())
    }

    /// Flat outline rows of one file.
    pub async fn outline_nodes(&self, file_pk: i64) -> Result<Vec<OutlineNode>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM outline_nodes o WHERE o.file_pk = ? ORDER BY o.start_line, o.position",
            OUTLINE_COLUMNS
        ))
        .bind(file_pk)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_outline_node).collect()
    }

    /// Nested outline of the file at `path`.
    pub async fn get_outline(&self, path: &str) -> Result<Vec<OutlineTree>> {
        let file = self
            .get_file_by_path(path)
            .await?
            .ok_or_else(|| Error::not_found("file", path))?;
        let nodes = self.outline_nodes(file.pk).await?;
        Ok(outline::nest(&nodes))
    }

    /// Resolve an outline node by id, with the file it belongs to.
    pub async fn find_outline_node(&self, id: &str) -> Result<Option<(File, OutlineNode)>> {
        let row = sqlx::query(&format!(
            "SELECT {}, o.file_pk FROM outline_nodes o WHERE o.id = ?",
            OUTLINE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let node = row_to_outline_node(&row)?;
        let file_pk: i64 = row.try_get("file_pk")?;

        let file_row = sqlx::query(&format!("SELECT {} FROM files WHERE pk = ?", FILE_COLUMNS))
            .bind(file_pk)
            .fetch_one(&self.pool)
            .await?;
        Ok(Some((row_to_file(&file_row)?, node)))
    }

    // ============ Project metadata ============

    pub async fn get_project_meta(&self) -> Result<Option<ProjectMeta>> {
        let row = sqlx::query(
            r#"
            SELECT id, name, description, config_json, is_indexing, created_at, updated_at
            FROM project_meta
            ORDER BY created_at, id
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_project_meta).transpose()
    }

    /// Record the project's metadata for the first time.
    ///
    /// Fails with [`Error::Conflict`] when the store already describes a project.
    pub async fn create_project_meta(
        &self,
        id: &str,
        name: &str,
        description: Option<&str>,
    ) -> Result<ProjectMeta> {
        if id.is_empty() || name.trim().is_empty() {
            return Err(Error::Validation(
                "project id and name must not be empty".to_string(),
            ));
        }
        if let Some(existing) = self.get_project_meta().await? {
            return Err(Error::Conflict(format!(
                "store already describes project {}",
                existing.id
            )));
        }
        let now = chrono::Utc::now().timestamp();
        let meta = ProjectMeta {
            id: id.to_string(),
            name: name.trim().to_string(),
            description: description.map(str::to_string),
            config_json: "{}".to_string(),
            is_indexing: false,
            created_at: now,
            updated_at: now,
        };
        self.save_project_meta(&meta).await?;
        Ok(meta)
    }

    pub async fn save_project_meta(&self, meta: &ProjectMeta) -> Result<()> {
        serde_json::from_str::<serde_json::Value>(&meta.config_json).map_err(|e| {
            Error::Validation(format!("project config is not valid JSON: {}", e))
        })?;
        sqlx::query(
            r#"
            INSERT INTO project_meta (id, name, description, config_json, is_indexing, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                description = excluded.description,
                config_json = excluded.config_json,
                is_indexing = excluded.is_indexing,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&meta.id)
        .bind(&meta.name)
        .bind(&meta.description)
        .bind(&meta.config_json)
        .bind(meta.is_indexing)
        .bind(meta.created_at)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_indexing(&self, indexing: bool) -> Result<()> {
        sqlx::query("UPDATE project_meta SET is_indexing = ?, updated_at = ?")
            .bind(indexing)
            .bind(chrono::Utc::now().timestamp())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ============ Embeddings ============

    /// Rank chunks embedded by `model_id` by cosine similarity to `query`.
    ///
    /// Chunks without a vector, or whose vector came from another model, are
    /// not candidates. Ties are broken by chunk id.
    pub async fn search_embeddings(
        &self,
        query: &[f32],
        model_id: &str,
        k: usize,
    ) -> Result<Vec<ScoredChunk>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM chunks c JOIN files f ON f.pk = c.file_pk
            WHERE c.embedding IS NOT NULL AND c.embedding_model_id = ?
            "#,
            CHUNK_COLUMNS
        ))
        .bind(model_id)
        .fetch_all(&self.pool)
        .await?;

        let mut scored = Vec::with_capacity(rows.len());
        for row in &rows {
            let chunk = row_to_chunk(row)?;
            let score = embedding::cosine_similarity(query, &chunk.embedding);
            scored.push(ScoredChunk { chunk, score });
        }

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk.id.cmp(&b.chunk.id))
        });
        scored.truncate(k);
        Ok(scored)
    }

    /// Ids of chunks with no vector or a vector from a model other than `model_id`.
    pub async fn stale_chunk_ids(&self, model_id: &str) -> Result<Vec<String>> {
        let ids = sqlx::query_scalar(
            "SELECT id FROM chunks WHERE embedding IS NULL OR embedding_model_id <> ? ORDER BY id",
        )
        .bind(model_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    pub async fn update_chunk_embedding(
        &self,
        id: &str,
        vector: &[f32],
        model_id: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE chunks SET embedding = ?, embedding_model_id = ?, updated_at = ? WHERE id = ?",
        )
        .bind(embedding::vec_to_blob(vector))
        .bind(model_id)
        .bind(chrono::Utc::now().timestamp())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    // ============ Stats ============

    pub async fn stats(&self) -> Result<StoreStats> {
        let count = |table: &'static str| {
            let pool = self.pool.clone();
            async move {
                sqlx::query_scalar::<_, i64>(&format!("SELECT COUNT(*) FROM {}", table))
                    .fetch_one(&pool)
                    .await
            }
        };

        let rows = sqlx::query(
            r#"
            SELECT embedding_model_id, COUNT(*) AS n FROM chunks
            GROUP BY embedding_model_id
            ORDER BY embedding_model_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        let mut models = Vec::with_capacity(rows.len());
        for row in &rows {
            let model: String = row.try_get("embedding_model_id")?;
            let n: i64 = row.try_get("n")?;
            models.push((model, n));
        }

        Ok(StoreStats {
            files: count("files").await?,
            chunks: count("chunks").await?,
            symbols: count("symbols").await?,
            outline_nodes: count("outline_nodes").await?,
            embedding_models: models,
        })
    }
}

fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .map(|db| db.is_foreign_key_violation())
        .unwrap_or(false)
}

fn map_write_error(err: sqlx::Error, chunk: &NewChunk) -> Error {
    if Error::is_unique_violation(&err) {
        Error::Conflict(format!(
            "another chunk already covers lines {}-{} of file {}",
            chunk.line_start, chunk.line_end, chunk.file_pk
        ))
    } else if is_foreign_key_violation(&err) {
        Error::not_found("file", chunk.file_pk.to_string())
    } else {
        Error::Database(err)
    }
}

// ============ Row mapping ============

fn row_to_file(row: &SqliteRow) -> Result<File> {
    Ok(File {
        pk: row.try_get("pk")?,
        id: row.try_get("id")?,
        path: row.try_get("path")?,
        hash: row.try_get("hash")?,
        last_modified: row.try_get("last_modified")?,
        chunk_count: row.try_get("chunk_count")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_chunk(row: &SqliteRow) -> Result<Chunk> {
    let blob: Option<Vec<u8>> = row.try_get("embedding")?;
    Ok(Chunk {
        id: row.try_get("id")?,
        file_pk: row.try_get("file_pk")?,
        file_path: row.try_get("file_path")?,
        content: row.try_get("content")?,
        embedding: blob.map(|b| embedding::blob_to_vec(&b)).unwrap_or_default(),
        line_start: row.try_get("line_start")?,
        line_end: row.try_get("line_end")?,
        char_start: row.try_get("char_start")?,
        char_end: row.try_get("char_end")?,
        language: row.try_get("language")?,
        symbol_name: row.try_get("symbol_name")?,
        symbol_kind: row.try_get("symbol_kind")?,
        parent: row.try_get("parent")?,
        signature: row.try_get("signature")?,
        visibility: row.try_get("visibility")?,
        package_name: row.try_get("package_name")?,
        doc_string: row.try_get("doc_string")?,
        token_count: row.try_get("token_count")?,
        is_collapsed: row.try_get("is_collapsed")?,
        source_code: row.try_get("source_code")?,
        embedding_model_id: row.try_get("embedding_model_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_symbol(row: &SqliteRow) -> Result<Symbol> {
    Ok(Symbol {
        id: row.try_get("id")?,
        file_pk: row.try_get("file_pk")?,
        name: row.try_get("name")?,
        kind: row.try_get("kind")?,
        line: row.try_get("line")?,
        character: row.try_get("character")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_outline_node(row: &SqliteRow) -> Result<OutlineNode> {
    Ok(OutlineNode {
        id: row.try_get("id")?,
        parent_id: row.try_get("parent_id")?,
        name: row.try_get("name")?,
        kind: row.try_get("kind")?,
        start_line: row.try_get("start_line")?,
        end_line: row.try_get("end_line")?,
        position: row.try_get("position")?,
    })
}

fn row_to_project_meta(row: &SqliteRow) -> Result<ProjectMeta> {
    Ok(ProjectMeta {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        config_json: row.try_get("config_json")?,
        is_indexing: row.try_get("is_indexing")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
