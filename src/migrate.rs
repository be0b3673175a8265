//! Versioned schema migrations for project stores.
//!
//! Steps are applied in order, once per store, when the store is opened.
//! The applied versions are recorded in `schema_migrations`; the current
//! version is the highest recorded one. Each step runs in its own
//! transaction together with its ledger row, so a failing step leaves the
//! store at the previous version and [`run`] returns
//! [`Error::Migration`] without opening the store.
//!
//! | Version | Name | Effect |
//! |---------|------|--------|
//! | 1 | `initial` | flat layout: chunks/symbols keyed by `file_path` |
//! | 2 | `chunk_source_columns` | `is_collapsed`, `source_code` on chunks |
//! | 3 | `outline_and_chunk_symbols` | `outline_nodes`, `chunk_symbols` |
//! | 4 | `file_references` | rows reference `files(pk)`; placeholder files, dedup, unique location |
//! | 5 | `embedding_provenance` | `embedding_model_id` on chunks; unique location re-established |
//!
//! Upgrades never drop indexing data: rows whose `file_path` has no file
//! row get a synthesized placeholder file. Before a uniqueness constraint is
//! introduced, duplicates under the new key are deleted keeping the
//! lexicographically smallest id. The helpers that perform these
//! transformations are public so each can be exercised on a fixture store.

use sqlx::{Row, SqliteConnection, SqlitePool};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Key under which chunks are unique within a file.
pub const CHUNK_LOCATION_KEY: &[&str] = &["file_pk", "line_start", "line_end"];
pub const CHUNK_LOCATION_INDEX: &str = "ux_chunks_location";

pub struct Migration {
    pub version: i64,
    pub name: &'static str,
    step: Step,
}

enum Step {
    Sql(&'static [&'static str]),
    /// Guarded `ALTER TABLE ADD COLUMN`: columns already present are skipped.
    AddColumns {
        table: &'static str,
        columns: &'static [(&'static str, &'static str)],
    },
    FileReferences,
    EmbeddingProvenance,
}

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial",
        step: Step::Sql(V1_INITIAL),
    },
    Migration {
        version: 2,
        name: "chunk_source_columns",
        step: Step::AddColumns {
            table: "chunks",
            columns: &[
                ("is_collapsed", "INTEGER NOT NULL DEFAULT 0"),
                ("source_code", "TEXT"),
            ],
        },
    },
    Migration {
        version: 3,
        name: "outline_and_chunk_symbols",
        step: Step::Sql(V3_OUTLINE),
    },
    Migration {
        version: 4,
        name: "file_references",
        step: Step::FileReferences,
    },
    Migration {
        version: 5,
        name: "embedding_provenance",
        step: Step::EmbeddingProvenance,
    },
];

pub const LATEST_VERSION: i64 = 5;

const V1_INITIAL: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS files (
        id TEXT PRIMARY KEY,
        path TEXT NOT NULL UNIQUE,
        hash TEXT NOT NULL DEFAULT '',
        last_modified INTEGER NOT NULL DEFAULT 0,
        chunk_count INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS chunks (
        id TEXT PRIMARY KEY,
        file_path TEXT NOT NULL,
        content TEXT NOT NULL,
        embedding BLOB,
        line_start INTEGER NOT NULL,
        line_end INTEGER NOT NULL,
        char_start INTEGER NOT NULL DEFAULT 0,
        char_end INTEGER NOT NULL DEFAULT 0,
        language TEXT NOT NULL DEFAULT '',
        symbol_name TEXT NOT NULL DEFAULT '',
        symbol_kind TEXT NOT NULL DEFAULT '',
        parent TEXT NOT NULL DEFAULT '',
        signature TEXT NOT NULL DEFAULT '',
        visibility TEXT NOT NULL DEFAULT '',
        package_name TEXT NOT NULL DEFAULT '',
        doc_string TEXT,
        token_count INTEGER,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_chunks_file_path ON chunks(file_path)",
    r#"
    CREATE TABLE IF NOT EXISTS symbols (
        id TEXT PRIMARY KEY,
        file_path TEXT NOT NULL,
        name TEXT NOT NULL,
        kind TEXT NOT NULL,
        line INTEGER NOT NULL,
        character INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_symbols_file_path ON symbols(file_path)",
    r#"
    CREATE TABLE IF NOT EXISTS project_meta (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        description TEXT,
        config_json TEXT NOT NULL DEFAULT '{}',
        is_indexing INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
];

const V3_OUTLINE: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS outline_nodes (
        id TEXT PRIMARY KEY,
        file_path TEXT NOT NULL,
        parent_id TEXT,
        name TEXT NOT NULL,
        kind TEXT NOT NULL,
        start_line INTEGER NOT NULL,
        end_line INTEGER NOT NULL,
        position INTEGER NOT NULL DEFAULT 0
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_outline_file_path ON outline_nodes(file_path)",
    r#"
    CREATE TABLE IF NOT EXISTS chunk_symbols (
        chunk_id TEXT NOT NULL,
        symbol_id TEXT NOT NULL,
        PRIMARY KEY (chunk_id, symbol_id)
    )
    "#,
];

/// Apply every pending migration. Returns the resulting version.
pub async fn run(pool: &SqlitePool) -> Result<i64> {
    run_to(pool, LATEST_VERSION).await
}

/// Apply pending migrations up to and including `target`.
pub async fn run_to(pool: &SqlitePool, target: i64) -> Result<i64> {
    ensure_ledger(pool).await?;
    let from = current_version(pool).await?;
    let mut version = from;

    for migration in MIGRATIONS
        .iter()
        .filter(|m| m.version > from && m.version <= target)
    {
        apply(pool, migration)
            .await
            .map_err(|e| Error::Migration {
                version: migration.version,
                name: migration.name,
                source: Box::new(e),
            })?;
        version = migration.version;
        info!(version, name = migration.name, "applied schema migration");
    }

    Ok(version)
}

/// Highest applied version, `0` for a fresh store.
pub async fn current_version(pool: &SqlitePool) -> Result<i64> {
    ensure_ledger(pool).await?;
    let version: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(version), 0) FROM schema_migrations")
        .fetch_one(pool)
        .await?;
    Ok(version)
}

async fn ensure_ledger(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn apply(pool: &SqlitePool, migration: &Migration) -> Result<()> {
    let mut tx = pool.begin().await?;

    // Another connection may have applied the step since we looked.
    let applied: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM schema_migrations WHERE version = ?")
            .bind(migration.version)
            .fetch_one(&mut *tx)
            .await?;
    if applied > 0 {
        return Ok(());
    }

    match &migration.step {
        Step::Sql(statements) => {
            for stmt in statements.iter() {
                sqlx::query(stmt).execute(&mut *tx).await?;
            }
        }
        Step::AddColumns { table, columns } => {
            for (column, decl) in columns.iter() {
                add_column_if_missing(&mut tx, table, column, decl).await?;
            }
        }
        Step::FileReferences => file_references(&mut tx).await?,
        Step::EmbeddingProvenance => embedding_provenance(&mut tx).await?,
    }

    sqlx::query("INSERT INTO schema_migrations (version, name, applied_at) VALUES (?, ?, ?)")
        .bind(migration.version)
        .bind(migration.name)
        .bind(chrono::Utc::now().timestamp())
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(())
}

// ============ Step 4: file references ============

async fn file_references(conn: &mut SqliteConnection) -> Result<()> {
    if column_exists(conn, "files", "pk").await? {
        return Ok(());
    }

    for (from, to) in [
        ("chunk_symbols", "legacy_chunk_symbols"),
        ("outline_nodes", "legacy_outline_nodes"),
        ("symbols", "legacy_symbols"),
        ("chunks", "legacy_chunks"),
        ("files", "legacy_files"),
    ] {
        sqlx::query(&format!("ALTER TABLE {} RENAME TO {}", from, to))
            .execute(&mut *conn)
            .await?;
    }

    sqlx::query(
        r#"
        CREATE TABLE files (
            pk INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            path TEXT NOT NULL UNIQUE,
            hash TEXT NOT NULL DEFAULT '',
            last_modified INTEGER NOT NULL DEFAULT 0,
            chunk_count INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(&mut *conn)
    .await?;
    sqlx::query(
        r#"
        INSERT INTO files (id, path, hash, last_modified, chunk_count, created_at, updated_at)
        SELECT id, path, hash, last_modified, chunk_count, created_at, updated_at
        FROM legacy_files
        ORDER BY created_at, id
        "#,
    )
    .execute(&mut *conn)
    .await?;

    let orphans = orphan_file_paths(
        conn,
        &["legacy_chunks", "legacy_symbols", "legacy_outline_nodes"],
    )
    .await?;
    let backfilled = backfill_placeholder_files(conn, &orphans).await?;
    if backfilled > 0 {
        info!(backfilled, "synthesized placeholder files for orphaned rows");
    }

    sqlx::query(
        r#"
        CREATE TABLE chunks (
            id TEXT PRIMARY KEY,
            file_pk INTEGER NOT NULL REFERENCES files(pk) ON DELETE CASCADE,
            content TEXT NOT NULL,
            embedding BLOB,
            line_start INTEGER NOT NULL,
            line_end INTEGER NOT NULL,
            char_start INTEGER NOT NULL DEFAULT 0,
            char_end INTEGER NOT NULL DEFAULT 0,
            language TEXT NOT NULL DEFAULT '',
            symbol_name TEXT NOT NULL DEFAULT '',
            symbol_kind TEXT NOT NULL DEFAULT '',
            parent TEXT NOT NULL DEFAULT '',
            signature TEXT NOT NULL DEFAULT '',
            visibility TEXT NOT NULL DEFAULT '',
            package_name TEXT NOT NULL DEFAULT '',
            doc_string TEXT,
            token_count INTEGER,
            is_collapsed INTEGER NOT NULL DEFAULT 0,
            source_code TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(&mut *conn)
    .await?;
    sqlx::query(
        r#"
        INSERT INTO chunks (id, file_pk, content, embedding, line_start, line_end,
                            char_start, char_end, language, symbol_name, symbol_kind,
                            parent, signature, visibility, package_name, doc_string,
                            token_count, is_collapsed, source_code, created_at, updated_at)
        SELECT c.id, f.pk, c.content, c.embedding, c.line_start, c.line_end,
               c.char_start, c.char_end, c.language, c.symbol_name, c.symbol_kind,
               c.parent, c.signature, c.visibility, c.package_name, c.doc_string,
               c.token_count, c.is_collapsed, c.source_code, c.created_at, c.updated_at
        FROM legacy_chunks c
        JOIN files f ON f.path = c.file_path
        "#,
    )
    .execute(&mut *conn)
    .await?;

    let removed = dedup_keep_smallest(conn, "chunks", CHUNK_LOCATION_KEY).await?;
    if removed > 0 {
        info!(removed, "removed duplicate chunks before adding location constraint");
    }
    create_unique_index(conn, CHUNK_LOCATION_INDEX, "chunks", CHUNK_LOCATION_KEY).await?;

    sqlx::query(
        r#"
        CREATE TABLE symbols (
            id TEXT PRIMARY KEY,
            file_pk INTEGER NOT NULL REFERENCES files(pk) ON DELETE CASCADE,
            name TEXT NOT NULL,
            kind TEXT NOT NULL,
            line INTEGER NOT NULL,
            character INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(&mut *conn)
    .await?;
    sqlx::query(
        r#"
        INSERT INTO symbols (id, file_pk, name, kind, line, character, created_at, updated_at)
        SELECT s.id, f.pk, s.name, s.kind, s.line, s.character, s.created_at, s.updated_at
        FROM legacy_symbols s
        JOIN files f ON f.path = s.file_path
        "#,
    )
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE outline_nodes (
            id TEXT PRIMARY KEY,
            file_pk INTEGER NOT NULL REFERENCES files(pk) ON DELETE CASCADE,
            parent_id TEXT REFERENCES outline_nodes(id) ON DELETE CASCADE,
            name TEXT NOT NULL,
            kind TEXT NOT NULL,
            start_line INTEGER NOT NULL,
            end_line INTEGER NOT NULL,
            position INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(&mut *conn)
    .await?;
    // Parents may appear after their children in the legacy table, so links
    // are restored in a second pass once every node exists.
    sqlx::query(
        r#"
        INSERT INTO outline_nodes (id, file_pk, parent_id, name, kind, start_line, end_line, position)
        SELECT o.id, f.pk, NULL, o.name, o.kind, o.start_line, o.end_line, o.position
        FROM legacy_outline_nodes o
        JOIN files f ON f.path = o.file_path
        "#,
    )
    .execute(&mut *conn)
    .await?;
    sqlx::query(
        r#"
        UPDATE outline_nodes
        SET parent_id = (
            SELECT l.parent_id FROM legacy_outline_nodes l
            WHERE l.id = outline_nodes.id
        )
        WHERE EXISTS (
            SELECT 1 FROM legacy_outline_nodes l
            JOIN outline_nodes p ON p.id = l.parent_id
            WHERE l.id = outline_nodes.id AND p.id <> outline_nodes.id
        )
        "#,
    )
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE chunk_symbols (
            chunk_id TEXT NOT NULL REFERENCES chunks(id) ON DELETE CASCADE,
            symbol_id TEXT NOT NULL REFERENCES symbols(id) ON DELETE CASCADE,
            PRIMARY KEY (chunk_id, symbol_id)
        )
        "#,
    )
    .execute(&mut *conn)
    .await?;
    let links = derive_chunk_symbols(conn, None).await?;
    debug!(links, "derived chunk/symbol links");

    for table in [
        "legacy_chunk_symbols",
        "legacy_outline_nodes",
        "legacy_symbols",
        "legacy_chunks",
        "legacy_files",
    ] {
        sqlx::query(&format!("DROP TABLE {}", table))
            .execute(&mut *conn)
            .await?;
    }

    for stmt in [
        "CREATE INDEX IF NOT EXISTS idx_chunks_file_pk ON chunks(file_pk)",
        "CREATE INDEX IF NOT EXISTS idx_symbols_file_pk ON symbols(file_pk)",
        "CREATE INDEX IF NOT EXISTS idx_symbols_name ON symbols(name)",
        "CREATE INDEX IF NOT EXISTS idx_outline_file_pk ON outline_nodes(file_pk)",
        "CREATE INDEX IF NOT EXISTS idx_outline_parent ON outline_nodes(parent_id)",
        "CREATE INDEX IF NOT EXISTS idx_chunk_symbols_symbol ON chunk_symbols(symbol_id)",
    ] {
        sqlx::query(stmt).execute(&mut *conn).await?;
    }

    Ok(())
}

// ============ Step 5: embedding provenance ============

async fn embedding_provenance(conn: &mut SqliteConnection) -> Result<()> {
    add_column_if_missing(
        conn,
        "chunks",
        "embedding_model_id",
        "TEXT NOT NULL DEFAULT ''",
    )
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_model ON chunks(embedding_model_id)")
        .execute(&mut *conn)
        .await?;

    dedup_keep_smallest(conn, "chunks", CHUNK_LOCATION_KEY).await?;
    create_unique_index(conn, CHUNK_LOCATION_INDEX, "chunks", CHUNK_LOCATION_KEY).await?;
    Ok(())
}

// ============ Transformation helpers ============

/// Rows sharing one key value: `keep` survives, `remove` is deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateGroup {
    pub keep: String,
    pub remove: Vec<String>,
}

fn key_expr(key_columns: &[&str]) -> String {
    key_columns
        .iter()
        .map(|c| format!("CAST({} AS TEXT)", c))
        .collect::<Vec<_>>()
        .join(" || char(31) || ")
}

/// Find every group of rows in `table` sharing the same `key_columns`.
///
/// Within a group the lexicographically smallest `id` is the survivor.
/// Rows with a NULL key column never collide.
pub async fn duplicate_groups(
    conn: &mut SqliteConnection,
    table: &str,
    key_columns: &[&str],
) -> Result<Vec<DuplicateGroup>> {
    let key = key_expr(key_columns);
    let rows = sqlx::query(&format!(
        r#"
        SELECT id, {key} AS dedup_key
        FROM {table}
        WHERE {key} IN (
            SELECT {key} FROM {table}
            WHERE {key} IS NOT NULL
            GROUP BY {key}
            HAVING COUNT(*) > 1
        )
        ORDER BY dedup_key, id
        "#,
        key = key,
        table = table
    ))
    .fetch_all(&mut *conn)
    .await?;

    let mut groups: Vec<DuplicateGroup> = Vec::new();
    let mut current_key: Option<String> = None;
    for row in rows {
        let id: String = row.try_get("id")?;
        let dedup_key: String = row.try_get("dedup_key")?;
        if current_key.as_deref() == Some(dedup_key.as_str()) {
            if let Some(group) = groups.last_mut() {
                group.remove.push(id);
            }
        } else {
            current_key = Some(dedup_key);
            groups.push(DuplicateGroup {
                keep: id,
                remove: Vec::new(),
            });
        }
    }
    Ok(groups)
}

/// Delete all but the smallest-id row of every duplicate group. Returns the
/// number of deleted rows.
pub async fn dedup_keep_smallest(
    conn: &mut SqliteConnection,
    table: &str,
    key_columns: &[&str],
) -> Result<u64> {
    let groups = duplicate_groups(conn, table, key_columns).await?;
    let delete = format!("DELETE FROM {} WHERE id = ?", table);
    let mut removed = 0;
    for group in &groups {
        for id in &group.remove {
            removed += sqlx::query(&delete)
                .bind(id)
                .execute(&mut *conn)
                .await?
                .rows_affected();
        }
    }
    Ok(removed)
}

pub async fn create_unique_index(
    conn: &mut SqliteConnection,
    name: &str,
    table: &str,
    key_columns: &[&str],
) -> Result<()> {
    sqlx::query(&format!(
        "CREATE UNIQUE INDEX IF NOT EXISTS {} ON {}({})",
        name,
        table,
        key_columns.join(", ")
    ))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Distinct `file_path` values referenced by `tables` that have no row in `files`.
pub async fn orphan_file_paths(
    conn: &mut SqliteConnection,
    tables: &[&str],
) -> Result<Vec<String>> {
    if tables.is_empty() {
        return Ok(Vec::new());
    }
    let union = tables
        .iter()
        .map(|t| format!("SELECT file_path FROM {}", t))
        .collect::<Vec<_>>()
        .join(" UNION ");
    let paths: Vec<String> = sqlx::query_scalar(&format!(
        r#"
        SELECT DISTINCT file_path FROM ({})
        WHERE file_path NOT IN (SELECT path FROM files)
        ORDER BY file_path
        "#,
        union
    ))
    .fetch_all(&mut *conn)
    .await?;
    Ok(paths)
}

/// Insert a placeholder file row (empty hash) for each path.
pub async fn backfill_placeholder_files(
    conn: &mut SqliteConnection,
    paths: &[String],
) -> Result<u64> {
    let now = chrono::Utc::now().timestamp();
    let mut inserted = 0;
    for path in paths {
        inserted += sqlx::query(
            r#"
            INSERT OR IGNORE INTO files (id, path, hash, last_modified, chunk_count, created_at, updated_at)
            VALUES (?, ?, '', 0, 0, ?, ?)
            "#,
        )
        .bind(format!("placeholder-{}", uuid::Uuid::new_v4()))
        .bind(path)
        .bind(now)
        .bind(now)
        .execute(&mut *conn)
        .await?
        .rows_affected();
    }
    Ok(inserted)
}

/// Link every symbol to every chunk of the same file whose line range
/// contains the symbol's line. Restricted to one file when `file_pk` is set.
pub async fn derive_chunk_symbols(
    conn: &mut SqliteConnection,
    file_pk: Option<i64>,
) -> Result<u64> {
    let result = sqlx::query(
        r#"
        INSERT OR IGNORE INTO chunk_symbols (chunk_id, symbol_id)
        SELECT c.id, s.id
        FROM chunks c
        JOIN symbols s ON s.file_pk = c.file_pk
        WHERE s.line BETWEEN c.line_start AND c.line_end
          AND (?1 IS NULL OR c.file_pk = ?1)
        "#,
    )
    .bind(file_pk)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

pub async fn column_exists(conn: &mut SqliteConnection, table: &str, column: &str) -> Result<bool> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM pragma_table_info(?) WHERE name = ?")
            .bind(table)
            .bind(column)
            .fetch_one(&mut *conn)
            .await?;
    Ok(count > 0)
}

async fn add_column_if_missing(
    conn: &mut SqliteConnection,
    table: &str,
    column: &str,
    decl: &str,
) -> Result<()> {
    if column_exists(conn, table, column).await? {
        return Ok(());
    }
    sqlx::query(&format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, decl))
        .execute(&mut *conn)
        .await?;
    Ok(())
}
