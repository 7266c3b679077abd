//! Database schema migrations.
//!
//! Migrations are forward-only, recorded in `schema_migrations`, and executed
//! on the write pool inside one transaction each. The vector table dimension
//! is interpolated into the DDL at first run and recorded in `store_meta`;
//! it can never be altered in place (changing the embedding dimension means
//! re-indexing into a fresh store).

use anyhow::{Context, Result};
use sqlx::Row;

use crate::db::Store;

struct Migration {
    version: i64,
    name: &'static str,
    sql: String,
}

fn migrations(vector_dims: usize) -> Vec<Migration> {
    vec![Migration {
        version: 1,
        name: "base_schema",
        sql: base_schema(vector_dims),
    }]
}

fn base_schema(vector_dims: usize) -> String {
    format!(
        r#"
CREATE TABLE libraries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ')),
    updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ')),
    name TEXT NOT NULL DEFAULT '',
    chunk_size INTEGER NOT NULL DEFAULT 1024,
    chunk_overlap INTEGER NOT NULL DEFAULT 100,
    semantic_segment_provider_id TEXT NOT NULL DEFAULT '',
    semantic_segment_model_id TEXT NOT NULL DEFAULT '',
    top_k INTEGER NOT NULL DEFAULT 5,
    match_threshold REAL NOT NULL DEFAULT 0.4
);

CREATE TABLE documents (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ')),
    updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ')),
    library_id INTEGER NOT NULL,
    original_name TEXT NOT NULL,
    name_tokens TEXT NOT NULL DEFAULT '',
    thumb_icon TEXT NOT NULL DEFAULT '',
    file_size INTEGER NOT NULL DEFAULT 0,
    content_hash TEXT NOT NULL,
    extension TEXT NOT NULL DEFAULT '',
    mime_type TEXT NOT NULL DEFAULT '',
    source_type TEXT NOT NULL DEFAULT 'local',
    local_path TEXT NOT NULL DEFAULT '',
    web_url TEXT NOT NULL DEFAULT '',
    processing_run_id TEXT NOT NULL DEFAULT '',
    parsing_status INTEGER NOT NULL DEFAULT 0,
    parsing_progress INTEGER NOT NULL DEFAULT 0,
    parsing_error TEXT NOT NULL DEFAULT '',
    embedding_status INTEGER NOT NULL DEFAULT 0,
    embedding_progress INTEGER NOT NULL DEFAULT 0,
    embedding_error TEXT NOT NULL DEFAULT '',
    word_total INTEGER NOT NULL DEFAULT 0,
    split_total INTEGER NOT NULL DEFAULT 0
);

CREATE UNIQUE INDEX idx_documents_library_hash ON documents(library_id, content_hash);

CREATE TABLE document_nodes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    library_id INTEGER NOT NULL,
    document_id INTEGER NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
    content TEXT NOT NULL DEFAULT '',
    content_tokens TEXT NOT NULL DEFAULT '',
    level INTEGER NOT NULL DEFAULT 0,
    parent_id INTEGER REFERENCES document_nodes(id) ON DELETE SET NULL,
    chunk_order INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX idx_document_nodes_document ON document_nodes(document_id, level, chunk_order);

CREATE VIRTUAL TABLE doc_vec USING vec0(
    id INTEGER PRIMARY KEY,
    content FLOAT[{dims}]
);

CREATE VIRTUAL TABLE doc_fts USING fts5(
    tokens,
    library_id UNINDEXED,
    document_id UNINDEXED,
    level UNINDEXED,
    content='',
    contentless_delete=1,
    tokenize='unicode61'
);

CREATE TRIGGER doc_nodes_ai AFTER INSERT ON document_nodes BEGIN
    INSERT INTO doc_fts(rowid, tokens, library_id, document_id, level)
    VALUES (new.id, new.content_tokens, new.library_id, new.document_id, new.level);
END;

CREATE TRIGGER doc_nodes_ad AFTER DELETE ON document_nodes BEGIN
    DELETE FROM doc_fts WHERE rowid = old.id;
END;

CREATE TRIGGER doc_nodes_au AFTER UPDATE ON document_nodes BEGIN
    DELETE FROM doc_fts WHERE rowid = old.id;
    INSERT INTO doc_fts(rowid, tokens, library_id, document_id, level)
    VALUES (new.id, new.content_tokens, new.library_id, new.document_id, new.level);
END;

CREATE VIRTUAL TABLE doc_name_fts USING fts5(
    name_tokens,
    library_id UNINDEXED,
    document_id UNINDEXED,
    content='',
    contentless_delete=1,
    tokenize='unicode61'
);

CREATE TRIGGER documents_ai AFTER INSERT ON documents BEGIN
    INSERT INTO doc_name_fts(rowid, name_tokens, library_id, document_id)
    VALUES (new.id, new.name_tokens, new.library_id, new.id);
END;

CREATE TRIGGER documents_ad AFTER DELETE ON documents BEGIN
    DELETE FROM doc_name_fts WHERE rowid = old.id;
END;

CREATE TRIGGER documents_au AFTER UPDATE ON documents BEGIN
    DELETE FROM doc_name_fts WHERE rowid = old.id;
    INSERT INTO doc_name_fts(rowid, name_tokens, library_id, document_id)
    VALUES (new.id, new.name_tokens, new.library_id, new.id);
END;

CREATE TABLE goqite (
    id TEXT PRIMARY KEY DEFAULT ('m_' || lower(hex(randomblob(16)))),
    created TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ')),
    updated TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ')),
    queue TEXT NOT NULL,
    body BLOB NOT NULL,
    timeout TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ')),
    received INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX goqite_queue_created_idx ON goqite(queue, created);

CREATE TABLE store_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

INSERT INTO store_meta(key, value) VALUES ('vector_dims', '{dims}');
"#,
        dims = vector_dims
    )
}

/// Apply every migration newer than the recorded version. Idempotent.
pub async fn run_migrations(store: &Store) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ'))
        )
        "#,
    )
    .execute(store.write())
    .await?;

    let applied: i64 =
        sqlx::query("SELECT COALESCE(MAX(version), 0) AS v FROM schema_migrations")
            .fetch_one(store.write())
            .await?
            .get("v");

    for migration in migrations(store.vector_dims()) {
        if migration.version <= applied {
            continue;
        }

        let mut tx = store.write().begin().await?;
        for statement in split_statements(&migration.sql) {
            sqlx::query(&statement)
                .execute(&mut *tx)
                .await
                .with_context(|| {
                    format!(
                        "migration {} ({}) failed on: {}",
                        migration.version,
                        migration.name,
                        statement.lines().next().unwrap_or("")
                    )
                })?;
        }
        sqlx::query("INSERT INTO schema_migrations(version, name) VALUES (?, ?)")
            .bind(migration.version)
            .bind(migration.name)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        tracing::info!(
            version = migration.version,
            name = migration.name,
            "applied migration"
        );
    }

    Ok(())
}

/// Split a migration script on statement boundaries. Trigger bodies contain
/// inner semicolons, so `END;` terminates a statement and plain `;` only
/// counts outside a `BEGIN … END` block.
fn split_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut in_trigger = false;

    for line in sql.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        current.push_str(line);
        current.push('\n');

        let upper = trimmed.to_uppercase();
        if upper.starts_with("CREATE TRIGGER") {
            in_trigger = true;
        }
        if in_trigger {
            if upper == "END;" {
                statements.push(current.trim().to_string());
                current.clear();
                in_trigger = false;
            }
        } else if trimmed.ends_with(';') {
            statements.push(current.trim().to_string());
            current.clear();
        }
    }
    if !current.trim().is_empty() {
        statements.push(current.trim().to_string());
    }
    statements
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_statements_handles_triggers() {
        let statements = split_statements(&base_schema(4));
        assert!(statements.iter().any(|s| s.starts_with("CREATE TABLE libraries")));
        let trigger = statements
            .iter()
            .find(|s| s.contains("doc_nodes_au"))
            .expect("update trigger present");
        assert!(trigger.ends_with("END;"));
        assert!(trigger.contains("DELETE FROM doc_fts"));
        // No statement should be a bare fragment of a trigger body.
        for s in &statements {
            assert!(!s.starts_with("INSERT INTO doc_fts"), "fragment: {}", s);
        }
    }

    #[test]
    fn test_schema_bakes_dimension() {
        let sql = base_schema(1536);
        assert!(sql.contains("FLOAT[1536]"));
        assert!(sql.contains("('vector_dims', '1536')"));
    }
}
