//! Schema creation and idempotent migrations.
//!
//! Versioning is gated on `PRAGMA user_version`; every statement is
//! `IF NOT EXISTS`-safe so re-running a migration is a no-op. Auxiliary
//! tables (vectors, digests, conversations) can be rebuilt without
//! touching `memories` when they turn out unreadable.

use rusqlite::Connection;
use tracing::{debug, warn};

use sm_common::Result;

use crate::pool::db_err;

/// Current schema version.
pub const SCHEMA_VERSION: i64 = 1;

const CORE_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS memories (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    content       TEXT NOT NULL,
    context       TEXT NOT NULL DEFAULT 'general',
    type          TEXT NOT NULL DEFAULT 'general',
    tags_json     TEXT NOT NULL DEFAULT '[]',
    metadata_json TEXT NOT NULL DEFAULT '{}',
    content_hash  TEXT NOT NULL UNIQUE,
    created_at    TEXT NOT NULL,
    updated_at    TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_memories_type ON memories(type);
CREATE INDEX IF NOT EXISTS idx_memories_context ON memories(context);
CREATE INDEX IF NOT EXISTS idx_memories_created_at ON memories(created_at);

CREATE VIRTUAL TABLE IF NOT EXISTS memories_fts USING fts5(content, context, tags);

CREATE TRIGGER IF NOT EXISTS memories_fts_insert AFTER INSERT ON memories BEGIN
    INSERT INTO memories_fts(rowid, content, context, tags)
    VALUES (new.id, new.content, new.context, new.tags_json);
END;
CREATE TRIGGER IF NOT EXISTS memories_fts_delete AFTER DELETE ON memories BEGIN
    DELETE FROM memories_fts WHERE rowid = old.id;
END;
CREATE TRIGGER IF NOT EXISTS memories_fts_update AFTER UPDATE ON memories BEGIN
    DELETE FROM memories_fts WHERE rowid = old.id;
    INSERT INTO memories_fts(rowid, content, context, tags)
    VALUES (new.id, new.content, new.context, new.tags_json);
END;
";

const AUX_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS memory_vectors (
    id     INTEGER PRIMARY KEY REFERENCES memories(id) ON DELETE CASCADE,
    dim    INTEGER NOT NULL,
    vector BLOB NOT NULL
);

CREATE TABLE IF NOT EXISTS file_digests (
    file       TEXT PRIMARY KEY,
    digest     TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS conversations (
    id           TEXT PRIMARY KEY,
    project_id   TEXT NOT NULL,
    ai_assistant TEXT NOT NULL,
    timestamp    TEXT NOT NULL,
    context      TEXT,
    summary      TEXT
);

CREATE TABLE IF NOT EXISTS messages (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
    role            TEXT NOT NULL CHECK (role IN ('user', 'assistant', 'system')),
    content         TEXT NOT NULL,
    timestamp       TEXT NOT NULL,
    metadata        TEXT
);
CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id);
";

/// Bring a connection's database up to the current schema.
pub fn migrate(conn: &Connection) -> Result<()> {
    let version: i64 = conn
        .query_row("PRAGMA user_version", [], |row| row.get(0))
        .map_err(db_err)?;

    conn.execute_batch(CORE_SCHEMA).map_err(db_err)?;
    ensure_aux_tables(conn)?;

    if version < SCHEMA_VERSION {
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)
            .map_err(db_err)?;
        debug!(from = version, to = SCHEMA_VERSION, "schema migrated");
    }
    Ok(())
}

/// Recreate any auxiliary table that exists but cannot be read.
///
/// `memories` is never dropped here; only the rebuildable side tables are.
pub fn ensure_aux_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(AUX_SCHEMA).map_err(db_err)?;

    for table in ["memory_vectors", "file_digests", "conversations", "messages"] {
        let probe = format!("SELECT 1 FROM {table} LIMIT 0");
        if conn.prepare(&probe).is_err() {
            warn!(table, "auxiliary table unreadable, recreating");
            conn.execute_batch(&format!("DROP TABLE IF EXISTS {table};"))
                .map_err(db_err)?;
            conn.execute_batch(AUX_SCHEMA).map_err(db_err)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap();
        let version: i64 = conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_fts_triggers_mirror_rows() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        conn.execute(
            "INSERT INTO memories (content, content_hash, created_at, updated_at)
             VALUES ('the quick brown fox', 'h1', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')",
            [],
        )
        .unwrap();
        let hits: i64 = conn
            .query_row(
                "SELECT count(*) FROM memories_fts WHERE memories_fts MATCH 'quick'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(hits, 1);

        conn.execute("DELETE FROM memories WHERE content_hash = 'h1'", [])
            .unwrap();
        let hits: i64 = conn
            .query_row(
                "SELECT count(*) FROM memories_fts WHERE memories_fts MATCH 'quick'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(hits, 0);
    }

    #[test]
    fn test_message_cascade_on_conversation_delete() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys = ON;").unwrap();
        migrate(&conn).unwrap();
        conn.execute(
            "INSERT INTO conversations (id, project_id, ai_assistant, timestamp)
             VALUES ('c1', 'p', 'claude', '2026-01-01T00:00:00Z')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO messages (conversation_id, role, content, timestamp)
             VALUES ('c1', 'user', 'hi', '2026-01-01T00:00:00Z')",
            [],
        )
        .unwrap();
        conn.execute("DELETE FROM conversations WHERE id = 'c1'", [])
            .unwrap();
        let left: i64 = conn
            .query_row("SELECT count(*) FROM messages", [], |row| row.get(0))
            .unwrap();
        assert_eq!(left, 0);
    }
}
