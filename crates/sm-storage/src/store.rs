//! The storage engine facade and memory operations.

use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use sm_common::{Error, Result};

use crate::memory::{
    content_hash, rank_to_relevance, Memory, MemoryHit, MemoryType, Metadata, NewMemory,
    SearchOptions,
};
use crate::pool::{db_err, Pool, DEFAULT_POOL_SIZE};
use crate::schema;

/// Default search page size when the caller does not pass a limit.
pub const DEFAULT_SEARCH_LIMIT: usize = 50;

/// Handle to one project's database. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    pool: Pool,
}

impl Store {
    /// Open (creating if needed) the database at `path` and migrate it.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let pool = Pool::open(path, DEFAULT_POOL_SIZE)?;
        {
            let conn = pool.acquire()?;
            schema::migrate(&conn)?;
        }
        debug!(path = %path.display(), "storage opened");
        Ok(Store { pool })
    }

    /// The connection pool (shared with the native vector backend).
    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Size of the database file in bytes.
    pub fn db_size(&self) -> u64 {
        std::fs::metadata(self.pool.path())
            .map(|m| m.len())
            .unwrap_or(0)
    }

    /// Release idle connections so the DB file can be encrypted on close.
    pub fn close(&self) {
        self.pool.drain();
    }

    /// Store a memory, deduplicating on content hash.
    ///
    /// When the hash already exists the row keeps its id and creation time
    /// and the remaining fields are refreshed.
    pub fn store_memory(&self, new: &NewMemory) -> Result<i64> {
        if new.content.is_empty() {
            return Err(Error::InputInvalid("memory content must be non-empty".into()));
        }
        if let Metadata::Code(meta) = &new.metadata {
            meta.validate()?;
        } else if new.kind == MemoryType::Code {
            return Err(Error::InputInvalid(
                "code memories require code metadata".into(),
            ));
        }

        let conn = self.pool.acquire()?;
        store_memory_in(&conn, new)
    }

    /// Run `f` inside one transaction on a pooled connection.
    pub fn with_transaction<T>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut conn = self.pool.acquire()?;
        let tx = conn.transaction().map_err(db_err)?;
        let out = f(&tx)?;
        tx.commit().map_err(db_err)?;
        Ok(out)
    }

    /// Atomic wipe-then-insert of a file's chunks, with digest refresh.
    ///
    /// `file_spellings` carries every path spelling previous runs may have
    /// stored for this file (project-relative and workspace-relative); all
    /// of them are wiped before the new chunks land. The whole operation
    /// is one transaction, so cancellation mid-file rolls back cleanly and
    /// leaves the prior digest untouched.
    pub fn replace_file_chunks(
        &self,
        file_spellings: &[String],
        digest_file: &str,
        digest: &str,
        chunks: &[(NewMemory, Option<Vec<f32>>)],
    ) -> Result<usize> {
        self.with_transaction(|tx| {
            for spelling in file_spellings {
                delete_code_by_file_in(tx, spelling)?;
            }
            let mut saved = 0;
            for (memory, vector) in chunks {
                let id = store_memory_in(tx, memory)?;
                if let Some(vec) = vector {
                    crate::vectors::upsert_vector_in(tx, id, vec)?;
                }
                saved += 1;
            }
            let now = Utc::now().to_rfc3339();
            tx.execute(
                "INSERT INTO file_digests (file, digest, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(file) DO UPDATE SET digest = excluded.digest,
                                                 updated_at = excluded.updated_at",
                params![digest_file, digest, now],
            )
            .map_err(db_err)?;
            Ok(saved)
        })
    }

    /// Fetch one memory by id.
    pub fn get_memory(&self, id: i64) -> Result<Option<Memory>> {
        let conn = self.pool.acquire()?;
        conn.query_row(
            &format!("SELECT {MEMORY_COLUMNS} FROM memories WHERE id = ?1"),
            params![id],
            row_to_memory,
        )
        .optional()
        .map_err(db_err)?
        .transpose()
    }

    /// Delete one memory; the FTS mirror and vector row follow.
    pub fn delete_memory(&self, id: i64) -> Result<bool> {
        let conn = self.pool.acquire()?;
        let n = conn
            .execute("DELETE FROM memories WHERE id = ?1", params![id])
            .map_err(db_err)?;
        Ok(n > 0)
    }

    pub fn count_memories(&self) -> Result<u64> {
        let conn = self.pool.acquire()?;
        conn.query_row("SELECT count(*) FROM memories", [], |row| row.get(0))
            .map_err(db_err)
    }

    /// Memories created or updated at/after the given RFC 3339 instant.
    pub fn count_memories_since(&self, iso: &str) -> Result<u64> {
        let conn = self.pool.acquire()?;
        conn.query_row(
            "SELECT count(*) FROM memories WHERE updated_at >= ?1",
            params![iso],
            |row| row.get(0),
        )
        .map_err(db_err)
    }

    /// Full-text search with relevance mapped into [0, 1].
    ///
    /// An empty or token-free query returns no results (not an error).
    pub fn search_memories(&self, query: &str, opts: &SearchOptions) -> Result<Vec<MemoryHit>> {
        let Some(match_expr) = build_match_query(query) else {
            return Ok(Vec::new());
        };
        let limit = if opts.limit == 0 { DEFAULT_SEARCH_LIMIT } else { opts.limit };
        let kind = opts.kind.as_ref().map(|k| k.as_str().to_string());

        let conn = self.pool.acquire()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {MEMORY_COLUMNS_M}, memories_fts.rank
                 FROM memories_fts JOIN memories m ON m.id = memories_fts.rowid
                 WHERE memories_fts MATCH ?1
                   AND (?2 IS NULL OR m.type = ?2)
                   AND (?3 IS NULL OR m.context = ?3)
                 ORDER BY memories_fts.rank
                 LIMIT ?4 OFFSET ?5"
            ))
            .map_err(db_err)?;

        let rows = stmt
            .query_map(
                params![match_expr, kind, opts.context, limit as i64, opts.offset as i64],
                |row| {
                    let rank: f64 = row.get(9)?;
                    Ok((row_to_memory(row)?, rank))
                },
            )
            .map_err(db_err)?;

        let mut hits = Vec::new();
        for row in rows {
            let (memory, rank) = row.map_err(db_err)?;
            let memory = memory?;
            if !opts.tags.is_empty() && !opts.tags.iter().all(|t| memory.tags.contains(t)) {
                continue;
            }
            let relevance = rank_to_relevance(rank);
            if relevance < opts.min_relevance {
                continue;
            }
            hits.push(MemoryHit { memory, relevance, rank });
        }
        Ok(hits)
    }

    /// Delete all code rows for a repo-relative file path.
    pub fn delete_code_by_file(&self, rel_path: &str) -> Result<usize> {
        let conn = self.pool.acquire()?;
        delete_code_by_file_in(&conn, rel_path)
    }

    /// Rewrite `metadata.file` in place for a renamed file.
    pub fn update_code_file_path(&self, old: &str, new: &str) -> Result<usize> {
        let conn = self.pool.acquire()?;
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "UPDATE memories
             SET metadata_json = json_set(metadata_json, '$.file', ?2), updated_at = ?3
             WHERE type = 'code' AND json_extract(metadata_json, '$.file') = ?1",
            params![old, new, now],
        )
        .map_err(db_err)
    }

    /// All memories of one type, oldest first (used by export and GC).
    pub fn list_memories_by_type(&self, kind: &MemoryType) -> Result<Vec<Memory>> {
        let conn = self.pool.acquire()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {MEMORY_COLUMNS} FROM memories WHERE type = ?1 ORDER BY id"
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![kind.as_str()], row_to_memory)
            .map_err(db_err)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(db_err)??);
        }
        Ok(out)
    }

    /// All memories that are not code chunks (for notes export).
    pub fn list_non_code_memories(&self) -> Result<Vec<Memory>> {
        let conn = self.pool.acquire()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {MEMORY_COLUMNS} FROM memories WHERE type != 'code' ORDER BY id"
            ))
            .map_err(db_err)?;
        let rows = stmt.query_map([], row_to_memory).map_err(db_err)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(db_err)??);
        }
        Ok(out)
    }

    /// Reclaim storage.
    pub fn vacuum(&self) -> Result<()> {
        let conn = self.pool.acquire()?;
        conn.execute_batch("VACUUM").map_err(db_err)
    }
}

const MEMORY_COLUMNS: &str =
    "id, content, context, type, tags_json, metadata_json, content_hash, created_at, updated_at";
const MEMORY_COLUMNS_M: &str = "m.id, m.content, m.context, m.type, m.tags_json, m.metadata_json, m.content_hash, m.created_at, m.updated_at";

/// Insert or refresh a memory on an open connection (usable in
/// transactions). Returns the row id, stable across hash collisions.
pub(crate) fn store_memory_in(conn: &Connection, new: &NewMemory) -> Result<i64> {
    let hash = content_hash(&new.content);
    let now = Utc::now().to_rfc3339();
    let tags_json = serde_json::to_string(&new.tags)?;
    let metadata_json = new.metadata.to_json()?;

    conn.execute(
        "INSERT INTO memories
             (content, context, type, tags_json, metadata_json, content_hash, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
         ON CONFLICT(content_hash) DO UPDATE SET
             context = excluded.context,
             type = excluded.type,
             tags_json = excluded.tags_json,
             metadata_json = excluded.metadata_json,
             updated_at = excluded.updated_at",
        params![
            new.content,
            new.context,
            new.kind.as_str(),
            tags_json,
            metadata_json,
            hash,
            now
        ],
    )
    .map_err(db_err)?;

    conn.query_row(
        "SELECT id FROM memories WHERE content_hash = ?1",
        params![hash],
        |row| row.get(0),
    )
    .map_err(db_err)
}

pub(crate) fn delete_code_by_file_in(conn: &Connection, rel_path: &str) -> Result<usize> {
    conn.execute(
        "DELETE FROM memories
         WHERE type = 'code' AND json_extract(metadata_json, '$.file') = ?1",
        params![rel_path],
    )
    .map_err(db_err)
}

fn row_to_memory(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<Memory>> {
    let id: i64 = row.get(0)?;
    let content: String = row.get(1)?;
    let context: String = row.get(2)?;
    let kind_str: String = row.get(3)?;
    let tags_json: String = row.get(4)?;
    let metadata_json: String = row.get(5)?;
    let content_hash: String = row.get(6)?;
    let created_at: String = row.get(7)?;
    let updated_at: String = row.get(8)?;

    let kind = MemoryType::from(kind_str.as_str());
    Ok(build_memory(
        id,
        content,
        context,
        kind,
        &tags_json,
        &metadata_json,
        content_hash,
        &created_at,
        &updated_at,
    ))
}

#[allow(clippy::too_many_arguments)]
fn build_memory(
    id: i64,
    content: String,
    context: String,
    kind: MemoryType,
    tags_json: &str,
    metadata_json: &str,
    content_hash: String,
    created_at: &str,
    updated_at: &str,
) -> Result<Memory> {
    let tags: Vec<String> = serde_json::from_str(tags_json).unwrap_or_default();
    let metadata = Metadata::from_json(&kind, metadata_json)
        .map_err(|e| Error::StorageCorrupt(format!("memory {id} metadata unreadable: {e}")))?;
    Ok(Memory {
        id,
        content,
        context,
        kind,
        tags,
        metadata,
        content_hash,
        created_at: parse_ts(created_at),
        updated_at: parse_ts(updated_at),
    })
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| DateTime::<Utc>::UNIX_EPOCH)
}

/// Build an FTS5 MATCH expression from free text: word tokens, quoted,
/// implicitly ANDed. `None` when the query has no tokens.
fn build_match_query(query: &str) -> Option<String> {
    let tokens: Vec<String> = query
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{}\"", t))
        .collect();
    if tokens.is_empty() {
        None
    } else {
        Some(tokens.join(" "))
    }
}
