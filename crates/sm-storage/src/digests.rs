//! File-digest cache: one row per relative file path.
//!
//! Drives incremental indexing (skip files whose digest is unchanged) and
//! rename detection. Distinct from chunk-level `contentSha`.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use sm_common::Result;

use crate::pool::db_err;
use crate::store::Store;

/// A digest row: (file, digest, updated_at RFC 3339).
pub type DigestRow = (String, String, String);

impl Store {
    pub fn get_file_digest(&self, file: &str) -> Result<Option<String>> {
        let conn = self.pool().acquire()?;
        conn.query_row(
            "SELECT digest FROM file_digests WHERE file = ?1",
            params![file],
            |row| row.get(0),
        )
        .optional()
        .map_err(db_err)
    }

    pub fn set_file_digest(&self, file: &str, digest: &str) -> Result<()> {
        let conn = self.pool().acquire()?;
        conn.execute(
            "INSERT INTO file_digests (file, digest, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(file) DO UPDATE SET digest = excluded.digest,
                                             updated_at = excluded.updated_at",
            params![file, digest, Utc::now().to_rfc3339()],
        )
        .map_err(db_err)?;
        Ok(())
    }

    pub fn delete_file_digest(&self, file: &str) -> Result<bool> {
        let conn = self.pool().acquire()?;
        let n = conn
            .execute("DELETE FROM file_digests WHERE file = ?1", params![file])
            .map_err(db_err)?;
        Ok(n > 0)
    }

    pub fn clear_file_digests(&self) -> Result<usize> {
        let conn = self.pool().acquire()?;
        conn.execute("DELETE FROM file_digests", []).map_err(db_err)
    }

    /// Rename a digest row, keeping its digest value (rename fast path).
    pub fn move_file_digest(&self, old: &str, new: &str) -> Result<bool> {
        let conn = self.pool().acquire()?;
        let n = conn
            .execute(
                "UPDATE OR REPLACE file_digests
                 SET file = ?2, updated_at = ?3 WHERE file = ?1",
                params![old, new, Utc::now().to_rfc3339()],
            )
            .map_err(db_err)?;
        Ok(n > 0)
    }

    /// Digest rows, most recently updated first.
    pub fn list_file_digests(&self, limit: Option<usize>) -> Result<Vec<DigestRow>> {
        let conn = self.pool().acquire()?;
        let mut stmt = conn
            .prepare(
                "SELECT file, digest, updated_at FROM file_digests
                 ORDER BY updated_at DESC, file LIMIT ?1",
            )
            .map_err(db_err)?;
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let rows = stmt
            .query_map(params![limit], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })
            .map_err(db_err)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(db_err)?);
        }
        Ok(out)
    }

    pub fn count_file_digests(&self) -> Result<u64> {
        let conn = self.pool().acquire()?;
        conn.query_row("SELECT count(*) FROM file_digests", [], |row| row.get(0))
            .map_err(db_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_store(tmp: &TempDir) -> Store {
        Store::open(&tmp.path().join("memory.db")).unwrap()
    }

    #[test]
    fn test_digest_crud() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp);

        assert_eq!(store.get_file_digest("src/a.rs").unwrap(), None);
        store.set_file_digest("src/a.rs", "d1").unwrap();
        assert_eq!(store.get_file_digest("src/a.rs").unwrap().as_deref(), Some("d1"));

        // One row per path: updating replaces.
        store.set_file_digest("src/a.rs", "d2").unwrap();
        assert_eq!(store.count_file_digests().unwrap(), 1);
        assert_eq!(store.get_file_digest("src/a.rs").unwrap().as_deref(), Some("d2"));

        assert!(store.delete_file_digest("src/a.rs").unwrap());
        assert!(!store.delete_file_digest("src/a.rs").unwrap());
    }

    #[test]
    fn test_move_file_digest() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp);
        store.set_file_digest("src/old.rs", "d1").unwrap();
        assert!(store.move_file_digest("src/old.rs", "src/new.rs").unwrap());
        assert_eq!(store.get_file_digest("src/old.rs").unwrap(), None);
        assert_eq!(store.get_file_digest("src/new.rs").unwrap().as_deref(), Some("d1"));
    }

    #[test]
    fn test_list_and_clear() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp);
        store.set_file_digest("a", "1").unwrap();
        store.set_file_digest("b", "2").unwrap();
        store.set_file_digest("c", "3").unwrap();

        assert_eq!(store.list_file_digests(None).unwrap().len(), 3);
        assert_eq!(store.list_file_digests(Some(2)).unwrap().len(), 2);

        assert_eq!(store.clear_file_digests().unwrap(), 3);
        assert_eq!(store.count_file_digests().unwrap(), 0);
    }
}
