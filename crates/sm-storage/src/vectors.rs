//! Vector rows: little-endian float32 blobs keyed by memory id.
//!
//! The first stored vector fixes the project-wide dimension; later writes
//! with a different dimension are rejected. The native-ANN probe lives
//! here too, since a native backend shares the storage connection.

use std::collections::HashMap;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use sm_common::{Error, Result};

use crate::pool::db_err;
use crate::store::Store;

/// Encode a vector as a little-endian float32 blob.
pub fn encode_vector(vec: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(vec.len() * 4);
    for v in vec {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

/// Decode a little-endian float32 blob.
pub fn decode_vector(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

impl Store {
    /// Insert or replace the vector for a memory.
    pub fn upsert_vector(&self, id: i64, vec: &[f32]) -> Result<()> {
        let conn = self.pool().acquire()?;
        upsert_vector_in(&conn, id, vec)
    }

    /// The project-wide vector dimension, if any vector is stored.
    pub fn vector_dim(&self) -> Result<Option<usize>> {
        let conn = self.pool().acquire()?;
        vector_dim_in(&conn)
    }

    pub fn get_vector(&self, id: i64) -> Result<Option<Vec<f32>>> {
        let conn = self.pool().acquire()?;
        let blob: Option<Vec<u8>> = conn
            .query_row(
                "SELECT vector FROM memory_vectors WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        Ok(blob.map(|b| decode_vector(&b)))
    }

    /// Fetch vectors for a set of ids. Missing ids are simply absent.
    pub fn get_vectors(&self, ids: &[i64]) -> Result<HashMap<i64, Vec<f32>>> {
        let conn = self.pool().acquire()?;
        let mut stmt = conn
            .prepare("SELECT vector FROM memory_vectors WHERE id = ?1")
            .map_err(db_err)?;
        let mut out = HashMap::with_capacity(ids.len());
        for &id in ids {
            let blob: Option<Vec<u8>> = stmt
                .query_row(params![id], |row| row.get(0))
                .optional()
                .map_err(db_err)?;
            if let Some(blob) = blob {
                out.insert(id, decode_vector(&blob));
            }
        }
        Ok(out)
    }

    /// Every stored vector (feeds the in-process cosine index).
    pub fn all_vectors(&self) -> Result<Vec<(i64, Vec<f32>)>> {
        let conn = self.pool().acquire()?;
        let mut stmt = conn
            .prepare("SELECT id, vector FROM memory_vectors")
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| {
                let id: i64 = row.get(0)?;
                let blob: Vec<u8> = row.get(1)?;
                Ok((id, blob))
            })
            .map_err(db_err)?;
        let mut out = Vec::new();
        for row in rows {
            let (id, blob) = row.map_err(db_err)?;
            out.push((id, decode_vector(&blob)));
        }
        Ok(out)
    }

    pub fn delete_vector(&self, id: i64) -> Result<bool> {
        let conn = self.pool().acquire()?;
        let n = conn
            .execute("DELETE FROM memory_vectors WHERE id = ?1", params![id])
            .map_err(db_err)?;
        Ok(n > 0)
    }

    pub fn count_vectors(&self) -> Result<u64> {
        let conn = self.pool().acquire()?;
        conn.query_row("SELECT count(*) FROM memory_vectors", [], |row| row.get(0))
            .map_err(db_err)
    }

    /// Vectors whose memory was updated at/after the given instant.
    pub fn count_vectors_since(&self, iso: &str) -> Result<u64> {
        let conn = self.pool().acquire()?;
        conn.query_row(
            "SELECT count(*) FROM memory_vectors v
             JOIN memories m ON m.id = v.id
             WHERE m.updated_at >= ?1",
            params![iso],
            |row| row.get(0),
        )
        .map_err(db_err)
    }

    /// Delete vector rows whose memory no longer exists.
    ///
    /// The FK cascade keeps this empty in normal operation; imports and
    /// native-backend lag can still strand rows.
    pub fn prune_orphan_vectors(&self) -> Result<usize> {
        let conn = self.pool().acquire()?;
        let n = conn
            .execute(
                "DELETE FROM memory_vectors
                 WHERE id NOT IN (SELECT id FROM memories)",
                [],
            )
            .map_err(db_err)?;
        if n > 0 {
            debug!(pruned = n, "orphan vectors removed");
        }
        Ok(n)
    }

    /// Whether a native ANN SQL extension is loaded into this database.
    pub fn native_ann_available(&self) -> bool {
        self.pool()
            .acquire()
            .ok()
            .map(|conn| conn.prepare("SELECT vec_version()").is_ok())
            .unwrap_or(false)
    }

    /// K-nearest-neighbour search through the native extension.
    ///
    /// Returns `(id, distance)` pairs, nearest first. Errors with
    /// `BackendUnavailable` when no extension is loaded; callers fall back
    /// to the in-process scan.
    pub fn knn_native(&self, query: &[f32], k: usize) -> Result<Vec<(i64, f64)>> {
        let conn = self.pool().acquire()?;
        if conn.prepare("SELECT vec_version()").is_err() {
            return Err(Error::BackendUnavailable(
                "no native ANN extension loaded".to_string(),
            ));
        }
        let mut stmt = conn
            .prepare(
                "SELECT id, vec_distance_cosine(vector, ?1) AS d
                 FROM memory_vectors ORDER BY d LIMIT ?2",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![encode_vector(query), k as i64], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, f64>(1)?))
            })
            .map_err(db_err)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(db_err)?);
        }
        Ok(out)
    }
}

/// Upsert on an open connection (usable inside transactions).
pub(crate) fn upsert_vector_in(conn: &Connection, id: i64, vec: &[f32]) -> Result<()> {
    if vec.is_empty() {
        return Err(Error::InputInvalid("vector must be non-empty".into()));
    }
    if let Some(dim) = vector_dim_in(conn)? {
        if dim != vec.len() {
            return Err(Error::InputInvalid(format!(
                "vector dimension {} does not match project dimension {}",
                vec.len(),
                dim
            )));
        }
    }
    conn.execute(
        "INSERT INTO memory_vectors (id, dim, vector) VALUES (?1, ?2, ?3)
         ON CONFLICT(id) DO UPDATE SET dim = excluded.dim, vector = excluded.vector",
        params![id, vec.len() as i64, encode_vector(vec)],
    )
    .map_err(db_err)?;
    Ok(())
}

fn vector_dim_in(conn: &Connection) -> Result<Option<usize>> {
    let dim: Option<i64> = conn
        .query_row("SELECT dim FROM memory_vectors LIMIT 1", [], |row| row.get(0))
        .optional()
        .map_err(db_err)?;
    Ok(dim.map(|d| d as usize))
}
