//! Bounded connection pool.
//!
//! The pool is the only holder of handles to the DB file. Acquisition
//! blocks up to a timeout (default 5 s) and fails with `Timeout` when the
//! pool stays exhausted, which keeps a wedged writer from deadlocking the
//! whole CLI.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use rusqlite::Connection;
use tracing::trace;

use sm_common::{Error, Result};

/// Default pool size.
pub const DEFAULT_POOL_SIZE: usize = 3;

/// Default acquisition timeout.
pub const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

struct PoolInner {
    idle: Mutex<VecDeque<Connection>>,
    available: Condvar,
}

/// Bounded pool of SQLite connections to one database file.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
    path: PathBuf,
}

impl Pool {
    /// Open `size` connections against `path`, configuring each for
    /// WAL journaling, foreign keys, and a busy timeout.
    pub fn open(path: &Path, size: usize) -> Result<Self> {
        let mut idle = VecDeque::with_capacity(size);
        for _ in 0..size.max(1) {
            idle.push_back(Self::configure(Connection::open(path).map_err(db_err)?)?);
        }
        Ok(Pool {
            inner: Arc::new(PoolInner {
                idle: Mutex::new(idle),
                available: Condvar::new(),
            }),
            path: path.to_path_buf(),
        })
    }

    fn configure(conn: Connection) -> Result<Connection> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(db_err)?;
        Ok(conn)
    }

    /// Path of the underlying database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Acquire a connection, waiting up to [`ACQUIRE_TIMEOUT`].
    pub fn acquire(&self) -> Result<PooledConn> {
        self.acquire_timeout(ACQUIRE_TIMEOUT)
    }

    /// Acquire with an explicit timeout.
    pub fn acquire_timeout(&self, timeout: Duration) -> Result<PooledConn> {
        let deadline = Instant::now() + timeout;
        let mut idle = self
            .inner
            .idle
            .lock()
            .map_err(|_| Error::internal("connection pool poisoned"))?;
        loop {
            if let Some(conn) = idle.pop_front() {
                trace!("connection acquired");
                return Ok(PooledConn {
                    conn: Some(conn),
                    inner: Arc::clone(&self.inner),
                });
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::Timeout(format!(
                    "no database connection available within {:?}",
                    timeout
                )));
            }
            let (guard, wait) = self
                .inner
                .available
                .wait_timeout(idle, remaining)
                .map_err(|_| Error::internal("connection pool poisoned"))?;
            idle = guard;
            if wait.timed_out() && idle.is_empty() {
                return Err(Error::Timeout(format!(
                    "no database connection available within {:?}",
                    timeout
                )));
            }
        }
    }

    /// Drop all idle connections (used before encrypt-on-close so the DB
    /// file is no longer held open). Outstanding guards keep theirs.
    pub fn drain(&self) {
        if let Ok(mut idle) = self.inner.idle.lock() {
            idle.clear();
        }
    }
}

/// RAII connection guard; returns the connection to the pool on drop.
pub struct PooledConn {
    conn: Option<Connection>,
    inner: Arc<PoolInner>,
}

impl Deref for PooledConn {
    type Target = Connection;
    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection present until drop")
    }
}

impl DerefMut for PooledConn {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection present until drop")
    }
}

impl Drop for PooledConn {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if let Ok(mut idle) = self.inner.idle.lock() {
                idle.push_back(conn);
                self.inner.available.notify_one();
            }
        }
    }
}

/// Map a rusqlite error onto the unified error type.
///
/// Corruption-class failures surface as `StorageCorrupt`; everything else
/// is `Internal`.
pub fn db_err(e: rusqlite::Error) -> Error {
    match &e {
        rusqlite::Error::SqliteFailure(code, _)
            if matches!(
                code.code,
                rusqlite::ErrorCode::DatabaseCorrupt | rusqlite::ErrorCode::NotADatabase
            ) =>
        {
            Error::StorageCorrupt(e.to_string())
        }
        _ => Error::Internal(format!("database error: {e}")),
    }
}
