//! Append-only JSONL journal over receipts.
//!
//! Appends happen only after the referenced receipt file is fsynced, so
//! journal readers may assume every referenced receipt exists.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use sm_common::Result;

/// One journal line: `{ts, cmd, args | error, receipt}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub ts: DateTime<Utc>,
    pub cmd: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Forward-slash path of the receipt, relative to the project root.
    pub receipt: String,
}

impl JournalEntry {
    pub fn ok(cmd: impl Into<String>, args: serde_json::Value, receipt: impl Into<String>) -> Self {
        JournalEntry {
            ts: Utc::now(),
            cmd: cmd.into(),
            args: Some(args),
            error: None,
            receipt: receipt.into(),
        }
    }

    pub fn failed(
        cmd: impl Into<String>,
        error: impl Into<String>,
        receipt: impl Into<String>,
    ) -> Self {
        JournalEntry {
            ts: Utc::now(),
            cmd: cmd.into(),
            args: None,
            error: Some(error.into()),
            receipt: receipt.into(),
        }
    }

    /// Receipt id derived from the referenced path.
    pub fn receipt_id(&self) -> Option<&str> {
        Path::new(&self.receipt)
            .file_stem()
            .and_then(|s| s.to_str())
    }
}

/// Handle to the append-only journal file.
pub struct Journal {
    path: PathBuf,
}

impl Journal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Journal { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry and flush it to disk.
    pub fn append(&self, entry: &JournalEntry) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let line = serde_json::to_string(entry)?;
        writeln!(file, "{line}")?;
        file.sync_all()?;
        debug!(cmd = %entry.cmd, "journal entry appended");
        Ok(())
    }

    /// Read every entry, oldest first. Unparseable lines are skipped.
    pub fn read_all(&self) -> Result<Vec<JournalEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(&self.path)?;
        Ok(raw
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect())
    }

    /// Truncate the journal (receipts stay on disk).
    pub fn clear(&self) -> Result<()> {
        if self.path.exists() {
            std::fs::write(&self.path, b"")?;
        }
        Ok(())
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.read_all()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}
