//! Receipt v1.
//!
//! Field order is part of the schema: downstream tooling reads these
//! files positionally, so the struct declaration order below must not
//! change. Receipts are immutable once written; the writer fsyncs before
//! returning so a journal line never references a half-written file.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use sm_common::{generate_receipt_id, Error, ProjectLayout, Result};

/// Receipt schema identifier.
pub const RECEIPT_SCHEMA: &str = "v1";

/// Digest block within a receipt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReceiptDigests {
    /// SHA-256 of the canonical argv JSON.
    #[serde(rename = "argsSha256")]
    pub args_sha256: String,
}

/// Immutable record of one command invocation.
///
/// Declaration order is the v1 wire order; keep it bit-for-bit stable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Receipt {
    pub schema: String,
    pub version: String,
    pub id: String,
    pub command: String,
    pub argv: Vec<String>,
    pub cwd: String,
    #[serde(rename = "startTime")]
    pub start_time: DateTime<Utc>,
    #[serde(rename = "endTime")]
    pub end_time: DateTime<Utc>,
    pub params: serde_json::Value,
    #[serde(rename = "resultSummary")]
    pub result_summary: String,
    pub results: serde_json::Value,
    pub success: bool,
    #[serde(rename = "exitCode", skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub digests: ReceiptDigests,
}

impl Receipt {
    /// Start a receipt for a command invocation. `cwd` must already be
    /// redacted by the caller ([`ProjectLayout::redact_path`]).
    pub fn start(
        version: impl Into<String>,
        command: impl Into<String>,
        argv: Vec<String>,
        cwd: impl Into<String>,
    ) -> Self {
        let args_sha256 = {
            let canonical = serde_json::to_string(&argv).unwrap_or_default();
            hex::encode(Sha256::digest(canonical.as_bytes()))
        };
        let now = Utc::now();
        Receipt {
            schema: RECEIPT_SCHEMA.to_string(),
            version: version.into(),
            id: generate_receipt_id(),
            command: command.into(),
            argv,
            cwd: cwd.into(),
            start_time: now,
            end_time: now,
            params: serde_json::Value::Null,
            result_summary: String::new(),
            results: serde_json::Value::Null,
            success: false,
            exit_code: None,
            error: None,
            digests: ReceiptDigests { args_sha256 },
        }
    }

    /// Record command parameters.
    pub fn with_params<T: Serialize>(mut self, params: &T) -> Self {
        self.params = serde_json::to_value(params).unwrap_or(serde_json::Value::Null);
        self
    }

    /// Close the receipt as a success.
    pub fn finish_ok<T: Serialize>(mut self, summary: impl Into<String>, results: &T) -> Self {
        self.end_time = Utc::now();
        self.result_summary = summary.into();
        self.results = serde_json::to_value(results).unwrap_or(serde_json::Value::Null);
        self.success = true;
        self.exit_code = Some(0);
        self
    }

    /// Close the receipt as a failure. The error string is never empty.
    pub fn finish_err(mut self, error: &Error) -> Self {
        self.end_time = Utc::now();
        self.result_summary = format!("{} failed", self.command);
        self.success = false;
        self.exit_code = Some(error.exit_code());
        self.error = Some(error.to_string());
        self
    }

    /// Write under `receipts/<id>.json` and fsync. Returns the path.
    pub fn write(&self, layout: &ProjectLayout) -> Result<PathBuf> {
        let dir = layout.receipts_dir();
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{}.json", self.id));
        let mut file = std::fs::File::create(&path)?;
        file.write_all(&serde_json::to_vec_pretty(self)?)?;
        file.sync_all()?;
        debug!(receipt = %self.id, "receipt written");
        Ok(path)
    }

    /// Load a receipt from a file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw)
            .map_err(|e| Error::StorageCorrupt(format!("unreadable receipt {}: {e}", path.display())))
    }

    /// Find a receipt by id, checking canonical then legacy locations.
    pub fn find(layout: &ProjectLayout, id: &str) -> Result<Self> {
        for dir in [layout.receipts_dir(), layout.legacy_receipts_dir()] {
            let candidate = dir.join(format!("{id}.json"));
            if candidate.exists() {
                return Self::load(&candidate);
            }
        }
        Err(Error::NotFound(format!("no receipt with id '{id}'")))
    }

    /// Receipts sorted most recent first (canonical plus legacy dirs).
    pub fn list(layout: &ProjectLayout, limit: usize) -> Result<Vec<Receipt>> {
        let mut paths: Vec<PathBuf> = Vec::new();
        for dir in [layout.receipts_dir(), layout.legacy_receipts_dir()] {
            if let Ok(entries) = std::fs::read_dir(&dir) {
                for entry in entries.flatten() {
                    if entry.path().extension().is_some_and(|e| e == "json") {
                        paths.push(entry.path());
                    }
                }
            }
        }
        // Receipt IDs are timestamped, so name order is time order.
        paths.sort();
        paths.reverse();
        paths.truncate(limit);
        paths.iter().map(|p| Self::load(p)).collect()
    }
}
