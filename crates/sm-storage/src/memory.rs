//! Memory record types and the typed metadata variants.
//!
//! Metadata is stored as JSON text but handled in memory as a tagged
//! variant keyed off the memory type, so code-chunk fields are
//! type-checked instead of being loose string maps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use sm_common::{Error, Result};

/// Reserved memory types plus an escape hatch for forward compatibility.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MemoryType {
    General,
    Note,
    Code,
    Other(String),
}

impl MemoryType {
    pub fn as_str(&self) -> &str {
        match self {
            MemoryType::General => "general",
            MemoryType::Note => "note",
            MemoryType::Code => "code",
            MemoryType::Other(s) => s,
        }
    }
}

impl From<&str> for MemoryType {
    fn from(s: &str) -> Self {
        match s {
            "general" => MemoryType::General,
            "note" => MemoryType::Note,
            "code" => MemoryType::Code,
            other => MemoryType::Other(other.to_string()),
        }
    }
}

impl std::fmt::Display for MemoryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How a code chunk was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexStrategy {
    #[serde(rename = "line-chunks")]
    LineChunks,
    #[serde(rename = "heuristic-symbols")]
    HeuristicSymbols,
    #[serde(rename = "treesitter-ast")]
    TreesitterAst,
}

impl std::fmt::Display for IndexStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            IndexStrategy::LineChunks => "line-chunks",
            IndexStrategy::HeuristicSymbols => "heuristic-symbols",
            IndexStrategy::TreesitterAst => "treesitter-ast",
        };
        write!(f, "{}", s)
    }
}

/// Required and optional metadata for `type="code"` memories.
///
/// `file` is repo-relative with forward slashes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeChunkMeta {
    pub file: String,
    pub language: String,
    pub line_start: u32,
    pub line_end: u32,
    /// SHA-256 of the chunk text.
    pub content_sha: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_digest: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index_strategy: Option<IndexStrategy>,
}

impl CodeChunkMeta {
    /// Validate the invariants the storage layer enforces on insert.
    pub fn validate(&self) -> Result<()> {
        if self.file.is_empty() || self.file.contains('\\') {
            return Err(Error::InputInvalid(format!(
                "code metadata file must be repo-relative with forward slashes, got '{}'",
                self.file
            )));
        }
        if self.line_start > self.line_end {
            return Err(Error::InputInvalid(format!(
                "code metadata line range inverted: {}..{}",
                self.line_start, self.line_end
            )));
        }
        if self.content_sha.len() != 64 {
            return Err(Error::InputInvalid(
                "code metadata contentSha must be 64 hex chars".to_string(),
            ));
        }
        Ok(())
    }
}

/// Typed metadata union, serialized as a plain JSON object.
#[derive(Debug, Clone, PartialEq)]
pub enum Metadata {
    Code(CodeChunkMeta),
    General(serde_json::Map<String, serde_json::Value>),
}

impl Metadata {
    pub fn empty() -> Self {
        Metadata::General(serde_json::Map::new())
    }

    /// Serialize to the stored JSON text.
    pub fn to_json(&self) -> Result<String> {
        let value = match self {
            Metadata::Code(meta) => serde_json::to_value(meta)?,
            Metadata::General(map) => serde_json::Value::Object(map.clone()),
        };
        Ok(value.to_string())
    }

    /// Parse stored JSON text according to the memory type.
    pub fn from_json(kind: &MemoryType, json: &str) -> Result<Self> {
        if json.trim().is_empty() {
            return Ok(Metadata::empty());
        }
        match kind {
            MemoryType::Code => Ok(Metadata::Code(serde_json::from_str(json)?)),
            _ => {
                let map: serde_json::Map<String, serde_json::Value> =
                    serde_json::from_str(json)?;
                Ok(Metadata::General(map))
            }
        }
    }

    /// The code metadata, if this is a code memory.
    pub fn as_code(&self) -> Option<&CodeChunkMeta> {
        match self {
            Metadata::Code(meta) => Some(meta),
            Metadata::General(_) => None,
        }
    }
}

/// A stored memory row.
#[derive(Debug, Clone)]
pub struct Memory {
    pub id: i64,
    pub content: String,
    pub context: String,
    pub kind: MemoryType,
    pub tags: Vec<String>,
    pub metadata: Metadata,
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for storing a memory.
#[derive(Debug, Clone)]
pub struct NewMemory {
    pub content: String,
    pub context: String,
    pub kind: MemoryType,
    pub tags: Vec<String>,
    pub metadata: Metadata,
}

impl NewMemory {
    pub fn note(content: impl Into<String>, context: impl Into<String>) -> Self {
        NewMemory {
            content: content.into(),
            context: context.into(),
            kind: MemoryType::Note,
            tags: Vec::new(),
            metadata: Metadata::empty(),
        }
    }
}

/// Options for lexical memory search.
#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub limit: usize,
    pub offset: usize,
    pub kind: Option<MemoryType>,
    pub context: Option<String>,
    pub tags: Vec<String>,
    pub min_relevance: f64,
}

/// A search hit with its mapped relevance.
#[derive(Debug, Clone)]
pub struct MemoryHit {
    pub memory: Memory,
    /// FTS rank mapped to [0, 1].
    pub relevance: f64,
    /// Raw FTS rank (bm25; more negative is better).
    pub rank: f64,
}

/// SHA-256 hex of memory content; the dedup key.
pub fn content_hash(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

/// Monotone map from FTS rank to relevance in [0, 1]: `1/(1 + 0.1·|rank|)`.
pub fn rank_to_relevance(rank: f64) -> f64 {
    (1.0 / (1.0 + 0.1 * rank.abs())).clamp(0.0, 1.0)
}
