//! Bundle manifest, map rows, and checksum helpers.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Current bundle schema version.
pub const BUNDLE_SCHEMA_VERSION: u32 = 1;

/// File names inside a bundle, in the canonical signing order.
pub const CANONICAL_FILE_ORDER: &[&str] = &[
    "manifest.json",
    "map.csv",
    "vectors.f32",
    "notes.jsonl",
    "checksums.json",
];

/// What a bundle carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BundleType {
    Code,
    Notes,
    Mixed,
}

impl std::fmt::Display for BundleType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BundleType::Code => "code",
            BundleType::Notes => "notes",
            BundleType::Mixed => "mixed",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for BundleType {
    type Err = sm_common::Error;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "code" => Ok(BundleType::Code),
            "notes" => Ok(BundleType::Notes),
            "mixed" => Ok(BundleType::Mixed),
            other => Err(sm_common::Error::InputInvalid(format!(
                "unknown bundle type '{other}'"
            ))),
        }
    }
}

/// Vector payload shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorsInfo {
    pub dim: usize,
    pub count: usize,
}

/// `manifest.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleManifest {
    pub schema_version: u32,
    #[serde(rename = "type")]
    pub bundle_type: BundleType,
    /// Total exported memories (map rows plus notes).
    pub count: usize,
    pub created_at: DateTime<Utc>,
    pub vectors: VectorsInfo,
    /// Signer key id when the bundle is signed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,
}

impl BundleManifest {
    pub fn new(bundle_type: BundleType) -> Self {
        BundleManifest {
            schema_version: BUNDLE_SCHEMA_VERSION,
            bundle_type,
            count: 0,
            created_at: Utc::now(),
            vectors: VectorsInfo { dim: 0, count: 0 },
            key_id: None,
        }
    }

    /// Fail closed on schema versions from the future.
    pub fn validate(&self) -> crate::Result<()> {
        if self.schema_version != BUNDLE_SCHEMA_VERSION {
            return Err(crate::BundleError::UnsupportedVersion {
                version: self.schema_version,
                supported: BUNDLE_SCHEMA_VERSION,
            });
        }
        Ok(())
    }
}

/// One `map.csv` row. Field order matches the CSV header:
/// `id,file,lang,line_start,line_end,symbol,type,timestamp,chunk_sha256`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapRow {
    pub id: i64,
    pub file: String,
    pub lang: String,
    pub line_start: u32,
    pub line_end: u32,
    /// Empty when the chunk has no symbol.
    #[serde(default)]
    pub symbol: String,
    /// Symbol type, or empty.
    #[serde(rename = "type", default)]
    pub symbol_type: String,
    pub timestamp: String,
    pub chunk_sha256: String,
}

/// `checksums.json`: file name to SHA-256 hex, sorted by name.
pub type Checksums = BTreeMap<String, String>;

/// SHA-256 hex of a byte slice.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_json_shape() {
        let mut manifest = BundleManifest::new(BundleType::Code);
        manifest.count = 3;
        manifest.vectors = VectorsInfo { dim: 384, count: 3 };
        manifest.key_id = Some("abcd1234abcd1234".into());

        let json = serde_json::to_string(&manifest).unwrap();
        assert!(json.contains("\"schemaVersion\":1"));
        assert!(json.contains("\"type\":\"code\""));
        assert!(json.contains("\"createdAt\""));
        assert!(json.contains("\"keyId\""));
    }

    #[test]
    fn test_manifest_future_version_fails_closed() {
        let mut manifest = BundleManifest::new(BundleType::Mixed);
        manifest.schema_version = 2;
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn test_map_row_csv_roundtrip() {
        let row = MapRow {
            id: 7,
            file: "src/Trace.ts".into(),
            lang: "typescript".into(),
            line_start: 1,
            line_end: 42,
            symbol: "Tracer".into(),
            symbol_type: "class".into(),
            timestamp: "2026-08-01T00:00:00Z".into(),
            chunk_sha256: "a".repeat(64),
        };
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.serialize(&row).unwrap();
        let bytes = writer.into_inner().unwrap();
        let header = String::from_utf8_lossy(&bytes);
        assert!(header.starts_with(
            "id,file,lang,line_start,line_end,symbol,type,timestamp,chunk_sha256"
        ));

        let mut reader = csv::Reader::from_reader(bytes.as_slice());
        let parsed: MapRow = reader.deserialize().next().unwrap().unwrap();
        assert_eq!(parsed, row);
    }

    #[test]
    fn test_bundle_type_parse() {
        assert_eq!("code".parse::<BundleType>().unwrap(), BundleType::Code);
        assert!("movies".parse::<BundleType>().is_err());
    }
}
