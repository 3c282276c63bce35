//! Bundle reader and verification.
//!
//! Verification order is part of the contract: checksums first, then the
//! signature, then parsing/ingest. A tampered byte therefore surfaces as
//! a checksum mismatch (exit 4) even in a signed bundle.

use std::collections::HashMap;
use std::io::Read;
use std::path::Path;

use tracing::debug;

use crate::error::{BundleError, Result};
use crate::manifest::{sha256_hex, BundleManifest, Checksums, MapRow, CANONICAL_FILE_ORDER};

/// Signature verification outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum SignatureState {
    /// No `signature.bin`/`publickey.der` in the bundle.
    Unsigned,
    /// Signature verified; signer key id attached.
    Valid { key_id: String },
}

/// Fully parsed bundle contents.
#[derive(Debug)]
pub struct BundleContents {
    pub manifest: BundleManifest,
    pub rows: Vec<MapRow>,
    /// One vector per `vectors.count`, in `map.csv` order.
    pub vectors: Vec<Vec<f32>>,
    pub notes: Vec<serde_json::Value>,
}

/// Reader over a bundle directory or single-file ZIP.
///
/// The legacy `.agmctx` layout is identical on disk, so it reads through
/// the same code path.
pub struct BundleReader {
    files: HashMap<String, Vec<u8>>,
}

impl BundleReader {
    /// Load a bundle from a directory or a ZIP file into memory.
    pub fn open(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(BundleError::MissingFile(path.display().to_string()));
        }
        let files = if path.is_dir() {
            let mut files = HashMap::new();
            for entry in std::fs::read_dir(path)? {
                let entry = entry?;
                if entry.file_type()?.is_file() {
                    let name = entry.file_name().to_string_lossy().to_string();
                    files.insert(name, std::fs::read(entry.path())?);
                }
            }
            files
        } else {
            let file = std::fs::File::open(path)?;
            let mut archive = zip::ZipArchive::new(file)?;
            let mut files = HashMap::new();
            for i in 0..archive.len() {
                let mut entry = archive.by_index(i)?;
                if entry.is_dir() {
                    continue;
                }
                let mut bytes = Vec::with_capacity(entry.size() as usize);
                entry.read_to_end(&mut bytes)?;
                files.insert(entry.name().to_string(), bytes);
            }
            files
        };
        debug!(files = files.len(), path = %path.display(), "bundle opened");
        Ok(BundleReader { files })
    }

    fn file(&self, name: &str) -> Result<&[u8]> {
        self.files
            .get(name)
            .map(|b| b.as_slice())
            .ok_or_else(|| BundleError::MissingFile(name.to_string()))
    }

    /// Verify every checksum in `checksums.json` against the payload.
    ///
    /// Must run before signature verification and ingest.
    pub fn verify_checksums(&self) -> Result<()> {
        let checksums: Checksums = serde_json::from_slice(self.file("checksums.json")?)?;
        for (name, expected) in &checksums {
            let bytes = self.file(name)?;
            let actual = sha256_hex(bytes);
            if &actual != expected {
                return Err(BundleError::ChecksumMismatch {
                    path: name.clone(),
                    expected: expected.clone(),
                    actual,
                });
            }
        }
        debug!(files = checksums.len(), "bundle checksums verified");
        Ok(())
    }

    /// Verify the detached signature, when one is present.
    pub fn verify_signature(&self) -> Result<SignatureState> {
        let (signature, public_key) = match (
            self.files.get("signature.bin"),
            self.files.get("publickey.der"),
        ) {
            (Some(sig), Some(key)) => (sig, key),
            (None, None) => return Ok(SignatureState::Unsigned),
            _ => {
                return Err(BundleError::SignatureInvalid(
                    "bundle carries a partial signature (one of signature.bin/publickey.der)"
                        .to_string(),
                ))
            }
        };

        let mut message = Vec::new();
        for name in CANONICAL_FILE_ORDER {
            message.extend_from_slice(self.file(name)?);
        }
        sm_crypto::keyring::verify_detached(public_key, &message, signature)
            .map_err(|e| BundleError::SignatureInvalid(e.to_string()))?;
        let key_id = sm_crypto::keyring::key_id_for(public_key)
            .map_err(|e| BundleError::SignatureInvalid(e.to_string()))?;
        debug!(key_id = %key_id, "bundle signature verified");
        Ok(SignatureState::Valid { key_id })
    }

    /// Parse manifest, map rows, vectors, and notes.
    ///
    /// Fails closed on unknown schema versions and on vector payloads
    /// that do not match the manifest shape.
    pub fn parse(&self) -> Result<BundleContents> {
        let manifest: BundleManifest = serde_json::from_slice(self.file("manifest.json")?)
            .map_err(|e| BundleError::CorruptedManifest(e.to_string()))?;
        manifest.validate()?;

        let mut rows = Vec::new();
        let mut csv_reader = csv::Reader::from_reader(self.file("map.csv")?);
        for row in csv_reader.deserialize() {
            rows.push(row?);
        }

        let vector_bytes = self.file("vectors.f32")?;
        let expected_len = manifest.vectors.count * manifest.vectors.dim * 4;
        if vector_bytes.len() != expected_len {
            return Err(BundleError::VectorShape(format!(
                "vectors.f32 is {} bytes, manifest implies {expected_len}",
                vector_bytes.len()
            )));
        }
        let mut vectors = Vec::with_capacity(manifest.vectors.count);
        if manifest.vectors.dim > 0 {
            for chunk in vector_bytes.chunks_exact(manifest.vectors.dim * 4) {
                let vec: Vec<f32> = chunk
                    .chunks_exact(4)
                    .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                    .collect();
                vectors.push(vec);
            }
        }

        let mut notes = Vec::new();
        for line in String::from_utf8_lossy(self.file("notes.jsonl")?).lines() {
            if line.trim().is_empty() {
                continue;
            }
            notes.push(serde_json::from_str(line)?);
        }

        Ok(BundleContents {
            manifest,
            rows,
            vectors,
            notes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::BundleType;
    use crate::writer::BundleWriter;
    use sm_common::ProjectLayout;
    use sm_crypto::KeyRing;
    use tempfile::TempDir;

    fn row(id: i64) -> MapRow {
        MapRow {
            id,
            file: format!("src/f{id}.rs"),
            lang: "rust".into(),
            line_start: 1,
            line_end: 10,
            symbol: "f".into(),
            symbol_type: "function".into(),
            timestamp: "2026-08-01T00:00:00Z".into(),
            chunk_sha256: "c".repeat(64),
        }
    }

    fn write_sample(dir: &Path, signed: Option<&KeyRing>) -> std::path::PathBuf {
        let out = dir.join("bundle.smemctx");
        let mut writer = BundleWriter::new(BundleType::Mixed);
        writer.add_chunk(row(1), Some(vec![1.0, 0.0])).unwrap();
        writer.add_chunk(row(2), Some(vec![0.0, 1.0])).unwrap();
        writer.add_note(serde_json::json!({"content": "a note", "type": "note"}));
        writer.write_dir(&out, signed).unwrap();
        out
    }

    #[test]
    fn test_roundtrip_dir() {
        let tmp = TempDir::new().unwrap();
        let out = write_sample(tmp.path(), None);

        let reader = BundleReader::open(&out).unwrap();
        reader.verify_checksums().unwrap();
        assert_eq!(reader.verify_signature().unwrap(), SignatureState::Unsigned);

        let contents = reader.parse().unwrap();
        assert_eq!(contents.manifest.count, 3);
        assert_eq!(contents.rows.len(), 2);
        assert_eq!(contents.vectors.len(), 2);
        assert_eq!(contents.vectors[0], vec![1.0, 0.0]);
        assert_eq!(contents.notes.len(), 1);
    }

    #[test]
    fn test_roundtrip_zip() {
        let tmp = TempDir::new().unwrap();
        let out = tmp.path().join("bundle.smemctx.zip");
        let mut writer = BundleWriter::new(BundleType::Code);
        writer.add_chunk(row(1), None).unwrap();
        writer.write_zip(&out, None).unwrap();

        let reader = BundleReader::open(&out).unwrap();
        reader.verify_checksums().unwrap();
        let contents = reader.parse().unwrap();
        assert_eq!(contents.rows.len(), 1);
        assert!(contents.vectors.is_empty());
    }

    #[test]
    fn test_flipped_byte_fails_checksum() {
        let tmp = TempDir::new().unwrap();
        let out = write_sample(tmp.path(), None);

        // Flip one byte in vectors.f32.
        let vec_path = out.join("vectors.f32");
        let mut bytes = std::fs::read(&vec_path).unwrap();
        bytes[0] ^= 0xff;
        std::fs::write(&vec_path, &bytes).unwrap();

        let reader = BundleReader::open(&out).unwrap();
        let err = reader.verify_checksums().unwrap_err();
        assert!(matches!(err, BundleError::ChecksumMismatch { .. }));
        let unified: sm_common::Error = err.into();
        assert_eq!(unified.exit_code(), 4);
        assert!(unified.to_string().contains("checksum mismatch"));
    }

    #[test]
    fn test_signed_roundtrip_and_tamper_detection() {
        let tmp = TempDir::new().unwrap();
        let layout = ProjectLayout::new(tmp.path());
        layout.ensure().unwrap();
        let keyring = KeyRing::load_or_create(&layout).unwrap();
        let out = write_sample(tmp.path(), Some(&keyring));

        let reader = BundleReader::open(&out).unwrap();
        reader.verify_checksums().unwrap();
        match reader.verify_signature().unwrap() {
            SignatureState::Valid { key_id } => assert_eq!(key_id, keyring.key_id()),
            other => panic!("expected valid signature, got {other:?}"),
        }

        // Corrupt the signature itself; checksums still pass.
        let mut sig = std::fs::read(out.join("signature.bin")).unwrap();
        sig[10] ^= 0x01;
        std::fs::write(out.join("signature.bin"), &sig).unwrap();
        let reader = BundleReader::open(&out).unwrap();
        reader.verify_checksums().unwrap();
        let err = reader.verify_signature().unwrap_err();
        assert!(matches!(err, BundleError::SignatureInvalid(_)));
        let unified: sm_common::Error = err.into();
        assert_eq!(unified.exit_code(), 3);
    }

    #[test]
    fn test_future_schema_fails_closed() {
        let tmp = TempDir::new().unwrap();
        let out = write_sample(tmp.path(), None);

        let manifest_path = out.join("manifest.json");
        let raw = std::fs::read_to_string(&manifest_path).unwrap();
        std::fs::write(
            &manifest_path,
            raw.replace("\"schemaVersion\": 1", "\"schemaVersion\": 9"),
        )
        .unwrap();

        let reader = BundleReader::open(&out).unwrap();
        let err = reader.parse().unwrap_err();
        assert!(matches!(err, BundleError::UnsupportedVersion { .. }));
    }

    #[test]
    fn test_missing_file_reported() {
        let tmp = TempDir::new().unwrap();
        let out = write_sample(tmp.path(), None);
        std::fs::remove_file(out.join("map.csv")).unwrap();

        let reader = BundleReader::open(&out).unwrap();
        let err = reader.verify_checksums().unwrap_err();
        assert!(matches!(err, BundleError::MissingFile(_)));
    }
}
