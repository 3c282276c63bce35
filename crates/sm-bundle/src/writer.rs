//! Bundle writer: assemble, checksum, optionally sign, land atomically.

use std::io::Write;
use std::path::Path;

use tracing::{debug, info};
use zip::write::{FileOptions, ZipWriter};
use zip::CompressionMethod;

use sm_crypto::KeyRing;

use crate::error::{BundleError, Result};
use crate::manifest::{
    sha256_hex, BundleManifest, BundleType, Checksums, MapRow, VectorsInfo, CANONICAL_FILE_ORDER,
};

/// Builder for `.smemctx` bundles.
pub struct BundleWriter {
    manifest: BundleManifest,
    rows: Vec<MapRow>,
    vectors: Vec<Vec<f32>>,
    notes: Vec<serde_json::Value>,
    vector_dim: Option<usize>,
}

impl BundleWriter {
    pub fn new(bundle_type: BundleType) -> Self {
        BundleWriter {
            manifest: BundleManifest::new(bundle_type),
            rows: Vec::new(),
            vectors: Vec::new(),
            notes: Vec::new(),
            vector_dim: None,
        }
    }

    /// Add a code chunk row with its optional vector.
    ///
    /// Vectors must share one dimension; rows without a vector are fine
    /// (the vector payload then skips them and `vectors.count` reflects
    /// only real vectors, written in row order).
    pub fn add_chunk(&mut self, row: MapRow, vector: Option<Vec<f32>>) -> Result<()> {
        if let Some(vec) = vector {
            if let Some(dim) = self.vector_dim {
                if dim != vec.len() {
                    return Err(BundleError::VectorShape(format!(
                        "vector for id {} has dim {}, bundle dim is {dim}",
                        row.id,
                        vec.len()
                    )));
                }
            } else {
                self.vector_dim = Some(vec.len());
            }
            self.vectors.push(vec);
        }
        self.rows.push(row);
        Ok(())
    }

    /// Add a non-code memory as one `notes.jsonl` line.
    pub fn add_note(&mut self, note: serde_json::Value) {
        self.notes.push(note);
    }

    pub fn chunk_count(&self) -> usize {
        self.rows.len()
    }

    pub fn note_count(&self) -> usize {
        self.notes.len()
    }

    /// Serialize all files in memory: `(name, bytes)` pairs in canonical
    /// order, checksums and manifest included.
    fn assemble(&mut self, keyring: Option<&KeyRing>) -> Result<Vec<(String, Vec<u8>)>> {
        if self.rows.is_empty() && self.notes.is_empty() {
            return Err(BundleError::EmptyBundle);
        }

        self.manifest.count = self.rows.len() + self.notes.len();
        self.manifest.vectors = VectorsInfo {
            dim: self.vector_dim.unwrap_or(0),
            count: self.vectors.len(),
        };
        self.manifest.key_id = keyring.map(|k| k.key_id());

        // map.csv
        let mut csv_writer = csv::Writer::from_writer(Vec::new());
        for row in &self.rows {
            csv_writer.serialize(row)?;
        }
        let map_bytes = csv_writer
            .into_inner()
            .map_err(|e| BundleError::CorruptedManifest(e.to_string()))?;

        // vectors.f32
        let mut vector_bytes =
            Vec::with_capacity(self.vectors.len() * self.vector_dim.unwrap_or(0) * 4);
        for vec in &self.vectors {
            for v in vec {
                vector_bytes.extend_from_slice(&v.to_le_bytes());
            }
        }

        // notes.jsonl
        let mut notes_bytes = Vec::new();
        for note in &self.notes {
            serde_json::to_writer(&mut notes_bytes, note)?;
            notes_bytes.push(b'\n');
        }

        let manifest_bytes = serde_json::to_vec_pretty(&self.manifest)?;

        // checksums.json covers every payload file including the manifest.
        let mut checksums = Checksums::new();
        checksums.insert("manifest.json".into(), sha256_hex(&manifest_bytes));
        checksums.insert("map.csv".into(), sha256_hex(&map_bytes));
        checksums.insert("vectors.f32".into(), sha256_hex(&vector_bytes));
        checksums.insert("notes.jsonl".into(), sha256_hex(&notes_bytes));
        let checksums_bytes = serde_json::to_vec_pretty(&checksums)?;

        let mut files: Vec<(String, Vec<u8>)> = vec![
            ("manifest.json".into(), manifest_bytes),
            ("map.csv".into(), map_bytes),
            ("vectors.f32".into(), vector_bytes),
            ("notes.jsonl".into(), notes_bytes),
            ("checksums.json".into(), checksums_bytes),
        ];
        debug_assert_eq!(
            files.iter().map(|(n, _)| n.as_str()).collect::<Vec<_>>(),
            CANONICAL_FILE_ORDER
        );

        if let Some(keyring) = keyring {
            let mut message = Vec::new();
            for (_, bytes) in &files {
                message.extend_from_slice(bytes);
            }
            let signature = keyring.sign(&message);
            files.push(("signature.bin".into(), signature.to_vec()));
            files.push(("publickey.der".into(), keyring.public_key_der()));
            debug!(key_id = %keyring.key_id(), "bundle signed");
        }

        Ok(files)
    }

    /// Write as a bundle directory, atomically (temp dir then rename).
    pub fn write_dir(mut self, path: &Path, keyring: Option<&KeyRing>) -> Result<BundleManifest> {
        let files = self.assemble(keyring)?;

        let staging = path.with_extension("smemctx.partial");
        if staging.exists() {
            std::fs::remove_dir_all(&staging)?;
        }
        std::fs::create_dir_all(&staging)?;
        for (name, bytes) in &files {
            std::fs::write(staging.join(name), bytes)?;
        }
        if path.exists() {
            std::fs::remove_dir_all(path)?;
        }
        std::fs::rename(&staging, path)?;

        info!(
            path = %path.display(),
            chunks = self.rows.len(),
            notes = self.notes.len(),
            vectors = self.vectors.len(),
            "bundle exported"
        );
        Ok(self.manifest)
    }

    /// Write as a single ZIP file.
    pub fn write_zip(mut self, path: &Path, keyring: Option<&KeyRing>) -> Result<BundleManifest> {
        let files = self.assemble(keyring)?;

        let file = std::fs::File::create(path)?;
        let mut zip = ZipWriter::new(file);
        let options: FileOptions<'_, ()> = FileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .unix_permissions(0o644);
        for (name, bytes) in &files {
            zip.start_file(name.as_str(), options)?;
            zip.write_all(bytes)?;
        }
        zip.finish()?;

        info!(path = %path.display(), chunks = self.rows.len(), "zipped bundle exported");
        Ok(self.manifest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sm_common::ProjectLayout;
    use tempfile::TempDir;

    fn row(id: i64) -> MapRow {
        MapRow {
            id,
            file: format!("src/f{id}.rs"),
            lang: "rust".into(),
            line_start: 1,
            line_end: 10,
            symbol: String::new(),
            symbol_type: String::new(),
            timestamp: "2026-08-01T00:00:00Z".into(),
            chunk_sha256: "c".repeat(64),
        }
    }

    #[test]
    fn test_write_dir_layout() {
        let tmp = TempDir::new().unwrap();
        let out = tmp.path().join("bundle.smemctx");

        let mut writer = BundleWriter::new(BundleType::Code);
        writer.add_chunk(row(1), Some(vec![1.0, 0.0])).unwrap();
        writer.add_chunk(row(2), Some(vec![0.0, 1.0])).unwrap();
        let manifest = writer.write_dir(&out, None).unwrap();

        assert_eq!(manifest.count, 2);
        assert_eq!(manifest.vectors, VectorsInfo { dim: 2, count: 2 });
        for name in CANONICAL_FILE_ORDER {
            assert!(out.join(name).exists(), "{name} missing");
        }
        assert!(!out.join("signature.bin").exists());

        let vectors = std::fs::read(out.join("vectors.f32")).unwrap();
        assert_eq!(vectors.len(), 2 * 2 * 4);
    }

    #[test]
    fn test_empty_bundle_rejected() {
        let tmp = TempDir::new().unwrap();
        let writer = BundleWriter::new(BundleType::Code);
        let err = writer
            .write_dir(&tmp.path().join("b.smemctx"), None)
            .unwrap_err();
        assert!(matches!(err, BundleError::EmptyBundle));
    }

    #[test]
    fn test_vector_dim_mismatch_rejected() {
        let mut writer = BundleWriter::new(BundleType::Code);
        writer.add_chunk(row(1), Some(vec![1.0, 0.0])).unwrap();
        let err = writer.add_chunk(row(2), Some(vec![1.0])).unwrap_err();
        assert!(matches!(err, BundleError::VectorShape(_)));
    }

    #[test]
    fn test_signed_bundle_has_signature_files() {
        let tmp = TempDir::new().unwrap();
        let layout = ProjectLayout::new(tmp.path());
        layout.ensure().unwrap();
        let keyring = KeyRing::load_or_create(&layout).unwrap();

        let out = tmp.path().join("bundle.smemctx");
        let mut writer = BundleWriter::new(BundleType::Notes);
        writer.add_note(serde_json::json!({"content": "note one"}));
        let manifest = writer.write_dir(&out, Some(&keyring)).unwrap();

        assert_eq!(manifest.key_id.as_deref(), Some(keyring.key_id().as_str()));
        assert!(out.join("signature.bin").exists());
        assert_eq!(std::fs::read(out.join("signature.bin")).unwrap().len(), 64);
        assert!(out.join("publickey.der").exists());
    }

    #[test]
    fn test_write_zip_magic() {
        let tmp = TempDir::new().unwrap();
        let out = tmp.path().join("bundle.smemctx.zip");
        let mut writer = BundleWriter::new(BundleType::Code);
        writer.add_chunk(row(1), None).unwrap();
        writer.write_zip(&out, None).unwrap();

        let bytes = std::fs::read(&out).unwrap();
        assert_eq!(&bytes[0..2], b"PK");
    }
}
