//! Export/import wiring between storage and the bundle codec.
//!
//! Chunk text never enters a bundle; the map row + vector is the portable
//! form. Import order is fixed: checksums (exit 4), signature (exit 3),
//! then ingest.

use std::path::Path;

use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use sm_bundle::{BundleContents, BundleReader, BundleType, BundleWriter, MapRow, SignatureState};
use sm_common::{Error, Result};
use sm_storage::{CodeChunkMeta, MemoryType, Metadata, NewMemory};

use crate::context::ProjectContext;

/// Export parameters after flag/policy resolution.
#[derive(Debug, Clone)]
pub struct ExportOptions {
    pub bundle_type: BundleType,
    pub sign: bool,
    pub no_sign: bool,
    pub zip: bool,
}

/// Export outcome for the receipt.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportReport {
    pub chunks: usize,
    pub notes: usize,
    pub vectors: usize,
    pub signed: bool,
    pub key_id: Option<String>,
}

/// Whether this export must be signed, combining caller flags with
/// policy. `forceSignedExports` overrides `--no-sign`.
pub fn effective_sign(ctx: &ProjectContext, sign: bool, no_sign: bool) -> bool {
    if ctx.policy.force_signed_exports {
        if no_sign {
            warn!("--no-sign overridden by policy forceSignedExports");
        }
        return true;
    }
    if no_sign {
        return false;
    }
    sign || ctx.policy.sign_exports
}

/// Export memories to a bundle at `out`.
pub fn export_context(
    ctx: &mut ProjectContext,
    out: &Path,
    opts: &ExportOptions,
) -> Result<ExportReport> {
    let mut writer = BundleWriter::new(opts.bundle_type);
    let mut vectors = 0usize;

    if matches!(opts.bundle_type, BundleType::Code | BundleType::Mixed) {
        let store = ctx.store()?.clone();
        for memory in store.list_memories_by_type(&MemoryType::Code)? {
            let Some(meta) = memory.metadata.as_code() else {
                continue;
            };
            let vector = store.get_vector(memory.id)?;
            if vector.is_some() {
                vectors += 1;
            }
            writer
                .add_chunk(
                    MapRow {
                        id: memory.id,
                        file: meta.file.clone(),
                        lang: meta.language.clone(),
                        line_start: meta.line_start,
                        line_end: meta.line_end,
                        symbol: meta.symbol.clone().unwrap_or_default(),
                        symbol_type: meta.symbol_type.clone().unwrap_or_default(),
                        timestamp: memory.created_at.to_rfc3339(),
                        chunk_sha256: meta.content_sha.clone(),
                    },
                    vector,
                )
                .map_err(Error::from)?;
        }
    }

    if matches!(opts.bundle_type, BundleType::Notes | BundleType::Mixed) {
        let store = ctx.store()?.clone();
        for memory in store.list_non_code_memories()? {
            let metadata = match &memory.metadata {
                Metadata::General(map) => serde_json::Value::Object(map.clone()),
                Metadata::Code(_) => continue,
            };
            writer.add_note(json!({
                "content": memory.content,
                "context": memory.context,
                "type": memory.kind.as_str(),
                "tags": memory.tags,
                "metadata": metadata,
                "createdAt": memory.created_at.to_rfc3339(),
            }));
        }
    }

    let signed = effective_sign(ctx, opts.sign, opts.no_sign);
    let keyring = if signed { Some(ctx.keyring()?) } else { None };

    let chunks = writer.chunk_count();
    let notes = writer.note_count();
    let manifest = if opts.zip {
        writer.write_zip(out, keyring.as_ref()).map_err(Error::from)?
    } else {
        writer.write_dir(out, keyring.as_ref()).map_err(Error::from)?
    };

    info!(out = %out.display(), chunks, notes, signed, "context exported");
    Ok(ExportReport {
        chunks,
        notes,
        vectors,
        signed,
        key_id: manifest.key_id,
    })
}

/// Import outcome for the receipt.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportReport {
    pub chunks: usize,
    pub notes: usize,
    pub vectors: usize,
    pub signer_key_id: Option<String>,
}

/// Import a bundle at `path`.
///
/// With `requireSignedContext` set, an unsigned bundle imports only with
/// the explicit `--allow-unsigned` override backed by a live trust
/// token; the token is consumed.
pub fn import_context(
    ctx: &mut ProjectContext,
    path: &Path,
    allow_unsigned: bool,
) -> Result<ImportReport> {
    let reader = BundleReader::open(path).map_err(Error::from)?;

    // Checksums first: tampering is exit 4 even on signed bundles.
    reader.verify_checksums().map_err(Error::from)?;

    let signature = reader.verify_signature().map_err(Error::from)?;
    let signer_key_id = match &signature {
        SignatureState::Valid { key_id } => Some(key_id.clone()),
        SignatureState::Unsigned => {
            if ctx.policy.require_signed_context {
                let overridden = allow_unsigned && ctx.trust_tokens()?.consume("import-context")?;
                if !overridden {
                    return Err(Error::SignatureRequired(
                        "policy requires signed context; pass --allow-unsigned with a trust token"
                            .to_string(),
                    ));
                }
                info!("unsigned import allowed by trust token");
            }
            None
        }
    };

    let contents = reader.parse().map_err(Error::from)?;
    let report = ingest(ctx, &contents, signer_key_id)?;
    info!(
        chunks = report.chunks,
        notes = report.notes,
        vectors = report.vectors,
        "context imported"
    );
    Ok(report)
}

fn ingest(
    ctx: &mut ProjectContext,
    contents: &BundleContents,
    signer_key_id: Option<String>,
) -> Result<ImportReport> {
    let store = ctx.store()?.clone();
    let mut report = ImportReport {
        chunks: 0,
        notes: 0,
        vectors: 0,
        signer_key_id,
    };

    // Vectors align with rows positionally; when some rows were exported
    // vectorless the payload covers a prefix and the tail goes without.
    let aligned = contents.vectors.len() == contents.rows.len();
    let mut vector_iter = contents.vectors.iter();

    for (i, row) in contents.rows.iter().enumerate() {
        let content = format!(
            "{}:{}-{} {}\n[chunk {}]",
            row.file,
            row.line_start,
            row.line_end,
            if row.symbol.is_empty() { "(no symbol)" } else { &row.symbol },
            row.chunk_sha256
        );
        let memory = NewMemory {
            content,
            context: "code".to_string(),
            kind: MemoryType::Code,
            tags: Vec::new(),
            metadata: Metadata::Code(CodeChunkMeta {
                file: row.file.clone(),
                language: row.lang.clone(),
                line_start: row.line_start,
                line_end: row.line_end,
                content_sha: row.chunk_sha256.clone(),
                symbol: (!row.symbol.is_empty()).then(|| row.symbol.clone()),
                symbol_type: (!row.symbol_type.is_empty()).then(|| row.symbol_type.clone()),
                file_digest: None,
                index_strategy: None,
            }),
        };
        let id = store.store_memory(&memory)?;
        report.chunks += 1;

        let vector = if aligned {
            vector_iter.next()
        } else if i < contents.vectors.len() {
            Some(&contents.vectors[i])
        } else {
            None
        };
        if let Some(vec) = vector {
            store.upsert_vector(id, vec)?;
            report.vectors += 1;
        }
    }

    for note in &contents.notes {
        let content = note
            .get("content")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        if content.is_empty() {
            continue;
        }
        let context = note
            .get("context")
            .and_then(|v| v.as_str())
            .unwrap_or("general")
            .to_string();
        let kind = note
            .get("type")
            .and_then(|v| v.as_str())
            .unwrap_or("note");
        let tags: Vec<String> = note
            .get("tags")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();
        let metadata = note
            .get("metadata")
            .and_then(|v| v.as_object())
            .cloned()
            .unwrap_or_default();

        store.store_memory(&NewMemory {
            content,
            context,
            kind: MemoryType::from(kind),
            tags,
            metadata: Metadata::General(metadata),
        })?;
        report.notes += 1;
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sm_storage::SearchOptions;
    use tempfile::TempDir;

    fn seeded_ctx(tmp: &TempDir) -> ProjectContext {
        std::fs::create_dir_all(tmp.path().join("src")).unwrap();
        std::fs::write(
            tmp.path().join("src/lib.rs"),
            "pub fn alpha() {}\n\npub fn beta() {}\n",
        )
        .unwrap();
        let mut ctx =
            ProjectContext::open(tmp.path().to_path_buf(), false, false, false).unwrap();
        crate::service::reindex_single_file(&mut ctx, "src/lib.rs", true, 200).unwrap();
        ctx.store()
            .unwrap()
            .store_memory(&NewMemory::note("release checklist note", "notes"))
            .unwrap();
        ctx
    }

    fn chunk_keys(ctx: &mut ProjectContext) -> Vec<(String, u32, u32, String)> {
        let mut keys: Vec<(String, u32, u32, String)> = ctx
            .store()
            .unwrap()
            .list_memories_by_type(&MemoryType::Code)
            .unwrap()
            .iter()
            .map(|m| {
                let meta = m.metadata.as_code().unwrap();
                (
                    meta.file.clone(),
                    meta.line_start,
                    meta.line_end,
                    meta.content_sha.clone(),
                )
            })
            .collect();
        keys.sort();
        keys
    }

    #[test]
    fn test_export_import_preserves_chunk_multiset() {
        let tmp = TempDir::new().unwrap();
        let mut ctx = seeded_ctx(&tmp);
        let exported_keys = chunk_keys(&mut ctx);

        let out = tmp.path().join("bundle.smemctx");
        let report = export_context(
            &mut ctx,
            &out,
            &ExportOptions {
                bundle_type: BundleType::Mixed,
                sign: false,
                no_sign: true,
                zip: false,
            },
        )
        .unwrap();
        assert_eq!(report.chunks, exported_keys.len());
        assert_eq!(report.vectors, report.chunks);
        assert_eq!(report.notes, 1);

        // Import into a clean project.
        let clean = TempDir::new().unwrap();
        let mut clean_ctx =
            ProjectContext::open(clean.path().to_path_buf(), false, false, false).unwrap();
        let imported = import_context(&mut clean_ctx, &out, false).unwrap();
        assert_eq!(imported.chunks, exported_keys.len());
        assert_eq!(imported.vectors, report.vectors);
        assert_eq!(imported.notes, 1);

        assert_eq!(chunk_keys(&mut clean_ctx), exported_keys);

        // The imported note is searchable.
        let hits = clean_ctx
            .store()
            .unwrap()
            .search_memories("checklist", &SearchOptions::default())
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn test_signed_export_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let mut ctx = seeded_ctx(&tmp);
        let out = tmp.path().join("bundle.smemctx");
        let report = export_context(
            &mut ctx,
            &out,
            &ExportOptions {
                bundle_type: BundleType::Code,
                sign: true,
                no_sign: false,
                zip: false,
            },
        )
        .unwrap();
        assert!(report.signed);
        assert!(report.key_id.is_some());

        let clean = TempDir::new().unwrap();
        let mut clean_ctx =
            ProjectContext::open(clean.path().to_path_buf(), false, false, false).unwrap();
        let imported = import_context(&mut clean_ctx, &out, false).unwrap();
        assert_eq!(imported.signer_key_id, report.key_id);
    }

    #[test]
    fn test_unsigned_import_denied_when_required() {
        let tmp = TempDir::new().unwrap();
        let mut ctx = seeded_ctx(&tmp);
        let out = tmp.path().join("bundle.smemctx");
        export_context(
            &mut ctx,
            &out,
            &ExportOptions {
                bundle_type: BundleType::Code,
                sign: false,
                no_sign: true,
                zip: false,
            },
        )
        .unwrap();

        let clean = TempDir::new().unwrap();
        let mut clean_ctx =
            ProjectContext::open(clean.path().to_path_buf(), false, false, false).unwrap();
        clean_ctx.policy.require_signed_context = true;

        let err = import_context(&mut clean_ctx, &out, false).unwrap_err();
        assert_eq!(err.exit_code(), 3);

        // --allow-unsigned without a token is still denied.
        let err = import_context(&mut clean_ctx, &out, true).unwrap_err();
        assert_eq!(err.exit_code(), 3);

        // With a trust token it goes through, once.
        clean_ctx
            .trust_tokens()
            .unwrap()
            .grant("import-context", 1)
            .unwrap();
        import_context(&mut clean_ctx, &out, true).unwrap();
        let err = import_context(&mut clean_ctx, &out, true).unwrap_err();
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn test_tampered_vectors_exit_4_before_signature() {
        let tmp = TempDir::new().unwrap();
        let mut ctx = seeded_ctx(&tmp);
        let out = tmp.path().join("bundle.smemctx");
        export_context(
            &mut ctx,
            &out,
            &ExportOptions {
                bundle_type: BundleType::Code,
                sign: true,
                no_sign: false,
                zip: false,
            },
        )
        .unwrap();

        let mut bytes = std::fs::read(out.join("vectors.f32")).unwrap();
        bytes[0] ^= 0xff;
        std::fs::write(out.join("vectors.f32"), &bytes).unwrap();

        let clean = TempDir::new().unwrap();
        let mut clean_ctx =
            ProjectContext::open(clean.path().to_path_buf(), false, false, false).unwrap();
        let err = import_context(&mut clean_ctx, &out, false).unwrap_err();
        assert_eq!(err.exit_code(), 4);
        assert!(err.to_string().contains("checksum mismatch"));
    }

    #[test]
    fn test_force_signed_exports_overrides_no_sign() {
        let tmp = TempDir::new().unwrap();
        let mut ctx = seeded_ctx(&tmp);
        ctx.policy.force_signed_exports = true;
        assert!(effective_sign(&ctx, false, true));

        let out = tmp.path().join("forced.smemctx");
        let report = export_context(
            &mut ctx,
            &out,
            &ExportOptions {
                bundle_type: BundleType::Code,
                sign: false,
                no_sign: true,
                zip: false,
            },
        )
        .unwrap();
        assert!(report.signed);
        assert!(out.join("signature.bin").exists());
    }

    #[test]
    fn test_legacy_agmctx_extension_imports() {
        let tmp = TempDir::new().unwrap();
        let mut ctx = seeded_ctx(&tmp);
        let out = tmp.path().join("bundle.agmctx");
        export_context(
            &mut ctx,
            &out,
            &ExportOptions {
                bundle_type: BundleType::Code,
                sign: false,
                no_sign: true,
                zip: false,
            },
        )
        .unwrap();

        let clean = TempDir::new().unwrap();
        let mut clean_ctx =
            ProjectContext::open(clean.path().to_path_buf(), false, false, false).unwrap();
        let report = import_context(&mut clean_ctx, &out, false).unwrap();
        assert!(report.chunks > 0);
    }
}
