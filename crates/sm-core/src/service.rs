//! Indexing service: index-code, reindex-file, reindex-folder.
//!
//! Each file is one transaction: previous chunks for every path spelling
//! are wiped, new chunks inserted, and the file digest refreshed together.
//! Cancellation is honored at file boundaries, so an interrupted run
//! leaves untouched files with their prior chunks and digests.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use sm_common::{paths::to_slash, Error, Result};
use sm_index::{chunk_file, file_digest, language_for_path, sha256_hex, walk, ChunkMode, WalkOptions};
use sm_storage::{CodeChunkMeta, IndexStrategy, MemoryType, Metadata, NewMemory};

use crate::context::ProjectContext;

/// Selectors and knobs for an indexing run.
#[derive(Debug, Clone)]
pub struct IndexOptions {
    /// Root to index, relative to the project root.
    pub path: String,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub max_chunk: usize,
    pub symbols: bool,
    /// Skip files whose cached digest matches.
    pub diff: bool,
    /// Request AST-precise chunking.
    pub tree_sitter: bool,
}

impl Default for IndexOptions {
    fn default() -> Self {
        IndexOptions {
            path: ".".to_string(),
            include: Vec::new(),
            exclude: Vec::new(),
            max_chunk: 200,
            symbols: false,
            diff: false,
            tree_sitter: false,
        }
    }
}

impl IndexOptions {
    fn validate(&self) -> Result<()> {
        if self.max_chunk < 1 {
            return Err(Error::InputInvalid(
                "max-chunk must be at least 1 line".to_string(),
            ));
        }
        Ok(())
    }

    /// The chunk mode this run will actually use, and the strategy tag
    /// recorded in metadata. AST chunking degrades to heuristics when no
    /// parser is compiled in.
    fn resolve_mode(&self) -> (ChunkMode, IndexStrategy) {
        if self.tree_sitter {
            debug!("tree-sitter chunking requested; no AST parser built in, using heuristics");
            (ChunkMode::HeuristicSymbols, IndexStrategy::HeuristicSymbols)
        } else if self.symbols {
            (ChunkMode::HeuristicSymbols, IndexStrategy::HeuristicSymbols)
        } else {
            (ChunkMode::Lines, IndexStrategy::LineChunks)
        }
    }
}

/// Outcome of an indexing run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexReport {
    pub saved: usize,
    pub file_count: usize,
    pub skipped: usize,
    pub errors: usize,
    /// Digest over the per-file digests, in walk order.
    pub digest: String,
}

/// Index every candidate file under the configured root.
pub fn index_code(
    ctx: &mut ProjectContext,
    opts: &IndexOptions,
    stop: &AtomicBool,
) -> Result<IndexReport> {
    opts.validate()?;
    let walk_root = ctx.layout.root().join(&opts.path);
    let walk_opts = WalkOptions {
        include: opts.include.clone(),
        exclude: opts.exclude.clone(),
    };
    let files = walk(&walk_root, &walk_opts)?;

    let mut report = IndexReport {
        saved: 0,
        file_count: files.len(),
        skipped: 0,
        errors: 0,
        digest: String::new(),
    };
    let mut run_hasher = Sha256::new();

    for rel in &files {
        if stop.load(Ordering::Relaxed) {
            return Err(Error::Cancelled(format!(
                "indexing interrupted after {} files",
                report.saved
            )));
        }
        match index_one(ctx, &walk_root, rel, opts) {
            Ok(FileOutcome::Indexed { chunks, digest }) => {
                report.saved += chunks;
                run_hasher.update(digest.as_bytes());
            }
            Ok(FileOutcome::Unchanged { digest }) => {
                report.skipped += 1;
                run_hasher.update(digest.as_bytes());
            }
            Err(e) => {
                warn!(file = %rel, error = %e, "file skipped");
                report.errors += 1;
            }
        }
    }

    report.digest = hex::encode(run_hasher.finalize());
    write_digest_mirror(ctx);
    Ok(report)
}

/// Refresh the transient `file-digests.json` mirror of the digest table.
/// Best-effort; the SQLite rows are the source of truth.
fn write_digest_mirror(ctx: &mut ProjectContext) {
    let rows = match ctx.store().and_then(|s| s.list_file_digests(None)) {
        Ok(rows) => rows,
        Err(_) => return,
    };
    let map: std::collections::BTreeMap<&str, &str> = rows
        .iter()
        .map(|(file, digest, _)| (file.as_str(), digest.as_str()))
        .collect();
    if let Ok(json) = serde_json::to_vec_pretty(&map) {
        let _ = std::fs::write(ctx.layout.file_digests_path(), json);
    }
}

enum FileOutcome {
    Indexed { chunks: usize, digest: String },
    Unchanged { digest: String },
}

fn index_one(
    ctx: &mut ProjectContext,
    walk_root: &Path,
    rel: &str,
    opts: &IndexOptions,
) -> Result<FileOutcome> {
    let abs = walk_root.join(rel);
    let repo_rel = ctx
        .layout
        .relative_to_root(&abs)
        .unwrap_or_else(|| rel.to_string());

    let digest = file_digest(&abs)?;
    if opts.diff {
        if let Some(cached) = ctx.store()?.get_file_digest(&repo_rel)? {
            if cached == digest {
                return Ok(FileOutcome::Unchanged { digest });
            }
        }
    }

    let chunks = build_chunks(&abs, &repo_rel, &digest, opts)?;
    let with_vectors = attach_vectors(ctx, chunks);

    // Wipe both the project-relative and walk-root-relative spellings:
    // earlier runs rooted differently may have stored either.
    let mut spellings = vec![repo_rel.clone()];
    if rel != repo_rel {
        spellings.push(rel.to_string());
    }
    let saved = ctx
        .store()?
        .replace_file_chunks(&spellings, &repo_rel, &digest, &with_vectors)?;
    debug!(file = %repo_rel, chunks = saved, "file indexed");
    Ok(FileOutcome::Indexed {
        chunks: saved,
        digest,
    })
}

/// Chunk one file into code memories.
fn build_chunks(
    abs: &Path,
    repo_rel: &str,
    digest: &str,
    opts: &IndexOptions,
) -> Result<Vec<NewMemory>> {
    let bytes = std::fs::read(abs)?;
    let text = String::from_utf8_lossy(&bytes);
    let language = language_for_path(repo_rel);
    let (mode, strategy) = opts.resolve_mode();

    let chunks = chunk_file(repo_rel, language, &text, mode, opts.max_chunk);
    Ok(chunks
        .into_iter()
        .map(|chunk| NewMemory {
            context: "code".to_string(),
            kind: MemoryType::Code,
            tags: Vec::new(),
            metadata: Metadata::Code(CodeChunkMeta {
                file: repo_rel.to_string(),
                language: language.to_string(),
                line_start: chunk.meta.line_start,
                line_end: chunk.meta.line_end,
                content_sha: sha256_hex(chunk.text.as_bytes()),
                symbol: chunk.meta.symbol,
                symbol_type: chunk.meta.symbol_type,
                file_digest: Some(digest.to_string()),
                index_strategy: Some(strategy),
            }),
            content: chunk.text,
        })
        .collect())
}

/// Embedding is best-effort: without a provider the chunks index
/// vectorless and a later reindex can fill vectors in.
fn attach_vectors(
    ctx: &ProjectContext,
    chunks: Vec<NewMemory>,
) -> Vec<(NewMemory, Option<Vec<f32>>)> {
    match ctx.embedder() {
        Some(embedder) => chunks
            .into_iter()
            .map(|m| {
                let vec = embedder.embed(&m.content);
                (m, Some(vec))
            })
            .collect(),
        None => chunks.into_iter().map(|m| (m, None)).collect(),
    }
}

/// Atomic wipe-then-insert reindex of a single file.
pub fn reindex_single_file(
    ctx: &mut ProjectContext,
    file: &str,
    symbols: bool,
    max_chunk: usize,
) -> Result<usize> {
    let opts = IndexOptions {
        symbols,
        max_chunk,
        ..Default::default()
    };
    opts.validate()?;

    let abs = ctx.layout.root().join(file);
    if !abs.is_file() {
        return Err(Error::NotFound(format!("no such file '{file}'")));
    }
    let repo_rel = ctx
        .layout
        .relative_to_root(&abs)
        .unwrap_or_else(|| to_slash(Path::new(file)));
    let digest = file_digest(&abs)?;
    let chunks = build_chunks(&abs, &repo_rel, &digest, &opts)?;
    let with_vectors = attach_vectors(ctx, chunks);
    ctx.store()?
        .replace_file_chunks(&[repo_rel.clone()], &repo_rel, &digest, &with_vectors)
}

/// Per-folder report for `reindex-folder`.
#[derive(Debug, Clone, Serialize)]
pub struct FolderReport {
    pub files: usize,
    pub added: usize,
    pub errors: usize,
}

/// Reindex every file under a folder.
pub fn reindex_folder(
    ctx: &mut ProjectContext,
    folder: &str,
    symbols: bool,
    max_chunk: usize,
) -> Result<FolderReport> {
    let opts = IndexOptions {
        path: folder.to_string(),
        symbols,
        max_chunk,
        ..Default::default()
    };
    opts.validate()?;

    let walk_root = ctx.layout.root().join(folder);
    if !walk_root.is_dir() {
        return Err(Error::NotFound(format!("no such folder '{folder}'")));
    }
    let files = walk(&walk_root, &WalkOptions::default())?;
    let mut report = FolderReport {
        files: files.len(),
        added: 0,
        errors: 0,
    };
    for rel in &files {
        match index_one(ctx, &walk_root, rel, &opts) {
            Ok(FileOutcome::Indexed { chunks, .. }) => report.added += chunks,
            Ok(FileOutcome::Unchanged { .. }) => {}
            Err(e) => {
                warn!(file = %rel, error = %e, "reindex failed");
                report.errors += 1;
            }
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ctx_with_src(tmp: &TempDir) -> ProjectContext {
        let src = tmp.path().join("src");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(
            src.join("lib.rs"),
            "pub fn alpha() -> u32 {\n    1\n}\n\npub fn beta() -> u32 {\n    2\n}\n",
        )
        .unwrap();
        std::fs::write(src.join("notes.txt"), "plain text notes\n").unwrap();
        ProjectContext::open(tmp.path().to_path_buf(), false, false, false).unwrap()
    }

    fn no_stop() -> AtomicBool {
        AtomicBool::new(false)
    }

    #[test]
    fn test_index_code_saves_chunks() {
        let tmp = TempDir::new().unwrap();
        let mut ctx = ctx_with_src(&tmp);
        let report = index_code(&mut ctx, &IndexOptions::default(), &no_stop()).unwrap();
        assert!(report.saved > 0);
        assert_eq!(report.file_count, 2);
        assert_eq!(report.errors, 0);
        assert!(!report.digest.is_empty());

        let code = ctx
            .store()
            .unwrap()
            .list_memories_by_type(&MemoryType::Code)
            .unwrap();
        assert_eq!(code.len(), report.saved);
        let meta = code[0].metadata.as_code().unwrap();
        assert!(meta.file.starts_with("src/") || meta.file == "src/notes.txt");
        assert_eq!(meta.content_sha.len(), 64);
        assert!(meta.line_start <= meta.line_end);
    }

    #[test]
    fn test_diff_mode_second_run_saves_zero() {
        let tmp = TempDir::new().unwrap();
        let mut ctx = ctx_with_src(&tmp);
        let opts = IndexOptions {
            diff: true,
            ..Default::default()
        };
        let first = index_code(&mut ctx, &opts, &no_stop()).unwrap();
        assert!(first.saved > 0);

        let second = index_code(&mut ctx, &opts, &no_stop()).unwrap();
        assert_eq!(second.saved, 0);
        assert_eq!(second.skipped, second.file_count);

        // The stored chunk set is unchanged.
        let count = ctx.store().unwrap().count_memories().unwrap();
        let third = index_code(&mut ctx, &opts, &no_stop()).unwrap();
        assert_eq!(third.saved, 0);
        assert_eq!(ctx.store().unwrap().count_memories().unwrap(), count);
    }

    #[test]
    fn test_diff_mode_reindexes_changed_file() {
        let tmp = TempDir::new().unwrap();
        let mut ctx = ctx_with_src(&tmp);
        let opts = IndexOptions {
            diff: true,
            ..Default::default()
        };
        index_code(&mut ctx, &opts, &no_stop()).unwrap();

        std::fs::write(
            tmp.path().join("src/lib.rs"),
            "pub fn gamma() -> u32 {\n    3\n}\n",
        )
        .unwrap();
        let second = index_code(&mut ctx, &opts, &no_stop()).unwrap();
        assert!(second.saved > 0);
        assert_eq!(second.skipped, 1); // notes.txt unchanged
    }

    #[test]
    fn test_max_chunk_zero_rejected() {
        let tmp = TempDir::new().unwrap();
        let mut ctx = ctx_with_src(&tmp);
        let opts = IndexOptions {
            max_chunk: 0,
            ..Default::default()
        };
        let err = index_code(&mut ctx, &opts, &no_stop()).unwrap_err();
        assert_eq!(err.kind(), sm_common::ErrorKind::InputInvalid);
    }

    #[test]
    fn test_include_exclude_selectors() {
        let tmp = TempDir::new().unwrap();
        let mut ctx = ctx_with_src(&tmp);
        let opts = IndexOptions {
            include: vec!["**/*.rs".into()],
            ..Default::default()
        };
        let report = index_code(&mut ctx, &opts, &no_stop()).unwrap();
        assert_eq!(report.file_count, 1);
    }

    #[test]
    fn test_reindex_single_file_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let mut ctx = ctx_with_src(&tmp);
        let first = reindex_single_file(&mut ctx, "src/lib.rs", true, 200).unwrap();
        let second = reindex_single_file(&mut ctx, "src/lib.rs", true, 200).unwrap();
        assert_eq!(first, second);

        let code = ctx
            .store()
            .unwrap()
            .list_memories_by_type(&MemoryType::Code)
            .unwrap();
        assert_eq!(code.len(), first);

        // Digest refreshed to the current file hash.
        let digest = ctx
            .store()
            .unwrap()
            .get_file_digest("src/lib.rs")
            .unwrap()
            .unwrap();
        assert_eq!(
            digest,
            file_digest(&tmp.path().join("src/lib.rs")).unwrap()
        );
    }

    #[test]
    fn test_reindex_missing_file_not_found() {
        let tmp = TempDir::new().unwrap();
        let mut ctx = ctx_with_src(&tmp);
        let err = reindex_single_file(&mut ctx, "src/ghost.rs", false, 200).unwrap_err();
        assert_eq!(err.kind(), sm_common::ErrorKind::NotFound);
    }

    #[test]
    fn test_reindex_folder_reports() {
        let tmp = TempDir::new().unwrap();
        let mut ctx = ctx_with_src(&tmp);
        let report = reindex_folder(&mut ctx, "src", false, 200).unwrap();
        assert_eq!(report.files, 2);
        assert!(report.added > 0);
        assert_eq!(report.errors, 0);
    }

    #[test]
    fn test_cancellation_at_file_boundary() {
        let tmp = TempDir::new().unwrap();
        let mut ctx = ctx_with_src(&tmp);
        let stop = AtomicBool::new(true);
        let err = index_code(&mut ctx, &IndexOptions::default(), &stop).unwrap_err();
        assert_eq!(err.kind(), sm_common::ErrorKind::Cancelled);
        // Nothing committed.
        assert_eq!(ctx.store().unwrap().count_memories().unwrap(), 0);
    }

    #[test]
    fn test_symbols_mode_records_strategy() {
        let tmp = TempDir::new().unwrap();
        let mut ctx = ctx_with_src(&tmp);
        let opts = IndexOptions {
            symbols: true,
            include: vec!["**/*.rs".into()],
            ..Default::default()
        };
        index_code(&mut ctx, &opts, &no_stop()).unwrap();
        let code = ctx
            .store()
            .unwrap()
            .list_memories_by_type(&MemoryType::Code)
            .unwrap();
        assert!(code.iter().any(|m| {
            m.metadata.as_code().unwrap().index_strategy == Some(IndexStrategy::HeuristicSymbols)
        }));
        assert!(code
            .iter()
            .any(|m| m.metadata.as_code().unwrap().symbol.as_deref() == Some("alpha")));
    }
}
