//! Watch mode: debounced incremental reindexing with rename detection.
//!
//! Filesystem events are debounced (default 400 ms) and processed per
//! file. A deletion remembers the file's digest for a short window so a
//! following add with the same digest is treated as a rename: chunk
//! metadata and the digest row are rewritten in place, no rechunking.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use notify::{Event, EventKind, RecursiveMode, Watcher};
use tracing::{debug, info, warn};

use sm_common::{Error, Result};
use sm_index::{file_digest, WalkOptions};

use crate::context::ProjectContext;
use crate::service::{reindex_single_file, IndexOptions};

/// How long a deleted file's digest is remembered for rename detection.
pub const RENAME_WINDOW: Duration = Duration::from_secs(5);

/// Watch summary counters (exposed for the final receipt).
#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct WatchStats {
    pub indexed: usize,
    pub renamed: usize,
    pub removed: usize,
    pub unchanged: usize,
}

/// Watch the configured root until `stop` is set.
pub fn watch_code(
    ctx: &mut ProjectContext,
    opts: &IndexOptions,
    debounce: Duration,
    stop: &AtomicBool,
) -> Result<WatchStats> {
    let walk_root = ctx.layout.root().join(&opts.path);
    let selector = WalkOptions {
        include: opts.include.clone(),
        exclude: opts.exclude.clone(),
    }
    .selector()?;

    let (tx, rx) = mpsc::channel::<notify::Result<Event>>();
    let mut watcher = notify::recommended_watcher(move |event| {
        let _ = tx.send(event);
    })
    .map_err(|e| Error::internal(format!("watcher init: {e}")))?;
    watcher
        .watch(&walk_root, RecursiveMode::Recursive)
        .map_err(|e| Error::internal(format!("watcher start: {e}")))?;
    info!(root = %walk_root.display(), "watching for changes");

    let mut stats = WatchStats::default();
    // rel path -> last event kind in this debounce window
    let mut pending: HashMap<String, PendingKind> = HashMap::new();
    // digest -> (old rel path, when deleted)
    let mut recently_deleted: HashMap<String, (String, Instant)> = HashMap::new();
    let mut quiet_since: Option<Instant> = None;

    while !stop.load(Ordering::Relaxed) {
        match rx.recv_timeout(debounce.min(Duration::from_millis(100))) {
            Ok(Ok(event)) => {
                if let Some((rel, kind)) = classify(ctx, &event) {
                    if selector.matches(&rel) {
                        pending.insert(rel, kind);
                        quiet_since = Some(Instant::now());
                    }
                }
            }
            Ok(Err(e)) => warn!(error = %e, "watch event error"),
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }

        let quiet_elapsed = quiet_since
            .map(|t| t.elapsed() >= debounce)
            .unwrap_or(false);
        if quiet_elapsed && !pending.is_empty() {
            let batch: Vec<(String, PendingKind)> = pending.drain().collect();
            quiet_since = None;
            for (rel, kind) in batch {
                if let Err(e) = process_one(ctx, opts, &rel, kind, &mut recently_deleted, &mut stats)
                {
                    warn!(file = %rel, error = %e, "watch update failed");
                }
            }
        }

        expire_deletions(ctx, &mut recently_deleted, &mut stats);
    }

    // Flush anything that was deleted right before shutdown.
    for (_, (rel, _)) in recently_deleted.drain() {
        forget_file(ctx, &rel, &mut stats);
    }
    Ok(stats)
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum PendingKind {
    Upsert,
    Remove,
}

fn classify(ctx: &ProjectContext, event: &Event) -> Option<(String, PendingKind)> {
    let kind = match event.kind {
        EventKind::Create(_) | EventKind::Modify(_) => PendingKind::Upsert,
        EventKind::Remove(_) => PendingKind::Remove,
        _ => return None,
    };
    let path: &PathBuf = event.paths.first()?;
    // Never react to our own data directory.
    let rel = ctx.layout.relative_to_root(path)?;
    if rel.starts_with(".securamem") || rel.starts_with(".antigoldfishmode") {
        return None;
    }
    Some((rel, kind))
}

fn process_one(
    ctx: &mut ProjectContext,
    opts: &IndexOptions,
    rel: &str,
    kind: PendingKind,
    recently_deleted: &mut HashMap<String, (String, Instant)>,
    stats: &mut WatchStats,
) -> Result<()> {
    match kind {
        PendingKind::Remove => {
            // Defer the actual wipe for the rename window.
            if let Some(digest) = ctx.store()?.get_file_digest(rel)? {
                recently_deleted.insert(digest, (rel.to_string(), Instant::now()));
                debug!(file = %rel, "deletion deferred for rename window");
            } else {
                forget_file(ctx, rel, stats);
            }
            Ok(())
        }
        PendingKind::Upsert => {
            let abs = ctx.layout.root().join(rel);
            if !abs.is_file() {
                return Ok(());
            }
            let digest = file_digest(&abs)?;

            // Unchanged content: skip entirely.
            if ctx.store()?.get_file_digest(rel)?.as_deref() == Some(digest.as_str()) {
                stats.unchanged += 1;
                return Ok(());
            }

            // Same digest as a recent deletion: it moved. Rewrite the
            // path in place and keep the chunks.
            if let Some((old_rel, _)) = recently_deleted.remove(&digest) {
                ctx.store()?.update_code_file_path(&old_rel, rel)?;
                ctx.store()?.move_file_digest(&old_rel, rel)?;
                stats.renamed += 1;
                info!(from = %old_rel, to = %rel, "rename detected, chunks kept");
                return Ok(());
            }

            let chunks = reindex_single_file(ctx, rel, opts.symbols, opts.max_chunk)?;
            stats.indexed += chunks;
            Ok(())
        }
    }
}

/// Wipe chunks and digest for files whose rename window expired.
fn expire_deletions(
    ctx: &mut ProjectContext,
    recently_deleted: &mut HashMap<String, (String, Instant)>,
    stats: &mut WatchStats,
) {
    let expired: Vec<String> = recently_deleted
        .iter()
        .filter(|(_, (_, at))| at.elapsed() > RENAME_WINDOW)
        .map(|(digest, _)| digest.clone())
        .collect();
    for digest in expired {
        if let Some((rel, _)) = recently_deleted.remove(&digest) {
            forget_file(ctx, &rel, stats);
        }
    }
}

fn forget_file(ctx: &mut ProjectContext, rel: &str, stats: &mut WatchStats) {
    match ctx.store().and_then(|s| {
        s.delete_code_by_file(rel)?;
        s.delete_file_digest(rel)
    }) {
        Ok(_) => {
            stats.removed += 1;
            debug!(file = %rel, "deleted file forgotten");
        }
        Err(e) => warn!(file = %rel, error = %e, "failed to forget deleted file"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sm_storage::MemoryType;
    use tempfile::TempDir;

    // The watcher loop itself needs a live filesystem watcher; the
    // rename/deferral mechanics are covered here through process_one.

    fn ctx_with_file(tmp: &TempDir) -> ProjectContext {
        std::fs::create_dir_all(tmp.path().join("src")).unwrap();
        std::fs::write(tmp.path().join("src/a.rs"), "pub fn a() {}\n").unwrap();
        let mut ctx =
            ProjectContext::open(tmp.path().to_path_buf(), false, false, false).unwrap();
        reindex_single_file(&mut ctx, "src/a.rs", false, 200).unwrap();
        ctx
    }

    #[test]
    fn test_rename_keeps_chunks() {
        let tmp = TempDir::new().unwrap();
        let mut ctx = ctx_with_file(&tmp);
        let opts = IndexOptions::default();
        let mut deleted = HashMap::new();
        let mut stats = WatchStats::default();

        // Simulate unlink then add of the same content elsewhere.
        std::fs::rename(tmp.path().join("src/a.rs"), tmp.path().join("src/b.rs")).unwrap();
        process_one(
            &mut ctx,
            &opts,
            "src/a.rs",
            PendingKind::Remove,
            &mut deleted,
            &mut stats,
        )
        .unwrap();
        assert_eq!(deleted.len(), 1);

        process_one(
            &mut ctx,
            &opts,
            "src/b.rs",
            PendingKind::Upsert,
            &mut deleted,
            &mut stats,
        )
        .unwrap();
        assert_eq!(stats.renamed, 1);
        assert!(deleted.is_empty());

        let code = ctx
            .store()
            .unwrap()
            .list_memories_by_type(&MemoryType::Code)
            .unwrap();
        assert_eq!(code.len(), 1);
        assert_eq!(code[0].metadata.as_code().unwrap().file, "src/b.rs");
        assert_eq!(
            ctx.store().unwrap().get_file_digest("src/a.rs").unwrap(),
            None
        );
        assert!(ctx
            .store()
            .unwrap()
            .get_file_digest("src/b.rs")
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_unchanged_file_is_skipped() {
        let tmp = TempDir::new().unwrap();
        let mut ctx = ctx_with_file(&tmp);
        let opts = IndexOptions::default();
        let mut deleted = HashMap::new();
        let mut stats = WatchStats::default();

        process_one(
            &mut ctx,
            &opts,
            "src/a.rs",
            PendingKind::Upsert,
            &mut deleted,
            &mut stats,
        )
        .unwrap();
        assert_eq!(stats.unchanged, 1);
        assert_eq!(stats.indexed, 0);
    }

    #[test]
    fn test_changed_file_is_reindexed() {
        let tmp = TempDir::new().unwrap();
        let mut ctx = ctx_with_file(&tmp);
        let opts = IndexOptions::default();
        let mut deleted = HashMap::new();
        let mut stats = WatchStats::default();

        std::fs::write(tmp.path().join("src/a.rs"), "pub fn changed() {}\n").unwrap();
        process_one(
            &mut ctx,
            &opts,
            "src/a.rs",
            PendingKind::Upsert,
            &mut deleted,
            &mut stats,
        )
        .unwrap();
        assert!(stats.indexed > 0);
    }

    #[test]
    fn test_plain_delete_forgets_file() {
        let tmp = TempDir::new().unwrap();
        let mut ctx = ctx_with_file(&tmp);
        let opts = IndexOptions::default();
        let mut deleted = HashMap::new();
        let mut stats = WatchStats::default();

        std::fs::remove_file(tmp.path().join("src/a.rs")).unwrap();
        process_one(
            &mut ctx,
            &opts,
            "src/a.rs",
            PendingKind::Remove,
            &mut deleted,
            &mut stats,
        )
        .unwrap();

        // Window not yet expired: chunks still present.
        assert_eq!(
            ctx.store()
                .unwrap()
                .list_memories_by_type(&MemoryType::Code)
                .unwrap()
                .len(),
            1
        );

        // Force expiry.
        for (_, at) in deleted.values_mut() {
            *at = Instant::now() - RENAME_WINDOW - Duration::from_secs(1);
        }
        expire_deletions(&mut ctx, &mut deleted, &mut stats);
        assert_eq!(stats.removed, 1);
        assert!(ctx
            .store()
            .unwrap()
            .list_memories_by_type(&MemoryType::Code)
            .unwrap()
            .is_empty());
    }
}
