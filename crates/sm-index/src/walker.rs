//! Candidate-file enumeration with include/exclude globs.
//!
//! Vendored and build directories are excluded by default and pruned at
//! descent time, so `node_modules` trees are never walked. Oversized
//! files are skipped with a warning rather than chunked; the bound keeps
//! memory flat on pathological inputs.

use std::path::Path;

use globset::{Glob, GlobSet, GlobSetBuilder};
use tracing::warn;
use walkdir::WalkDir;

use sm_common::{paths::to_slash, Error, Result};

/// Glob patterns excluded from every walk.
pub const DEFAULT_EXCLUDES: &[&str] = &[
    "**/node_modules/**",
    "**/.git/**",
    "**/dist/**",
    "**/build/**",
    "**/.next/**",
    "**/.cache/**",
    "**/.securamem/**",
    "**/.antigoldfishmode/**",
];

/// Directory names pruned at descent time (the glob forms above, minus
/// the wildcards).
const PRUNED_DIRS: &[&str] = &[
    "node_modules",
    ".git",
    "dist",
    "build",
    ".next",
    ".cache",
    ".securamem",
    ".antigoldfishmode",
];

/// Files larger than this are skipped (documented no-OOM bound).
pub const MAX_FILE_BYTES: u64 = 8 * 1024 * 1024;

/// Walk selectors.
#[derive(Debug, Clone, Default)]
pub struct WalkOptions {
    /// Include globs; empty means every file.
    pub include: Vec<String>,
    /// Extra exclude globs on top of [`DEFAULT_EXCLUDES`].
    pub exclude: Vec<String>,
}

impl WalkOptions {
    fn include_set(&self) -> Result<Option<GlobSet>> {
        if self.include.is_empty() {
            return Ok(None);
        }
        build_globset(&self.include).map(Some)
    }

    fn exclude_set(&self) -> Result<GlobSet> {
        let mut patterns: Vec<String> =
            DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect();
        patterns.extend(self.exclude.iter().cloned());
        build_globset(&patterns)
    }

    /// Compile the selectors once for per-path checks (watch mode).
    pub fn selector(&self) -> Result<PathSelector> {
        Ok(PathSelector {
            include: self.include_set()?,
            exclude: self.exclude_set()?,
        })
    }
}

/// Compiled include/exclude matcher over root-relative slash paths.
pub struct PathSelector {
    include: Option<GlobSet>,
    exclude: GlobSet,
}

impl PathSelector {
    pub fn matches(&self, rel_slash: &str) -> bool {
        if self.exclude.is_match(rel_slash) {
            return false;
        }
        match &self.include {
            Some(include) => include.is_match(rel_slash),
            None => true,
        }
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| Error::InputInvalid(format!("bad glob '{pattern}': {e}")))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| Error::InputInvalid(format!("glob set: {e}")))
}

/// Enumerate files under `root` matching the selectors.
///
/// Returns root-relative forward-slash paths, sorted for deterministic
/// indexing order.
pub fn walk(root: &Path, opts: &WalkOptions) -> Result<Vec<String>> {
    let include = opts.include_set()?;
    let exclude = opts.exclude_set()?;

    let mut files = Vec::new();
    let walker = WalkDir::new(root).follow_links(false).into_iter();
    for entry in walker.filter_entry(|e| {
        !(e.file_type().is_dir()
            && e.file_name()
                .to_str()
                .map(|n| PRUNED_DIRS.contains(&n))
                .unwrap_or(false))
    }) {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "skipping unreadable entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(root) else {
            continue;
        };
        let rel_slash = to_slash(rel);
        if exclude.is_match(&rel_slash) {
            continue;
        }
        if let Some(include) = &include {
            if !include.is_match(&rel_slash) {
                continue;
            }
        }
        match entry.metadata() {
            Ok(meta) if meta.len() > MAX_FILE_BYTES => {
                warn!(file = %rel_slash, bytes = meta.len(), "file exceeds size bound, skipped");
                continue;
            }
            Err(e) => {
                warn!(file = %rel_slash, error = %e, "stat failed, skipped");
                continue;
            }
            _ => {}
        }
        files.push(rel_slash);
    }
    files.sort();
    Ok(files)
}
