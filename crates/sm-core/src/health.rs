//! Health rollups and garbage collection.
//!
//! Health aggregates storage counters with receipt-derived metrics over
//! a trailing window: search latency percentiles and per-command error
//! rates. GC removes orphan vectors, digest rows for vanished files, and
//! reclaims storage with VACUUM.

use std::collections::BTreeMap;

use chrono::{Duration, Utc};
use serde::Serialize;
use tracing::info;

use sm_audit::Receipt;
use sm_common::Result;

use crate::context::ProjectContext;

/// Commands whose receipts feed the latency percentiles.
const SEARCH_COMMANDS: &[&str] = &["recall", "search-code"];

/// Health report payload.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub memory_count: u64,
    pub db_size_bytes: u64,
    pub vector_backend: &'static str,
    pub vector_count: u64,
    pub vector_dim: Option<usize>,
    pub file_digest_count: u64,
    pub window_days: u32,
    pub search_latency_ms_p50: Option<u64>,
    pub search_latency_ms_p95: Option<u64>,
    /// Per-command error rate over the window, in [0, 1].
    pub error_rates: BTreeMap<String, f64>,
}

/// Build the health report over the last `since_days` days of receipts.
pub fn health(ctx: &mut ProjectContext, since_days: u32) -> Result<HealthReport> {
    let store = ctx.store()?.clone();
    let vector_backend = if store.native_ann_available() {
        "native-ann"
    } else {
        "in-process-cosine"
    };

    let cutoff = Utc::now() - Duration::days(i64::from(since_days));
    let receipts = Receipt::list(&ctx.layout, 10_000)?;
    let windowed: Vec<&Receipt> = receipts.iter().filter(|r| r.start_time >= cutoff).collect();

    let mut search_latencies: Vec<u64> = windowed
        .iter()
        .filter(|r| SEARCH_COMMANDS.contains(&r.command.as_str()))
        .map(|r| {
            (r.end_time - r.start_time)
                .num_milliseconds()
                .max(0) as u64
        })
        .collect();
    search_latencies.sort_unstable();

    let mut totals: BTreeMap<String, (u64, u64)> = BTreeMap::new();
    for receipt in &windowed {
        let entry = totals.entry(receipt.command.clone()).or_insert((0, 0));
        entry.0 += 1;
        if !receipt.success {
            entry.1 += 1;
        }
    }
    let error_rates = totals
        .into_iter()
        .map(|(cmd, (total, failures))| (cmd, failures as f64 / total as f64))
        .collect();

    Ok(HealthReport {
        memory_count: store.count_memories()?,
        db_size_bytes: store.db_size(),
        vector_backend,
        vector_count: store.count_vectors()?,
        vector_dim: store.vector_dim()?,
        file_digest_count: store.count_file_digests()?,
        window_days: since_days,
        search_latency_ms_p50: percentile(&search_latencies, 50),
        search_latency_ms_p95: percentile(&search_latencies, 95),
        error_rates,
    })
}

/// GC report payload.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GcReport {
    pub pruned_vectors: usize,
    pub dropped_digests: usize,
    pub vacuumed: bool,
}

/// Run the requested GC passes.
pub fn gc(
    ctx: &mut ProjectContext,
    prune_vectors: bool,
    drop_stale_digests: bool,
    vacuum: bool,
) -> Result<GcReport> {
    let mut report = GcReport::default();

    if prune_vectors {
        report.pruned_vectors = ctx.store()?.prune_orphan_vectors()?;
    }

    if drop_stale_digests {
        let rows = ctx.store()?.list_file_digests(None)?;
        let root = ctx.layout.root().to_path_buf();
        for (file, _, _) in rows {
            if !root.join(&file).exists() {
                ctx.store()?.delete_file_digest(&file)?;
                report.dropped_digests += 1;
            }
        }
    }

    if vacuum {
        ctx.store()?.vacuum()?;
        report.vacuumed = true;
    }

    info!(
        pruned = report.pruned_vectors,
        dropped = report.dropped_digests,
        vacuumed = report.vacuumed,
        "gc complete"
    );
    Ok(report)
}

fn percentile(sorted: &[u64], pct: usize) -> Option<u64> {
    if sorted.is_empty() {
        return None;
    }
    let rank = (pct * sorted.len()).div_ceil(100);
    let idx = rank.saturating_sub(1).min(sorted.len() - 1);
    Some(sorted[idx])
}
