//! Command handlers.
//!
//! Each handler prints its payload (human text, or JSON with `--json`)
//! and returns a [`CommandOutput`] for the receipt. Side-effecting
//! handlers honor `--dry-run` by describing the effect instead.

use std::path::PathBuf;

use serde_json::json;

use sm_audit::{batch_digest, select_entries, Journal, Receipt, ReplaySelector};
use sm_common::{Error, Result};
use sm_policy::{doctor, FindingLevel};
use sm_search::{select_backend, BackendChoice, HybridOptions, HybridSearch, Strategy};
use sm_storage::{MemoryType, NewMemory, SearchOptions};

use crate::broker::CommandOutput;
use crate::cli::{KeyCmd, PolicyCmd};
use crate::context::ProjectContext;
use crate::ENGINE_VERSION;

const GUIDE: &str = "\
# SecuraMem

Local, air-gapped memory for this project.

- `smem remember \"...\"` stores a note; `smem recall <query>` finds it.
- `smem index-code --diff` keeps the code index incremental.
- `smem search-code <query> --hybrid` fuses lexical and semantic search.
- Every command leaves a receipt under `.securamem/receipts/` and a line
  in `.securamem/journal.jsonl`.
- `smem export-context --out ctx.smemctx --sign` produces a portable,
  signed bundle; `smem import-context` verifies before ingesting.
";

fn dry(summary: &str) -> CommandOutput {
    println!("[dry-run] {summary}");
    CommandOutput::new(format!("dry-run: {summary}"), json!({"dryRun": true}))
}

pub fn init(ctx: &mut ProjectContext, force: bool) -> Result<CommandOutput> {
    if ctx.dry_run {
        return Ok(dry("would create .securamem layout, policy, and guide"));
    }
    ctx.layout.ensure()?;

    let policy_path = ctx.layout.policy_path();
    if !policy_path.exists() || force {
        ctx.policy = sm_policy::PolicyDocument::default();
        ctx.save_policy()?;
    }

    let guide_path = ctx.layout.data_dir().join("GUIDE.md");
    if !guide_path.exists() || force {
        std::fs::write(&guide_path, GUIDE)?;
    }

    // Touch the database and keyring so the layout is complete.
    ctx.store()?;
    let keyring = ctx.keyring()?;

    let payload = json!({
        "root": ctx.layout.redact_path(ctx.layout.root()),
        "database": ".securamem/memory.db",
        "policy": ".securamem/policy.json",
        "keyId": keyring.key_id(),
    });
    if ctx.json {
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        println!("initialized .securamem (key {})", keyring.key_id());
    }
    Ok(CommandOutput::new("project initialized", payload))
}

pub fn status(ctx: &mut ProjectContext) -> Result<CommandOutput> {
    let secure = ctx.secure_mode();
    let db_exists = ctx.layout.db_path().exists() || ctx.layout.encrypted_db_path().exists();
    let store = ctx.store()?;
    let payload = json!({
        "version": ENGINE_VERSION,
        "root": ".",
        "databasePresent": db_exists,
        "dbSizeBytes": store.db_size(),
        "memoryCount": store.count_memories()?,
        "secureMode": secure,
        // Advisory only; nothing is gated on this.
        "plan": "community",
    });
    if ctx.json {
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        println!("securamem {ENGINE_VERSION}");
        println!("memories: {}", payload["memoryCount"]);
        println!("db size:  {} bytes", payload["dbSizeBytes"]);
        println!("secure mode: {}", if secure { "on" } else { "off" });
        println!("plan: community (Pro adds nothing here; just a nudge)");
    }
    Ok(CommandOutput::new("status reported", payload))
}

pub fn vector_status(ctx: &mut ProjectContext) -> Result<CommandOutput> {
    let store = ctx.store()?.clone();
    let embedder = ctx.embedder().cloned();
    let index = select_backend(BackendChoice::Auto, &store, embedder)?;
    let stats = index.stats();
    let payload = serde_json::to_value(&stats)?;
    if ctx.json {
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        println!("backend: {}", stats.backend);
        println!("vectors: {}", stats.count);
        match stats.dimensions {
            Some(dim) => println!("dim:     {dim}"),
            None => println!("dim:     (no vectors yet)"),
        }
    }
    Ok(CommandOutput::new("vector status reported", payload))
}

pub fn health(ctx: &mut ProjectContext, since: u32) -> Result<CommandOutput> {
    let report = crate::health::health(ctx, since)?;
    let payload = serde_json::to_value(&report)?;
    if ctx.json {
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        println!("memories:     {}", report.memory_count);
        println!("db size:      {} bytes", report.db_size_bytes);
        println!(
            "vectors:      {} ({} backend)",
            report.vector_count, report.vector_backend
        );
        println!("file digests: {}", report.file_digest_count);
        match (report.search_latency_ms_p50, report.search_latency_ms_p95) {
            (Some(p50), Some(p95)) => {
                println!("search p50/p95 ({}d): {p50}ms / {p95}ms", report.window_days)
            }
            _ => println!("search latency: no samples in window"),
        }
        for (cmd, rate) in &report.error_rates {
            if *rate > 0.0 {
                println!("errors {cmd}: {:.0}%", rate * 100.0);
            }
        }
    }
    Ok(CommandOutput::new("health reported", payload))
}

pub fn remember(
    ctx: &mut ProjectContext,
    content: &str,
    context: &str,
    kind: &str,
) -> Result<CommandOutput> {
    if ctx.dry_run {
        return Ok(dry("would store one memory"));
    }
    let id = ctx.store()?.store_memory(&NewMemory {
        content: content.to_string(),
        context: context.to_string(),
        kind: MemoryType::from(kind),
        tags: Vec::new(),
        metadata: sm_storage::Metadata::empty(),
    })?;
    // Vectors are best-effort; the memory stands without one.
    let vector = ctx.embedder().map(|e| e.embed(content));
    if let Some(vector) = vector {
        if let Err(e) = ctx.store()?.upsert_vector(id, &vector) {
            tracing::warn!(error = %e, "memory stored without vector");
        }
    }
    let payload = json!({"id": id});
    if ctx.json {
        println!("{}", serde_json::to_string(&payload)?);
    } else {
        println!("remembered #{id}");
    }
    Ok(CommandOutput::new("stored 1 memory", payload))
}

pub fn recall(ctx: &mut ProjectContext, query: &str, limit: usize) -> Result<CommandOutput> {
    let hits = ctx.store()?.search_memories(
        query,
        &SearchOptions {
            limit,
            ..Default::default()
        },
    )?;
    let payload = json!({
        "count": hits.len(),
        "results": hits.iter().map(|h| json!({
            "id": h.memory.id,
            "content": h.memory.content,
            "context": h.memory.context,
            "type": h.memory.kind.as_str(),
            "relevance": h.relevance,
        })).collect::<Vec<_>>(),
    });
    if ctx.json {
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else if hits.is_empty() {
        println!("no matches");
    } else {
        for hit in &hits {
            println!(
                "#{:<6} [{:.2}] {}",
                hit.memory.id,
                hit.relevance,
                first_line(&hit.memory.content)
            );
        }
    }
    Ok(CommandOutput::new(format!("{} results", hits.len()), payload))
}

#[allow(clippy::too_many_arguments)]
pub fn search_code(
    ctx: &mut ProjectContext,
    query: &str,
    k: usize,
    preview: usize,
    filter_path: &[String],
    filter_symbol: &[String],
    filter_language: &[String],
    hybrid: bool,
    rerank: Option<usize>,
) -> Result<CommandOutput> {
    let store = ctx.store()?.clone();
    let embedder = ctx.embedder().cloned();
    let index = select_backend(BackendChoice::Auto, &store, embedder.clone())?;
    let mut search = HybridSearch::new(store, index, embedder);

    let has_filters =
        !filter_path.is_empty() || !filter_symbol.is_empty() || !filter_language.is_empty();
    let opts = HybridOptions {
        // Over-fetch when post-filters will thin the list.
        k: if has_filters { k.max(1) * 5 } else { k },
        strategy: Strategy::Adaptive,
        rerank: if hybrid {
            Some(rerank.unwrap_or(sm_search::hybrid::DEFAULT_RERANK_N))
        } else {
            None
        },
        kind: Some(MemoryType::Code),
        ..Default::default()
    };

    let path_globs = compile_globs(filter_path)?;
    let mut results = search.search(query, &opts)?;
    results.retain(|r| {
        let Some(meta) = &r.code_meta else {
            return false;
        };
        let path_ok = path_globs
            .as_ref()
            .map(|set| set.is_match(&meta.file))
            .unwrap_or(true);
        let symbol_ok = filter_symbol.is_empty()
            || meta
                .symbol
                .as_deref()
                .map(|s| filter_symbol.iter().any(|f| s.contains(f.as_str())))
                .unwrap_or(false);
        let lang_ok =
            filter_language.is_empty() || filter_language.iter().any(|l| l == &meta.language);
        path_ok && symbol_ok && lang_ok
    });
    results.truncate(k.max(1));

    let payload = json!({
        "count": results.len(),
        "results": results.iter().map(|r| {
            let mut v = serde_json::to_value(r).unwrap_or(serde_json::Value::Null);
            if let (Some(obj), Some(meta)) = (v.as_object_mut(), &r.code_meta) {
                obj.insert("metadata".into(), serde_json::to_value(meta).unwrap_or_default());
            }
            v
        }).collect::<Vec<_>>(),
    });

    if ctx.json {
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else if results.is_empty() {
        println!("no matches");
    } else {
        for result in &results {
            let meta = result.code_meta.as_ref().expect("code results carry metadata");
            println!(
                "{:.3}  {}:{}-{}  {}",
                result.score,
                meta.file,
                meta.line_start,
                meta.line_end,
                meta.symbol.as_deref().unwrap_or("-")
            );
            for line in result.content.lines().take(preview) {
                println!("    {line}");
            }
        }
    }
    Ok(CommandOutput::new(
        format!("{} code results", results.len()),
        payload,
    ))
}

pub fn digest_cache(
    ctx: &mut ProjectContext,
    list: bool,
    limit: Option<usize>,
    clear: bool,
) -> Result<CommandOutput> {
    if clear {
        if ctx.dry_run {
            return Ok(dry("would clear the file-digest cache"));
        }
        let removed = ctx.store()?.clear_file_digests()?;
        println!("cleared {removed} digest rows");
        return Ok(CommandOutput::new(
            format!("cleared {removed} digests"),
            json!({"cleared": removed}),
        ));
    }

    // Default action is --list.
    let _ = list;
    let rows = ctx.store()?.list_file_digests(limit)?;
    let payload = json!({
        "count": rows.len(),
        "digests": rows.iter().map(|(file, digest, updated)| json!({
            "file": file, "digest": digest, "updatedAt": updated,
        })).collect::<Vec<_>>(),
    });
    if ctx.json {
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        for (file, digest, _) in &rows {
            println!("{}  {}", &digest[..12.min(digest.len())], file);
        }
        println!("{} digest rows", rows.len());
    }
    Ok(CommandOutput::new(format!("{} digests listed", rows.len()), payload))
}

pub fn journal_cmd(ctx: &mut ProjectContext, show: bool, clear: bool) -> Result<CommandOutput> {
    let journal = Journal::new(ctx.layout.journal_path());
    if clear {
        if ctx.dry_run {
            return Ok(dry("would clear the journal"));
        }
        let count = journal.len()?;
        journal.clear()?;
        println!("journal cleared ({count} entries removed; receipts kept)");
        return Ok(CommandOutput::new(
            "journal cleared",
            json!({"removed": count}),
        ));
    }

    let _ = show;
    let entries = journal.read_all()?;
    if ctx.json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
    } else if entries.is_empty() {
        println!("journal is empty");
    } else {
        for entry in entries.iter().rev().take(20) {
            let status = if entry.error.is_some() { "FAIL" } else { "ok" };
            println!(
                "{}  {:<4} {:<16} {}",
                entry.ts.format("%Y-%m-%d %H:%M:%S"),
                status,
                entry.cmd,
                entry.receipt
            );
        }
    }
    Ok(CommandOutput::new(
        format!("{} journal entries", entries.len()),
        json!({"count": entries.len()}),
    ))
}

pub fn replay(
    ctx: &mut ProjectContext,
    last: bool,
    id: Option<String>,
    range: Option<usize>,
    execute: bool,
    summary_only: bool,
) -> Result<CommandOutput> {
    let selector = if let Some(id) = id {
        ReplaySelector::Id(id)
    } else if let Some(n) = range {
        ReplaySelector::Range(n)
    } else {
        let _ = last;
        ReplaySelector::Last
    };

    let journal = Journal::new(ctx.layout.journal_path());
    let selected = select_entries(&journal.read_all()?, &selector);
    if selected.is_empty() {
        println!("nothing to replay");
        return Ok(CommandOutput::new("nothing to replay", json!({"replayed": 0})));
    }

    let exe = std::env::current_exe()?;
    let mut replayed_ids = Vec::new();
    let mut failures = 0usize;
    for entry in &selected {
        let receipt_path = ctx.layout.root().join(&entry.receipt);
        let receipt = Receipt::load(&receipt_path)?;
        replayed_ids.push(receipt.id.clone());

        let mut argv = receipt.argv.clone();
        // Dry-run is forced unless the caller explicitly executes.
        if !execute && !argv.iter().any(|a| a == "--dry-run") {
            argv.push("--dry-run".to_string());
        }
        if summary_only {
            println!("replay {} {}", receipt.command, argv.join(" "));
            continue;
        }
        let status = std::process::Command::new(&exe)
            .args(&argv)
            .current_dir(ctx.layout.root())
            .status()?;
        if !status.success() {
            failures += 1;
        }
    }

    let digest = batch_digest(&replayed_ids);
    let payload = json!({
        "replayed": replayed_ids.len(),
        "failures": failures,
        "executed": execute,
        "batchDigest": digest,
    });
    println!(
        "replayed {} command(s){}",
        replayed_ids.len(),
        if execute { " (executed)" } else { " (dry-run)" }
    );
    Ok(CommandOutput::new(
        format!("replayed {} commands", replayed_ids.len()),
        payload,
    ))
}

pub fn receipt_show(
    ctx: &mut ProjectContext,
    id_or_path: Option<String>,
    last: bool,
    limit: usize,
) -> Result<CommandOutput> {
    let receipts: Vec<Receipt> = match (&id_or_path, last) {
        (Some(id_or_path), _) => {
            let as_path = PathBuf::from(id_or_path);
            let receipt = if as_path.exists() {
                Receipt::load(&as_path)?
            } else {
                Receipt::find(&ctx.layout, id_or_path)?
            };
            vec![receipt]
        }
        (None, _) => Receipt::list(&ctx.layout, limit)?,
    };

    if ctx.json {
        println!("{}", serde_json::to_string_pretty(&receipts)?);
    } else {
        for receipt in &receipts {
            let status = if receipt.success { "ok" } else { "FAIL" };
            println!(
                "{}  {:<4} {:<16} {}",
                receipt.id, status, receipt.command, receipt.result_summary
            );
            if let Some(error) = &receipt.error {
                println!("    error: {error}");
            }
        }
    }
    Ok(CommandOutput::new(
        format!("{} receipts shown", receipts.len()),
        json!({"count": receipts.len()}),
    ))
}

pub fn policy_cmd(ctx: &mut ProjectContext, cmd: &PolicyCmd) -> Result<CommandOutput> {
    match cmd {
        PolicyCmd::Status => {
            let payload = serde_json::to_value(&ctx.policy)?;
            println!("{}", serde_json::to_string_pretty(&payload)?);
            Ok(CommandOutput::new("policy shown", payload))
        }
        PolicyCmd::AllowCommand { command } => {
            if ctx.dry_run {
                return Ok(dry("would add command to allow-list"));
            }
            ctx.policy.allow_command(command.clone());
            ctx.save_policy()?;
            println!("allowed command '{command}'");
            Ok(CommandOutput::new(
                format!("allowed command {command}"),
                json!({"command": command}),
            ))
        }
        PolicyCmd::AllowPath { glob } => {
            if ctx.dry_run {
                return Ok(dry("would add path glob to allow-list"));
            }
            ctx.policy.allow_glob(glob.clone());
            ctx.save_policy()?;
            println!("allowed path glob '{glob}'");
            Ok(CommandOutput::new(
                format!("allowed glob {glob}"),
                json!({"glob": glob}),
            ))
        }
        PolicyCmd::Trust { command, minutes } => {
            if ctx.dry_run {
                return Ok(dry("would grant a trust token"));
            }
            let token = ctx.trust_tokens()?.grant(command, *minutes)?;
            println!(
                "trust token for '{}' until {}",
                token.command,
                token.expires_at.to_rfc3339()
            );
            Ok(CommandOutput::new(
                format!("trusted {command} for {minutes}m"),
                serde_json::to_value(&token)?,
            ))
        }
        PolicyCmd::Doctor => {
            let findings = doctor(&ctx.layout.policy_path())?;
            let errors = findings.iter().filter(|f| f.level == FindingLevel::Error).count();
            if ctx.json {
                println!("{}", serde_json::to_string_pretty(&findings)?);
            } else if findings.is_empty() {
                println!("policy is healthy");
            } else {
                for finding in &findings {
                    println!("{:?}: {}", finding.level, finding.message);
                }
            }
            let payload = json!({"findings": findings.len(), "errors": errors});
            if errors > 0 {
                return Err(Error::InputInvalid(format!(
                    "policy doctor found {errors} error(s)"
                )));
            }
            Ok(CommandOutput::new("policy healthy", payload))
        }
    }
}

pub fn key_cmd(ctx: &mut ProjectContext, cmd: &KeyCmd) -> Result<CommandOutput> {
    match cmd {
        KeyCmd::Status => {
            let keyring = ctx.keyring()?;
            let payload = json!({
                "keyId": keyring.key_id(),
                "location": ".securamem/keys/active",
            });
            if ctx.json {
                println!("{}", serde_json::to_string_pretty(&payload)?);
            } else {
                println!("active key: {}", keyring.key_id());
            }
            Ok(CommandOutput::new("key status shown", payload))
        }
        KeyCmd::Rotate => {
            if ctx.dry_run {
                return Ok(dry("would rotate the signing keypair"));
            }
            let mut keyring = ctx.keyring()?;
            let new_id = keyring.rotate()?;
            println!("rotated; new key {new_id}");
            Ok(CommandOutput::new("key rotated", json!({"keyId": new_id})))
        }
        KeyCmd::List => {
            let keyring = ctx.keyring()?;
            let archived = keyring.archived_ids()?;
            let payload = json!({"active": keyring.key_id(), "archived": archived});
            if ctx.json {
                println!("{}", serde_json::to_string_pretty(&payload)?);
            } else {
                println!("active:   {}", keyring.key_id());
                for id in &archived {
                    println!("archived: {id}");
                }
            }
            Ok(CommandOutput::new("keys listed", payload))
        }
        KeyCmd::Prune { keep } => {
            if ctx.dry_run {
                return Ok(dry("would prune archived keypairs"));
            }
            let keyring = ctx.keyring()?;
            let pruned = keyring.prune_archive(*keep)?;
            println!("pruned {} archived key(s)", pruned.len());
            Ok(CommandOutput::new(
                format!("pruned {} keys", pruned.len()),
                json!({"pruned": pruned}),
            ))
        }
    }
}

pub fn prove_offline(ctx: &mut ProjectContext) -> Result<CommandOutput> {
    if ctx.policy.network_egress {
        return Err(Error::Internal(
            "cannot prove offline: policy permits network egress".to_string(),
        ));
    }
    let ts = chrono::Utc::now().to_rfc3339();
    let payload = json!({
        "offline": true,
        "networkEgress": false,
        "timestamp": ts,
    });
    if ctx.json {
        println!("{}", serde_json::to_string(&payload)?);
    } else {
        println!("offline-proof: egress=denied policy=.securamem/policy.json ts={ts}");
    }
    Ok(CommandOutput::new("offline proven", payload))
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or("")
}

fn compile_globs(patterns: &[String]) -> Result<Option<globset::GlobSet>> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let mut builder = globset::GlobSetBuilder::new();
    for pattern in patterns {
        let glob = globset::Glob::new(pattern)
            .map_err(|e| Error::InputInvalid(format!("bad filter glob '{pattern}': {e}")))?;
        builder.add(glob);
    }
    builder
        .build()
        .map(Some)
        .map_err(|e| Error::InputInvalid(format!("filter glob set: {e}")))
}
