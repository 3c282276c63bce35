//! `smem` entry point: parse, gate, dispatch, audit, exit.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use clap::Parser;
use serde_json::json;

use sm_core::broker::{self, CommandOutput};
use sm_core::bundle_ops::{self, ExportOptions};
use sm_core::cli::{Cli, Command};
use sm_core::commands;
use sm_core::context::{scrub_env, ProjectContext};
use sm_core::service::{self, IndexOptions};
use sm_core::{logging, watch};

use sm_common::Result;

fn main() {
    let cli = Cli::parse();
    logging::init_logging(cli.trace);
    let code = run(cli);
    std::process::exit(code);
}

fn run(cli: Cli) -> i32 {
    let root = match std::env::current_dir() {
        Ok(dir) => dir,
        Err(e) => {
            eprintln!("Internal: cannot determine working directory: {e}");
            return 1;
        }
    };
    let mut ctx = match ProjectContext::open(root, cli.dry_run, cli.json, cli.explain) {
        Ok(ctx) => ctx,
        Err(e) => {
            eprintln!("{e}");
            return e.exit_code();
        }
    };
    // Env gate: only passthrough names stay visible. Main thread only.
    scrub_env(&ctx.policy);

    let command = cli.command;
    let gate = command.gate_name();
    let params = params_for(&command);
    let paths = paths_for(&command);

    let code = broker::execute(&mut ctx, gate, params, &paths, |ctx| dispatch(ctx, &command));
    ctx.close();
    code
}

fn dispatch(ctx: &mut ProjectContext, command: &Command) -> Result<CommandOutput> {
    match command {
        Command::Init { force } => commands::init(ctx, *force),
        Command::Status => commands::status(ctx),
        Command::VectorStatus => commands::vector_status(ctx),
        Command::Health { since } => commands::health(ctx, *since),
        Command::Remember {
            content,
            context,
            kind,
        } => commands::remember(ctx, content, context, kind),
        Command::Recall { query, limit } => commands::recall(ctx, query, *limit),

        Command::IndexCode {
            path,
            max_chunk,
            include,
            exclude,
            symbols,
            diff,
            tree_sitter,
        } => {
            let opts = IndexOptions {
                path: path.clone(),
                include: include.clone(),
                exclude: exclude.clone(),
                max_chunk: *max_chunk,
                symbols: *symbols,
                diff: *diff,
                tree_sitter: *tree_sitter,
            };
            if ctx.explain {
                println!("index plan:");
                println!("  root:     {}", opts.path);
                println!(
                    "  include:  {}",
                    if opts.include.is_empty() { "(all files)".to_string() } else { opts.include.join(", ") }
                );
                println!(
                    "  exclude:  defaults{}",
                    if opts.exclude.is_empty() { String::new() } else { format!(" + {}", opts.exclude.join(", ")) }
                );
                println!(
                    "  chunking: {} (max {} lines)",
                    if opts.symbols || opts.tree_sitter { "symbols" } else { "lines" },
                    opts.max_chunk
                );
                println!("  diff:     {}", opts.diff);
                return Ok(CommandOutput::new("index plan explained", json!({"explained": true})));
            }
            if ctx.dry_run {
                println!("[dry-run] would index code under '{}'", opts.path);
                return Ok(CommandOutput::new("dry-run: index-code", json!({"dryRun": true})));
            }
            let report = service::index_code(ctx, &opts, &AtomicBool::new(false))?;
            let payload = serde_json::to_value(&report)?;
            if ctx.json {
                println!("{}", serde_json::to_string_pretty(&payload)?);
            } else {
                println!(
                    "indexed {} chunks from {} files ({} unchanged, {} errors)",
                    report.saved, report.file_count, report.skipped, report.errors
                );
            }
            Ok(CommandOutput::new(
                format!("indexed {} chunks", report.saved),
                payload,
            ))
        }

        Command::WatchCode {
            path,
            max_chunk,
            include,
            exclude,
            symbols,
            debounce,
        } => {
            let opts = IndexOptions {
                path: path.clone(),
                include: include.clone(),
                exclude: exclude.clone(),
                max_chunk: *max_chunk,
                symbols: *symbols,
                diff: true,
                tree_sitter: false,
            };
            if ctx.dry_run {
                println!("[dry-run] would watch '{}' with {}ms debounce", opts.path, debounce);
                return Ok(CommandOutput::new("dry-run: watch-code", json!({"dryRun": true})));
            }
            let stats = watch::watch_code(
                ctx,
                &opts,
                Duration::from_millis(*debounce),
                &AtomicBool::new(false),
            )?;
            let payload = serde_json::to_value(&stats)?;
            Ok(CommandOutput::new("watch finished", payload))
        }

        Command::ReindexFile {
            file,
            symbols,
            max_chunk,
        } => {
            if ctx.dry_run {
                println!("[dry-run] would reindex '{file}'");
                return Ok(CommandOutput::new("dry-run: reindex-file", json!({"dryRun": true})));
            }
            let chunks = service::reindex_single_file(ctx, file, *symbols, *max_chunk)?;
            println!("reindexed '{file}': {chunks} chunks");
            Ok(CommandOutput::new(
                format!("reindexed {file}"),
                json!({"file": file, "chunks": chunks}),
            ))
        }

        Command::ReindexFolder {
            folder,
            symbols,
            max_chunk,
        } => {
            if ctx.dry_run {
                println!("[dry-run] would reindex folder '{folder}'");
                return Ok(CommandOutput::new("dry-run: reindex-folder", json!({"dryRun": true})));
            }
            let report = service::reindex_folder(ctx, folder, *symbols, *max_chunk)?;
            let payload = serde_json::to_value(&report)?;
            println!(
                "reindexed '{folder}': {} files, {} chunks, {} errors",
                report.files, report.added, report.errors
            );
            Ok(CommandOutput::new(format!("reindexed {folder}"), payload))
        }

        Command::SearchCode {
            query,
            k,
            preview,
            filter_path,
            filter_symbol,
            filter_language,
            hybrid,
            rerank,
        } => commands::search_code(
            ctx,
            query,
            *k,
            *preview,
            filter_path,
            filter_symbol,
            filter_language,
            *hybrid,
            *rerank,
        ),

        Command::DigestCache { list, limit, clear } => {
            commands::digest_cache(ctx, *list, *limit, *clear)
        }

        Command::Gc {
            prune_vectors,
            drop_stale_digests,
            vacuum,
        } => {
            if ctx.dry_run {
                println!("[dry-run] would garbage-collect");
                return Ok(CommandOutput::new("dry-run: gc", json!({"dryRun": true})));
            }
            let report = sm_core::health::gc(ctx, *prune_vectors, *drop_stale_digests, *vacuum)?;
            let payload = serde_json::to_value(&report)?;
            println!(
                "gc: {} vectors pruned, {} digests dropped{}",
                report.pruned_vectors,
                report.dropped_digests,
                if report.vacuumed { ", vacuumed" } else { "" }
            );
            Ok(CommandOutput::new("gc complete", payload))
        }

        Command::Journal { show, clear } => commands::journal_cmd(ctx, *show, *clear),

        Command::Replay {
            last,
            id,
            range,
            execute,
            summary_only,
        } => commands::replay(ctx, *last, id.clone(), *range, *execute, *summary_only),

        Command::ReceiptShow {
            id_or_path,
            last,
            limit,
        } => commands::receipt_show(ctx, id_or_path.clone(), *last, *limit),

        Command::Policy { cmd } => commands::policy_cmd(ctx, cmd),
        Command::Key { cmd } => commands::key_cmd(ctx, cmd),

        Command::ExportContext {
            out,
            bundle_type,
            sign,
            no_sign,
            zip,
        } => {
            if ctx.dry_run {
                println!("[dry-run] would export context to '{out}'");
                return Ok(CommandOutput::new("dry-run: export-context", json!({"dryRun": true})));
            }
            let opts = ExportOptions {
                bundle_type: bundle_type.parse()?,
                sign: *sign,
                no_sign: *no_sign,
                zip: *zip,
            };
            let report = bundle_ops::export_context(ctx, &PathBuf::from(out), &opts)?;
            let payload = serde_json::to_value(&report)?;
            println!(
                "exported {} chunks, {} notes, {} vectors{}",
                report.chunks,
                report.notes,
                report.vectors,
                if report.signed { " (signed)" } else { "" }
            );
            Ok(CommandOutput::new("context exported", payload))
        }

        Command::ImportContext {
            path,
            allow_unsigned,
        } => {
            if ctx.dry_run {
                println!("[dry-run] would import context from '{path}'");
                return Ok(CommandOutput::new("dry-run: import-context", json!({"dryRun": true})));
            }
            let report = bundle_ops::import_context(ctx, &PathBuf::from(path), *allow_unsigned)?;
            let payload = serde_json::to_value(&report)?;
            println!(
                "imported {} chunks, {} notes, {} vectors",
                report.chunks, report.notes, report.vectors
            );
            Ok(CommandOutput::new("context imported", payload))
        }

        Command::ProveOffline => commands::prove_offline(ctx),
    }
}

/// Parameters recorded in the receipt for each command.
fn params_for(command: &Command) -> serde_json::Value {
    match command {
        Command::Init { force } => json!({"force": force}),
        Command::Status | Command::VectorStatus | Command::ProveOffline => json!({}),
        Command::Health { since } => json!({"since": since}),
        Command::Remember { context, kind, .. } => json!({"context": context, "type": kind}),
        Command::Recall { query, limit } => json!({"query": query, "limit": limit}),
        Command::IndexCode {
            path,
            max_chunk,
            include,
            exclude,
            symbols,
            diff,
            tree_sitter,
        } => json!({
            "path": path, "maxChunk": max_chunk, "include": include, "exclude": exclude,
            "symbols": symbols, "diff": diff, "treeSitter": tree_sitter,
        }),
        Command::WatchCode {
            path,
            max_chunk,
            debounce,
            ..
        } => json!({"path": path, "maxChunk": max_chunk, "debounceMs": debounce}),
        Command::ReindexFile { file, symbols, max_chunk } => {
            json!({"file": file, "symbols": symbols, "maxChunk": max_chunk})
        }
        Command::ReindexFolder { folder, symbols, max_chunk } => {
            json!({"folder": folder, "symbols": symbols, "maxChunk": max_chunk})
        }
        Command::SearchCode { query, k, hybrid, rerank, .. } => {
            json!({"query": query, "k": k, "hybrid": hybrid, "rerank": rerank})
        }
        Command::DigestCache { list, clear, .. } => json!({"list": list, "clear": clear}),
        Command::Gc {
            prune_vectors,
            drop_stale_digests,
            vacuum,
        } => json!({
            "pruneVectors": prune_vectors,
            "dropStaleDigests": drop_stale_digests,
            "vacuum": vacuum,
        }),
        Command::Journal { show, clear } => json!({"show": show, "clear": clear}),
        Command::Replay { last, id, range, execute, .. } => {
            json!({"last": last, "id": id, "range": range, "execute": execute})
        }
        Command::ReceiptShow { id_or_path, last, limit } => {
            json!({"idOrPath": id_or_path, "last": last, "limit": limit})
        }
        Command::Policy { .. } => json!({"subcommand": "policy"}),
        Command::Key { .. } => json!({"subcommand": "key"}),
        Command::ExportContext { out, bundle_type, sign, no_sign, zip } => json!({
            "out": out, "type": bundle_type, "sign": sign, "noSign": no_sign, "zip": zip,
        }),
        Command::ImportContext { path, allow_unsigned } => {
            json!({"path": path, "allowUnsigned": allow_unsigned})
        }
    }
}

/// Filesystem path arguments subject to the path gate.
fn paths_for(command: &Command) -> Vec<String> {
    match command {
        Command::IndexCode { path, .. } | Command::WatchCode { path, .. } => vec![path.clone()],
        Command::ReindexFile { file, .. } => vec![file.clone()],
        Command::ReindexFolder { folder, .. } => vec![folder.clone()],
        Command::ExportContext { out, .. } => vec![out.clone()],
        Command::ImportContext { path, .. } => vec![path.clone()],
        _ => Vec::new(),
    }
}
