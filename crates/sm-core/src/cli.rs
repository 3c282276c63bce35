//! CLI surface.
//!
//! Command names are a stable contract; the engine behind them is
//! transport-agnostic. Exit codes: 0 success, 1 generic failure, 2 policy
//! denial, 3 signature required/invalid, 4 checksum mismatch, 111 network
//! egress attempted in offline mode.

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "smem",
    version,
    about = "Local, air-gapped AI memory engine for developers"
)]
pub struct Cli {
    /// Verbose tracing to stderr.
    #[arg(long, global = true)]
    pub trace: bool,

    /// Describe side effects without performing them.
    #[arg(long, global = true)]
    pub dry_run: bool,

    /// Machine-readable JSON payloads on stdout.
    #[arg(long, global = true)]
    pub json: bool,

    /// Explain what the command would do and why.
    #[arg(long, global = true)]
    pub explain: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Create the .securamem layout and default policy.
    Init {
        /// Recreate guides and defaults even if present.
        #[arg(long)]
        force: bool,
    },

    /// Project, database, and mode summary.
    Status,

    /// Vector backend, dimension, and count.
    VectorStatus,

    /// Rollups from storage and the audit trail.
    Health {
        /// Window in days for receipt-derived metrics.
        #[arg(long, default_value_t = 7)]
        since: u32,
    },

    /// Store a memory.
    Remember {
        content: String,
        #[arg(long, default_value = "general")]
        context: String,
        #[arg(long = "type", default_value = "note")]
        kind: String,
    },

    /// Full-text recall over stored memories.
    Recall {
        query: String,
        #[arg(short = 'l', long, default_value_t = 10)]
        limit: usize,
    },

    /// Index source code under a root.
    IndexCode {
        #[arg(long, default_value = ".")]
        path: String,
        #[arg(long, default_value_t = 200)]
        max_chunk: usize,
        #[arg(long)]
        include: Vec<String>,
        #[arg(long)]
        exclude: Vec<String>,
        /// Chunk by symbol instead of fixed line windows.
        #[arg(long)]
        symbols: bool,
        /// Skip files whose cached digest is unchanged.
        #[arg(long)]
        diff: bool,
        /// Request AST-precise chunking when available.
        #[arg(long)]
        tree_sitter: bool,
    },

    /// Watch a root and incrementally reindex on change.
    WatchCode {
        #[arg(long, default_value = ".")]
        path: String,
        #[arg(long, default_value_t = 200)]
        max_chunk: usize,
        #[arg(long)]
        include: Vec<String>,
        #[arg(long)]
        exclude: Vec<String>,
        #[arg(long)]
        symbols: bool,
        /// Debounce window in milliseconds.
        #[arg(long, default_value_t = 400)]
        debounce: u64,
    },

    /// Atomically reindex one file.
    ReindexFile {
        file: String,
        #[arg(long)]
        symbols: bool,
        #[arg(long, default_value_t = 200)]
        max_chunk: usize,
    },

    /// Reindex every file under a folder.
    ReindexFolder {
        folder: String,
        #[arg(long)]
        symbols: bool,
        #[arg(long, default_value_t = 200)]
        max_chunk: usize,
    },

    /// Hybrid search over indexed code.
    SearchCode {
        query: String,
        #[arg(short = 'k', long, default_value_t = 10)]
        k: usize,
        /// Preview lines of chunk content to print.
        #[arg(long, default_value_t = 0)]
        preview: usize,
        #[arg(long = "filter-path")]
        filter_path: Vec<String>,
        #[arg(long = "filter-symbol")]
        filter_symbol: Vec<String>,
        #[arg(long = "filter-language")]
        filter_language: Vec<String>,
        /// Hybrid rerank mode (BM25 + cosine over top candidates).
        #[arg(long)]
        hybrid: bool,
        /// Rerank candidate pool size.
        #[arg(long)]
        rerank: Option<usize>,
    },

    /// Inspect or clear the file-digest cache.
    DigestCache {
        #[arg(long)]
        list: bool,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        clear: bool,
    },

    /// Garbage collection over vectors, digests, and storage.
    Gc {
        #[arg(long)]
        prune_vectors: bool,
        #[arg(long)]
        drop_stale_digests: bool,
        #[arg(long)]
        vacuum: bool,
    },

    /// Show or clear the append-only journal.
    Journal {
        #[arg(long)]
        show: bool,
        #[arg(long)]
        clear: bool,
    },

    /// Re-execute journaled commands (dry-run unless --execute).
    Replay {
        #[arg(long)]
        last: bool,
        #[arg(long)]
        id: Option<String>,
        /// Replay the last N replayable entries.
        #[arg(long)]
        range: Option<usize>,
        /// Allow side effects.
        #[arg(long)]
        execute: bool,
        #[arg(long)]
        summary_only: bool,
    },

    /// Show receipts by id, path, or recency.
    ReceiptShow {
        id_or_path: Option<String>,
        #[arg(long)]
        last: bool,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },

    /// Policy management.
    Policy {
        #[command(subcommand)]
        cmd: PolicyCmd,
    },

    /// Signing key management.
    Key {
        #[command(subcommand)]
        cmd: KeyCmd,
    },

    /// Export memories as a portable .smemctx bundle.
    ExportContext {
        #[arg(long)]
        out: String,
        #[arg(long = "type", default_value = "code")]
        bundle_type: String,
        /// Sign the bundle with the active key.
        #[arg(long)]
        sign: bool,
        /// Skip signing (overridden by policy forceSignedExports).
        #[arg(long)]
        no_sign: bool,
        /// Produce a single zip file instead of a directory.
        #[arg(long)]
        zip: bool,
    },

    /// Import a .smemctx (or legacy .agmctx) bundle.
    ImportContext {
        path: String,
        /// One-shot unsigned-import override (needs a trust token when
        /// the policy requires signed context).
        #[arg(long)]
        allow_unsigned: bool,
    },

    /// Assert the engine is running with egress denied.
    ProveOffline,
}

#[derive(Debug, Subcommand)]
pub enum PolicyCmd {
    /// Print the effective policy.
    Status,
    /// Add a command to the allow-list.
    AllowCommand { command: String },
    /// Add a path glob to the allow-list.
    AllowPath { glob: String },
    /// Grant a short-lived trust token for one command.
    Trust {
        command: String,
        #[arg(long, default_value_t = 5)]
        minutes: i64,
    },
    /// Validate the policy document.
    Doctor,
}

#[derive(Debug, Subcommand)]
pub enum KeyCmd {
    /// Active key id and location.
    Status,
    /// Rotate the active keypair into the archive.
    Rotate,
    /// List active and archived key ids.
    List,
    /// Remove old archived keypairs.
    Prune {
        #[arg(long, default_value_t = 3)]
        keep: usize,
    },
}

impl Command {
    /// The policy-gate command name for this invocation.
    pub fn gate_name(&self) -> &'static str {
        match self {
            Command::Init { .. } => "init",
            Command::Status => "status",
            Command::VectorStatus => "vector-status",
            Command::Health { .. } => "health",
            Command::Remember { .. } => "remember",
            Command::Recall { .. } => "recall",
            Command::IndexCode { .. } => "index-code",
            Command::WatchCode { .. } => "watch-code",
            Command::ReindexFile { .. } => "reindex-file",
            Command::ReindexFolder { .. } => "reindex-folder",
            Command::SearchCode { .. } => "search-code",
            Command::DigestCache { .. } => "digest-cache",
            Command::Gc { .. } => "gc",
            Command::Journal { .. } => "journal",
            Command::Replay { .. } => "replay",
            Command::ReceiptShow { .. } => "receipt-show",
            Command::Policy { .. } => "policy",
            Command::Key { .. } => "key",
            Command::ExportContext { .. } => "export-context",
            Command::ImportContext { .. } => "import-context",
            Command::ProveOffline => "prove-offline",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_gate_names_cover_surface() {
        let cli = Cli::parse_from(["smem", "remember", "hello", "--context", "t"]);
        assert_eq!(cli.command.gate_name(), "remember");

        let cli = Cli::parse_from(["smem", "search-code", "q", "-k", "5", "--hybrid"]);
        assert_eq!(cli.command.gate_name(), "search-code");

        let cli = Cli::parse_from(["smem", "policy", "trust", "import-context", "--minutes", "1"]);
        assert_eq!(cli.command.gate_name(), "policy");
    }

    #[test]
    fn test_global_flags_anywhere() {
        let cli = Cli::parse_from(["smem", "status", "--json", "--trace"]);
        assert!(cli.json);
        assert!(cli.trace);
    }
}
