//! The command broker: policy gates in front, audit trail behind.
//!
//! Every core command flows through [`execute`]: command gate, path
//! gate, handler, then exactly one receipt and one journal entry. Failure
//! paths (gate denials included) still produce a receipt with
//! `success=false` and a non-empty error before the process exits.

use serde_json::Value;
use tracing::{debug, error};

use sm_audit::{Journal, JournalEntry, Receipt};
use sm_common::{paths::to_slash, Error, Result};

use crate::context::ProjectContext;
use crate::ENGINE_VERSION;

/// Commands that are pure viewers over the audit trail and therefore not
/// audited themselves.
const UNAUDITED: &[&str] = &["journal", "receipt-show"];

/// What a command handler returns for the receipt.
pub struct CommandOutput {
    pub summary: String,
    pub results: Value,
}

impl CommandOutput {
    pub fn new(summary: impl Into<String>, results: Value) -> Self {
        CommandOutput {
            summary: summary.into(),
            results,
        }
    }
}

/// Run one command through the broker pipeline. Returns the process exit
/// code.
pub fn execute(
    ctx: &mut ProjectContext,
    command: &str,
    params: Value,
    paths: &[String],
    handler: impl FnOnce(&mut ProjectContext) -> Result<CommandOutput>,
) -> i32 {
    let argv: Vec<String> = std::env::args().skip(1).collect();
    let outcome = gates_then_run(ctx, command, paths, handler);

    let audited = !UNAUDITED.contains(&command) && ctx.policy.audit_trail;
    match outcome {
        Ok(output) => {
            if audited {
                if let Err(e) = record(ctx, command, &argv, &params, Ok(&output)) {
                    error!(error = %e, "failed to write audit records");
                }
            }
            0
        }
        Err(e) => {
            eprintln!("{e}");
            if audited {
                if let Err(audit_err) = record(ctx, command, &argv, &params, Err(&e)) {
                    error!(error = %audit_err, "failed to write audit records for failure");
                }
            }
            e.exit_code()
        }
    }
}

fn gates_then_run(
    ctx: &mut ProjectContext,
    command: &str,
    paths: &[String],
    handler: impl FnOnce(&mut ProjectContext) -> Result<CommandOutput>,
) -> Result<CommandOutput> {
    ctx.policy.check_command(command)?;
    for path in paths {
        ctx.policy.check_path(path)?;
    }
    handler(ctx)
}

/// Write the receipt (fsynced), then the journal line referencing it.
fn record(
    ctx: &ProjectContext,
    command: &str,
    argv: &[String],
    params: &Value,
    outcome: std::result::Result<&CommandOutput, &Error>,
) -> Result<()> {
    ctx.layout.ensure()?;
    let cwd = std::env::current_dir()
        .map(|d| ctx.layout.redact_path(&d))
        .unwrap_or_else(|_| ".".to_string());

    // Absolute paths in argv are root-relativized or redacted; receipts
    // must never leak paths outside the project root.
    let argv: Vec<String> = argv
        .iter()
        .map(|arg| {
            let path = std::path::Path::new(arg);
            if path.is_absolute() {
                ctx.layout.redact_path(path)
            } else {
                arg.clone()
            }
        })
        .collect();

    let receipt = Receipt::start(ENGINE_VERSION, command, argv, cwd).with_params(params);
    let receipt = match outcome {
        Ok(output) => receipt.finish_ok(output.summary.clone(), &output.results),
        Err(e) => receipt.finish_err(e),
    };

    let receipt_path = receipt.write(&ctx.layout)?;
    let receipt_rel = receipt_path
        .strip_prefix(ctx.layout.root())
        .map(to_slash)
        .unwrap_or_else(|_| to_slash(&receipt_path));

    let journal = Journal::new(ctx.layout.journal_path());
    let entry = match outcome {
        Ok(_) => JournalEntry::ok(command, params.clone(), receipt_rel),
        Err(e) => JournalEntry::failed(command, e.to_string(), receipt_rel),
    };
    journal.append(&entry)?;
    debug!(command, receipt = %receipt.id, "audit trail written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_ctx(tmp: &TempDir) -> ProjectContext {
        ProjectContext::open(tmp.path().to_path_buf(), false, false, false).unwrap()
    }

    #[test]
    fn test_success_writes_one_receipt_and_journal_line() {
        let tmp = TempDir::new().unwrap();
        let mut ctx = open_ctx(&tmp);

        let code = execute(&mut ctx, "gc", serde_json::json!({}), &[], |_| {
            Ok(CommandOutput::new("collected nothing", serde_json::json!({})))
        });
        assert_eq!(code, 0);

        let journal = Journal::new(ctx.layout.journal_path());
        let entries = journal.read_all().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].cmd, "gc");

        // The journal references a receipt that exists.
        let receipt_path = ctx.layout.root().join(&entries[0].receipt);
        assert!(receipt_path.exists());
        let receipt = Receipt::load(&receipt_path).unwrap();
        assert!(receipt.success);
    }

    #[test]
    fn test_command_gate_denial_exits_2_with_receipt() {
        let tmp = TempDir::new().unwrap();
        let mut ctx = open_ctx(&tmp);
        ctx.policy.allowed_commands.clear();

        let code = execute(&mut ctx, "gc", serde_json::json!({}), &[], |_| {
            panic!("handler must not run after denial")
        });
        assert_eq!(code, 2);

        let entries = Journal::new(ctx.layout.journal_path()).read_all().unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].error.as_deref().unwrap().contains("PolicyDenied"));
    }

    #[test]
    fn test_path_gate_denial_exits_2() {
        let tmp = TempDir::new().unwrap();
        let mut ctx = open_ctx(&tmp);
        ctx.policy.allowed_globs = vec!["src/**".into()];

        let code = execute(
            &mut ctx,
            "index-code",
            serde_json::json!({}),
            &["secrets/key.pem".to_string()],
            |_| panic!("handler must not run"),
        );
        assert_eq!(code, 2);
    }

    #[test]
    fn test_failure_receipt_has_error_and_exit_code() {
        let tmp = TempDir::new().unwrap();
        let mut ctx = open_ctx(&tmp);

        let code = execute(&mut ctx, "import-context", serde_json::json!({}), &[], |_| {
            Err(Error::ChecksumMismatch {
                path: "vectors.f32".into(),
                expected: "aa".into(),
                actual: "bb".into(),
            })
        });
        assert_eq!(code, 4);

        let receipts = Receipt::list(&ctx.layout, 10).unwrap();
        assert_eq!(receipts.len(), 1);
        assert!(!receipts[0].success);
        assert_eq!(receipts[0].exit_code, Some(4));
        assert!(receipts[0].error.as_deref().unwrap().contains("ChecksumMismatch"));
    }

    #[test]
    fn test_unaudited_commands_skip_receipts() {
        let tmp = TempDir::new().unwrap();
        let mut ctx = open_ctx(&tmp);

        execute(&mut ctx, "journal", serde_json::json!({}), &[], |_| {
            Ok(CommandOutput::new("shown", serde_json::json!({})))
        });
        assert!(Receipt::list(&ctx.layout, 10).unwrap().is_empty());
    }
}
