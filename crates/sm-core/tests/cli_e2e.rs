//! End-to-end CLI scenarios.
//!
//! Each test runs the real `smem` binary in an isolated temp project and
//! asserts on exit codes, stderr tokens, and on-disk state.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn smem(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("smem").expect("smem binary should exist");
    cmd.current_dir(dir.path());
    cmd
}

fn write_ts_project(dir: &TempDir) {
    let src = dir.path().join("src");
    std::fs::create_dir_all(&src).unwrap();
    std::fs::write(
        src.join("Trace.ts"),
        "export class Tracer {\n  static create(): Tracer {\n    return new Tracer();\n  }\n}\n",
    )
    .unwrap();
    std::fs::write(
        src.join("Trace.test.ts"),
        "import { Tracer } from './Trace';\ntest('create', () => {\n  Tracer.create();\n});\n",
    )
    .unwrap();
}

fn set_policy_field(dir: &TempDir, key: &str, value: serde_json::Value) {
    let path = dir.path().join(".securamem/policy.json");
    let mut policy: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    policy[key] = value;
    std::fs::write(&path, serde_json::to_vec_pretty(&policy).unwrap()).unwrap();
}

// ============================================================================
// Scenario 1: init
// ============================================================================

#[test]
fn init_creates_layout_with_default_policy() {
    let dir = TempDir::new().unwrap();
    smem(&dir).arg("init").assert().success();

    assert!(dir.path().join(".securamem/memory.db").exists());
    assert!(dir.path().join(".securamem/policy.json").exists());
    assert!(dir.path().join(".securamem/keys/active/signing.key").exists());

    let policy: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(dir.path().join(".securamem/policy.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(policy["networkEgress"], false);
    assert_eq!(policy["auditTrail"], true);
    assert!(policy["allowedCommands"]
        .as_array()
        .unwrap()
        .iter()
        .any(|c| c == "remember"));
}

// ============================================================================
// Scenario 2: remember / recall
// ============================================================================

#[test]
fn remember_then_recall_finds_content() {
    let dir = TempDir::new().unwrap();
    smem(&dir)
        .args(["remember", "hello world", "--context", "t", "--type", "note"])
        .assert()
        .success();

    smem(&dir)
        .args(["recall", "hello", "-l", "5"])
        .assert()
        .success()
        .stdout(predicate::str::contains("hello world"));

    // JSON mode exposes relevance > 0.
    let output = smem(&dir)
        .args(["recall", "hello", "-l", "5", "--json"])
        .output()
        .unwrap();
    let payload: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert!(payload["count"].as_u64().unwrap() >= 1);
    assert!(payload["results"][0]["relevance"].as_f64().unwrap() > 0.0);
}

#[test]
fn recall_empty_query_returns_zero_results_without_error() {
    let dir = TempDir::new().unwrap();
    smem(&dir).args(["remember", "something"]).assert().success();
    let output = smem(&dir)
        .args(["recall", "   ", "--json"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let payload: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(payload["count"], 0);
}

// ============================================================================
// Scenario 3: index-code --diff and search-code
// ============================================================================

#[test]
fn index_diff_twice_then_hybrid_search_with_path_filter() {
    let dir = TempDir::new().unwrap();
    write_ts_project(&dir);

    let first = smem(&dir)
        .args([
            "index-code",
            "--path",
            "./src",
            "--max-chunk",
            "200",
            "--include",
            "**/*.ts",
            "--exclude",
            "**/*.test.ts",
            "--diff",
            "--json",
        ])
        .output()
        .unwrap();
    assert!(first.status.success());
    let report: serde_json::Value = serde_json::from_slice(&first.stdout).unwrap();
    assert!(report["saved"].as_u64().unwrap() > 0);

    let second = smem(&dir)
        .args([
            "index-code",
            "--path",
            "./src",
            "--max-chunk",
            "200",
            "--include",
            "**/*.ts",
            "--exclude",
            "**/*.test.ts",
            "--diff",
            "--json",
        ])
        .output()
        .unwrap();
    let report: serde_json::Value = serde_json::from_slice(&second.stdout).unwrap();
    assert_eq!(report["saved"], 0);

    let search = smem(&dir)
        .args([
            "search-code",
            "Tracer.create",
            "--hybrid",
            "--preview",
            "5",
            "--filter-path",
            "**/Trace.ts",
            "--json",
        ])
        .output()
        .unwrap();
    assert!(search.status.success());
    let payload: serde_json::Value = serde_json::from_slice(&search.stdout).unwrap();
    assert!(payload["count"].as_u64().unwrap() >= 1);
    let file = payload["results"][0]["metadata"]["file"].as_str().unwrap();
    assert!(file.ends_with("Trace.ts"));
    assert!(!file.ends_with("test.ts"));
}

#[test]
fn index_rejects_max_chunk_below_one() {
    let dir = TempDir::new().unwrap();
    write_ts_project(&dir);
    smem(&dir)
        .args(["index-code", "--max-chunk", "0"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("InputInvalid"));
}

// ============================================================================
// Scenario 4: export, tamper, import -> exit 4
// ============================================================================

#[test]
fn tampered_bundle_import_fails_checksum_with_exit_4() {
    let dir = TempDir::new().unwrap();
    write_ts_project(&dir);
    smem(&dir)
        .args(["index-code", "--path", "./src", "--include", "**/*.ts"])
        .assert()
        .success();
    smem(&dir)
        .args([
            "export-context",
            "--out",
            "./bundle.smemctx",
            "--type",
            "code",
            "--sign",
        ])
        .assert()
        .success();

    // Flip one byte in vectors.f32.
    let vec_path = dir.path().join("bundle.smemctx/vectors.f32");
    let mut bytes = std::fs::read(&vec_path).unwrap();
    bytes[0] ^= 0xff;
    std::fs::write(&vec_path, &bytes).unwrap();

    smem(&dir)
        .args(["import-context", "./bundle.smemctx"])
        .assert()
        .failure()
        .code(4)
        .stderr(predicate::str::contains("checksum mismatch"));
}

#[test]
fn export_import_roundtrip_on_clean_project() {
    let dir = TempDir::new().unwrap();
    write_ts_project(&dir);
    smem(&dir)
        .args(["index-code", "--path", "./src", "--include", "**/*.ts", "--symbols"])
        .assert()
        .success();
    smem(&dir)
        .args(["export-context", "--out", "./bundle.smemctx", "--type", "code", "--no-sign"])
        .assert()
        .success();

    let clean = TempDir::new().unwrap();
    let bundle = dir.path().join("bundle.smemctx");
    let import = smem(&clean)
        .args(["import-context", bundle.to_str().unwrap(), "--json"])
        .output()
        .unwrap();
    assert!(import.status.success());
    let payload: serde_json::Value = serde_json::from_slice(&import.stdout).unwrap();
    assert!(payload["chunks"].as_u64().unwrap() > 0);
    assert_eq!(payload["vectors"], payload["chunks"]);
}

// ============================================================================
// Scenario 5: requireSignedContext + trust token
// ============================================================================

#[test]
fn unsigned_import_denied_then_allowed_via_trust_token() {
    let producer = TempDir::new().unwrap();
    write_ts_project(&producer);
    smem(&producer)
        .args(["index-code", "--path", "./src", "--include", "**/*.ts"])
        .assert()
        .success();
    smem(&producer)
        .args(["export-context", "--out", "./bundle.smemctx", "--type", "code", "--no-sign"])
        .assert()
        .success();
    let bundle = producer.path().join("bundle.smemctx");

    let consumer = TempDir::new().unwrap();
    smem(&consumer).arg("init").assert().success();
    set_policy_field(&consumer, "requireSignedContext", serde_json::json!(true));

    // Unsigned bundle refused.
    smem(&consumer)
        .args(["import-context", bundle.to_str().unwrap()])
        .assert()
        .failure()
        .code(3)
        .stderr(predicate::str::contains("SignatureRequired"));

    // --allow-unsigned alone is not enough.
    smem(&consumer)
        .args(["import-context", bundle.to_str().unwrap(), "--allow-unsigned"])
        .assert()
        .failure()
        .code(3);

    // Token + override: accepted.
    smem(&consumer)
        .args(["policy", "trust", "import-context", "--minutes", "1"])
        .assert()
        .success();
    smem(&consumer)
        .args(["import-context", bundle.to_str().unwrap(), "--allow-unsigned"])
        .assert()
        .success();
}

// ============================================================================
// Scenario 6: secure mode at-rest encryption
// ============================================================================

#[test]
fn secure_mode_encrypts_on_close_and_decrypts_on_open() {
    let dir = TempDir::new().unwrap();
    smem(&dir)
        .env("SMEM_SECURE", "1")
        .args(["remember", "x"])
        .assert()
        .success();

    assert!(dir.path().join(".securamem/memory.db.enc").exists());
    assert!(!dir.path().join(".securamem/memory.db").exists());

    let status = smem(&dir)
        .env("SMEM_SECURE", "1")
        .args(["status", "--json"])
        .output()
        .unwrap();
    assert!(status.status.success());
    let payload: serde_json::Value = serde_json::from_slice(&status.stdout).unwrap();
    assert!(payload["memoryCount"].as_u64().unwrap() >= 1);
}

// ============================================================================
// Audit plane invariants
// ============================================================================

#[test]
fn every_side_effecting_command_writes_receipt_and_journal_line() {
    let dir = TempDir::new().unwrap();
    smem(&dir).args(["remember", "audited"]).assert().success();

    let journal = std::fs::read_to_string(dir.path().join(".securamem/journal.jsonl")).unwrap();
    let lines: Vec<&str> = journal.lines().collect();
    assert_eq!(lines.len(), 1);

    let entry: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(entry["cmd"], "remember");
    let receipt_rel = entry["receipt"].as_str().unwrap();
    let receipt_path = dir.path().join(receipt_rel);
    assert!(receipt_path.exists(), "journal references a real receipt");

    let receipt: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(receipt_path).unwrap()).unwrap();
    assert_eq!(receipt["schema"], "v1");
    assert_eq!(receipt["command"], "remember");
    assert_eq!(receipt["success"], true);
    assert!(receipt["digests"]["argsSha256"].as_str().unwrap().len() == 64);
}

#[test]
fn failed_command_still_writes_failure_receipt() {
    let dir = TempDir::new().unwrap();
    smem(&dir)
        .args(["import-context", "./does-not-exist.smemctx"])
        .assert()
        .failure();

    let journal = std::fs::read_to_string(dir.path().join(".securamem/journal.jsonl")).unwrap();
    let entry: serde_json::Value = serde_json::from_str(journal.lines().next().unwrap()).unwrap();
    assert!(entry["error"].as_str().is_some());
    let receipt_path = dir.path().join(entry["receipt"].as_str().unwrap());
    let receipt: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(receipt_path).unwrap()).unwrap();
    assert_eq!(receipt["success"], false);
    assert!(!receipt["error"].as_str().unwrap().is_empty());
}

// ============================================================================
// Policy gates
// ============================================================================

#[test]
fn command_not_in_allowlist_exits_2() {
    let dir = TempDir::new().unwrap();
    smem(&dir).arg("init").assert().success();
    set_policy_field(&dir, "allowedCommands", serde_json::json!(["status"]));

    smem(&dir)
        .arg("gc")
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("PolicyDenied"));

    // help/version stay allowed.
    smem(&dir).arg("--help").assert().success();
    smem(&dir).arg("--version").assert().success();
}

#[test]
fn path_outside_allowed_globs_exits_2() {
    let dir = TempDir::new().unwrap();
    write_ts_project(&dir);
    smem(&dir).arg("init").assert().success();
    set_policy_field(&dir, "allowedGlobs", serde_json::json!(["docs/**"]));

    smem(&dir)
        .args(["index-code", "--path", "./src"])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("PolicyDenied"));
}

// ============================================================================
// Journal / replay / receipts
// ============================================================================

#[test]
fn replay_defaults_to_dry_run() {
    let dir = TempDir::new().unwrap();
    smem(&dir).args(["remember", "replay me"]).assert().success();

    smem(&dir)
        .args(["replay", "--last"])
        .assert()
        .success()
        .stdout(predicate::str::contains("dry-run"));

    // Dry-run replay did not duplicate the memory.
    let status = smem(&dir).args(["status", "--json"]).output().unwrap();
    let payload: serde_json::Value = serde_json::from_slice(&status.stdout).unwrap();
    assert_eq!(payload["memoryCount"], 1);
}

#[test]
fn journal_show_and_clear() {
    let dir = TempDir::new().unwrap();
    smem(&dir).args(["remember", "one"]).assert().success();
    smem(&dir)
        .args(["journal", "--show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("remember"));
    smem(&dir).args(["journal", "--clear"]).assert().success();
    smem(&dir)
        .args(["journal", "--show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("journal is empty"));
}

#[test]
fn receipt_show_last() {
    let dir = TempDir::new().unwrap();
    smem(&dir).args(["remember", "receipted"]).assert().success();
    smem(&dir)
        .args(["receipt-show", "--last", "--limit", "5"])
        .assert()
        .success()
        .stdout(predicate::str::contains("remember"));
}

// ============================================================================
// Offline proof and misc surface
// ============================================================================

#[test]
fn prove_offline_prints_proof_line() {
    let dir = TempDir::new().unwrap();
    smem(&dir)
        .arg("prove-offline")
        .assert()
        .success()
        .stdout(predicate::str::contains("offline-proof"));

    let output = smem(&dir)
        .args(["prove-offline", "--json"])
        .output()
        .unwrap();
    let payload: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(payload["offline"], true);
    assert_eq!(payload["networkEgress"], false);
}

#[test]
fn vector_status_reports_backend() {
    let dir = TempDir::new().unwrap();
    smem(&dir).args(["remember", "seed"]).assert().success();
    let output = smem(&dir)
        .args(["vector-status", "--json"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let payload: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(payload["backend"], "in-process-cosine");
}

#[test]
fn digest_cache_list_and_clear() {
    let dir = TempDir::new().unwrap();
    write_ts_project(&dir);
    smem(&dir)
        .args(["index-code", "--path", "./src", "--include", "**/*.ts"])
        .assert()
        .success();
    smem(&dir)
        .args(["digest-cache", "--list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Trace.ts"));
    smem(&dir)
        .args(["digest-cache", "--clear"])
        .assert()
        .success()
        .stdout(predicate::str::contains("cleared"));
}

#[test]
fn reindex_file_refreshes_digest() {
    let dir = TempDir::new().unwrap();
    write_ts_project(&dir);
    smem(&dir)
        .args(["reindex-file", "src/Trace.ts", "--symbols"])
        .assert()
        .success()
        .stdout(predicate::str::contains("chunks"));
    smem(&dir)
        .args(["digest-cache", "--list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("src/Trace.ts"));
}

#[test]
fn unknown_command_fails() {
    let dir = TempDir::new().unwrap();
    smem(&dir)
        .arg("nonexistent-command")
        .assert()
        .failure()
        .stderr(predicate::str::contains("error"));
}
