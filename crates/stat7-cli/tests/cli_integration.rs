use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use serde_json::Value;
use ulid::Ulid;

/// SHA-256 of the token "abc".
const ABC_TOKEN_SHA256: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";
const SCENARIO_POLARITY: &str = "0.1,0.1,0.1,0.1,0.1,0.1,0.1";

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("{prefix}-{}", Ulid::new()));
    fs::create_dir_all(&dir)
        .unwrap_or_else(|err| panic!("failed to create temp dir {}: {err}", dir.display()));
    dir
}

fn run_s7<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_s7"))
        .args(args)
        .env("S7_LOG", "warn")
        .output()
        .unwrap_or_else(|err| panic!("failed to execute s7 binary: {err}"))
}

fn parse_stdout(output: &Output) -> Value {
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

fn run_json<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_s7(args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "s7 command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }
    parse_stdout(&output)
}

fn as_i64(value: &Value, key: &str) -> i64 {
    value
        .get(key)
        .and_then(Value::as_i64)
        .unwrap_or_else(|| panic!("missing integer field `{key}` in payload: {value}"))
}

fn as_str<'a>(value: &'a Value, key: &str) -> &'a str {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing string field `{key}` in payload: {value}"))
}

fn as_array<'a>(value: &'a Value, key: &str) -> &'a Vec<Value> {
    value
        .get(key)
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("missing array field `{key}` in payload: {value}"))
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

fn write_config(dir: &Path, rate_limit: u32) -> PathBuf {
    let path = dir.join("stat7.yaml");
    let body = format!(
        "identity:\n  provider: static\n  identities:\n    - token_sha256: {ABC_TOKEN_SHA256}\n      subject: alice\n      roles: [owner]\n\
         gate:\n  policies:\n    PUBLIC:\n      allowed_roles: [owner]\n      rate_limit_per_hour: {rate_limit}\n      default_capability: FULL\n"
    );
    fs::write(&path, body)
        .unwrap_or_else(|err| panic!("failed to write config {}: {err}", path.display()));
    path
}

struct Workspace {
    dir: PathBuf,
    db: PathBuf,
    config: PathBuf,
}

impl Workspace {
    fn new(prefix: &str, rate_limit: u32) -> Self {
        let dir = unique_temp_dir(prefix);
        let db = dir.join("stat7.sqlite3");
        let config = write_config(&dir, rate_limit);
        Self { dir, db, config }
    }

    fn args<'a>(&'a self, rest: &[&'a str]) -> Vec<&'a str> {
        let mut args = vec!["--db", path_str(&self.db), "--config", path_str(&self.config)];
        args.extend_from_slice(rest);
        args
    }

    fn add_scenario_record(&self, payload: &str) -> String {
        let added = run_json(self.args(&[
            "record",
            "add",
            "--realm",
            "data",
            "--luminosity",
            "1.0",
            "--polarity",
            SCENARIO_POLARITY,
            "--payload",
            payload,
            "--owner",
            "alice",
        ]));
        assert_eq!(as_str(&added, "outcome"), "inserted");
        as_str(&added["record"], "address").to_string()
    }

    fn recover(&self, address: &str) -> Output {
        run_s7(self.args(&[
            "recover",
            "--bitchain-id",
            address,
            "--token",
            "abc",
            "--requester",
            "alice",
        ]))
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.dir);
    }
}

// Test IDs: TCLI-001
#[test]
fn cli_migrate_reports_schema_versions() {
    let ws = Workspace::new("s7-cli-migrate", 10);

    let dry_run = run_json(ws.args(&["db", "migrate", "--dry-run"]));
    assert_eq!(as_str(&dry_run, "contract_version"), "cli.v1");
    assert_eq!(as_i64(&dry_run, "current_version"), 0);
    assert!(!as_array(&dry_run, "would_apply_versions").is_empty());

    let applied = run_json(ws.args(&["db", "migrate"]));
    assert_eq!(applied.get("up_to_date"), Some(&Value::Bool(true)));

    let status = run_json(ws.args(&["db", "schema-version"]));
    assert_eq!(status.get("up_to_date"), Some(&Value::Bool(true)));
    assert_eq!(
        as_i64(&status, "current_version"),
        as_i64(&status, "target_version")
    );
}

// Test IDs: TCLI-002
#[test]
fn cli_end_to_end_add_show_recover_and_audit() {
    let ws = Workspace::new("s7-cli-e2e", 10);

    let addressed = run_json(ws.args(&[
        "record",
        "address",
        "--realm",
        "data",
        "--luminosity",
        "1.0",
        "--polarity",
        SCENARIO_POLARITY,
        "--payload",
        "hello",
    ]));
    let address = ws.add_scenario_record("hello");
    assert_eq!(as_str(&addressed, "address"), address);
    assert_eq!(address.len(), 64);

    let shown = run_json(ws.args(&["record", "show", "--address", &address]));
    assert_eq!(as_str(&shown, "payload"), "aGVsbG8=");
    assert_eq!(as_str(&shown, "classification"), "PUBLIC");

    let output = ws.recover(&address);
    assert!(output.status.success(), "recover should exit cleanly");
    let outcome = parse_stdout(&output);
    assert_eq!(as_str(&outcome, "outcome"), "released");
    assert_eq!(as_str(&outcome, "capability_level"), "FULL");
    assert_eq!(as_str(&outcome["data"], "payload"), "aGVsbG8=");

    let audit = run_json(ws.args(&["audit", "list"]));
    let events = as_array(&audit, "events");
    assert_eq!(events.len(), 1);
    assert_eq!(as_str(&events[0], "result"), "SUCCESS");
    assert_eq!(as_str(&events[0], "bitchain_id"), address);
}

// Test IDs: TCLI-003
#[test]
fn cli_rate_limit_holds_across_invocations() {
    let ws = Workspace::new("s7-cli-rate", 2);
    let address = ws.add_scenario_record("hello");

    for _ in 0..2 {
        assert!(ws.recover(&address).status.success());
    }
    let third = ws.recover(&address);
    assert_eq!(third.status.code(), Some(2));
    let denied = parse_stdout(&third);
    assert_eq!(as_str(&denied, "outcome"), "denied");
    assert_eq!(as_str(&denied, "kind"), "RateLimitExceeded");

    let wrong_token = run_s7(ws.args(&[
        "recover",
        "--bitchain-id",
        &address,
        "--token",
        "not-the-token",
        "--requester",
        "alice",
    ]));
    assert_eq!(as_str(&parse_stdout(&wrong_token), "kind"), "AuthenticationFailure");

    let audit = run_json(ws.args(&["audit", "list", "--requester", "alice"]));
    assert_eq!(as_array(&audit, "events").len(), 4);
}

// Test IDs: TCLI-004
#[test]
fn cli_derive_sweep_and_edges() {
    let ws = Workspace::new("s7-cli-entangle", 10);
    let root = ws.add_scenario_record("hello");
    let sibling = ws.add_scenario_record("hello again");

    let derived = run_json(ws.args(&[
        "record",
        "derive",
        "--parent",
        &root,
        "--rule",
        "compaction",
        "--target-luminosity",
        "0.5",
    ]));
    assert_eq!(as_str(&derived["record"], "parent"), root);
    assert_eq!(as_i64(&derived["record"]["coordinate"], "lineage"), 1);

    let missing_target = run_s7(ws.args(&["record", "derive", "--parent", &root, "--rule", "expansion"]));
    assert!(!missing_target.status.success());

    let listed = run_json(ws.args(&["record", "list", "--realm", "data"]));
    assert_eq!(as_array(&listed, "records").len(), 3);

    let scored = run_json(ws.args(&[
        "entangle", "score", "--left", &root, "--right", &sibling, "--threshold", "0.5",
    ]));
    assert_eq!(scored.get("entangled"), Some(&Value::Bool(true)));

    let swept = run_json(ws.args(&["entangle", "sweep", "--threshold", "0.5", "--persist"]));
    assert_eq!(as_i64(&swept, "records"), 3);
    assert_eq!(as_i64(&swept, "pairs_scored"), 3);
    let persisted = as_i64(&swept, "persisted_edges");
    assert!(persisted >= 1);

    let edges = run_json(ws.args(&["entangle", "edges"]));
    assert_eq!(
        i64::try_from(as_array(&edges, "edges").len()).unwrap_or(i64::MAX),
        persisted
    );

    let adjacency = run_json(ws.args(&["record", "adjacency", "--address", &root]));
    assert!(as_array(&adjacency, "links").is_empty());
}

// Test IDs: TCLI-005
#[test]
fn cli_calibrates_on_synthetic_pairs() {
    let ws = Workspace::new("s7-cli-calibrate", 10);
    let calibrated = run_json(ws.args(&["entangle", "calibrate", "--seed", "11"]));
    assert_eq!(as_i64(&calibrated, "pairs"), 40);
    let selected = &calibrated["report"]["selected"];
    let precision = selected
        .get("precision")
        .and_then(Value::as_f64)
        .unwrap_or_else(|| panic!("missing precision: {calibrated}"));
    assert!(precision >= 0.90);
    assert!(as_array(&calibrated["report"], "pair_scores").is_empty());
}

// Test IDs: TCLI-006
#[test]
fn cli_export_backup_and_integrity_check() {
    let ws = Workspace::new("s7-cli-ops", 10);
    let _address = ws.add_scenario_record("hello");

    let export_dir = ws.dir.join("export");
    let exported = run_json(ws.args(&["db", "export", "--out", path_str(&export_dir)]));
    let files = as_array(&exported["manifest"], "files");
    assert!(!files.is_empty());
    assert!(export_dir.join("manifest.json").exists());

    let backup = ws.dir.join("backup.sqlite3");
    let backed_up = run_json(ws.args(&["db", "backup", "--out", path_str(&backup)]));
    assert_eq!(as_str(&backed_up, "status"), "ok");

    let report = run_json(ws.args(&["db", "integrity-check"]));
    assert_eq!(report.get("quick_check_ok"), Some(&Value::Bool(true)));
    assert!(as_array(&report, "address_mismatches").is_empty());

    let fresh_db = ws.dir.join("imported.sqlite3");
    let imported = run_json([
        "--db",
        path_str(&fresh_db),
        "db",
        "import",
        "--in",
        path_str(&export_dir),
    ]);
    assert_eq!(as_i64(&imported["summary"], "imported_records"), 1);
}

// Test IDs: TCLI-007
#[test]
fn cli_rejects_malformed_input() {
    let ws = Workspace::new("s7-cli-invalid", 10);
    let short_polarity = run_s7(ws.args(&[
        "record",
        "add",
        "--realm",
        "data",
        "--luminosity",
        "1.0",
        "--polarity",
        "0.1,0.2",
        "--payload",
        "x",
    ]));
    assert!(!short_polarity.status.success());

    let bad_address = run_s7(ws.args(&["record", "show", "--address", "xyz"]));
    assert!(!bad_address.status.success());

    let bad_config = ws.dir.join("bad.yaml");
    fs::write(&bad_config, "gate:\n  rate_window_secs: 0\n")
        .unwrap_or_else(|err| panic!("failed to write config: {err}"));
    let rejected = run_s7([
        "--db",
        path_str(&ws.db),
        "--config",
        path_str(&bad_config),
        "db",
        "schema-version",
    ]);
    assert!(!rejected.status.success());
}

// Test IDs: TCLI-008
#[test]
fn cli_logs_to_stderr_and_keeps_stdout_json() {
    let ws = Workspace::new("s7-cli-logging", 10);
    let address = ws.add_scenario_record("hello");

    let denied = Command::new(env!("CARGO_BIN_EXE_s7"))
        .args(ws.args(&[
            "recover",
            "--bitchain-id",
            address.as_str(),
            "--token",
            "tok-9f3a7c-unknown",
            "--requester",
            "alice",
        ]))
        .env("S7_LOG", "debug")
        .output()
        .unwrap_or_else(|err| panic!("failed to execute s7 binary: {err}"));
    assert_eq!(denied.status.code(), Some(2));
    assert_eq!(as_str(&parse_stdout(&denied), "kind"), "AuthenticationFailure");
    let stderr = String::from_utf8_lossy(&denied.stderr);
    assert!(stderr.contains("recover denied"), "stderr:\n{stderr}");
    assert!(
        !stderr.contains("tok-9f3a7c-unknown"),
        "auth token leaked into logs:\n{stderr}"
    );
}
