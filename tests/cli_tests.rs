/// CLI tests: exercise the `mnemon` binary end to end against a temp state
/// directory, including the documented exit codes (0 success, 1 user
/// error, 2 internal error).
use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn mnemon(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("mnemon").unwrap();
    cmd.arg("--state-dir").arg(dir.path());
    cmd.env_remove("MEMORY_STATE_DIR");
    cmd
}

#[test]
fn test_remember_then_recall() {
    let dir = TempDir::new().unwrap();

    mnemon(&dir)
        .args([
            "remember",
            "cargo nextest runs tests in parallel processes",
            "--type",
            "technique",
            "--tags",
            "rust,testing",
            "--importance",
            "0.8",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("OK"));

    mnemon(&dir)
        .args(["recall", "nextest", "--limit", "5"])
        .assert()
        .success()
        .stdout(predicate::str::contains("cargo nextest"));
}

#[test]
fn test_stats_on_fresh_store() {
    let dir = TempDir::new().unwrap();
    mnemon(&dir)
        .arg("stats")
        .assert()
        .success()
        .stdout(predicate::str::contains("items:"))
        .stdout(predicate::str::contains("policy versions: 3"));
}

#[test]
fn test_get_unknown_id_is_user_error() {
    let dir = TempDir::new().unwrap();
    mnemon(&dir)
        .args(["get", "no-such-id"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn test_invalid_ttl_is_user_error() {
    let dir = TempDir::new().unwrap();
    mnemon(&dir)
        .args(["remember", "short lived", "--ttl", "14d"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("ttl"));
}

#[test]
fn test_unknown_flag_is_user_error() {
    let dir = TempDir::new().unwrap();
    mnemon(&dir)
        .args(["recall", "query", "--frobnicate"])
        .assert()
        .code(1);
}

#[test]
fn test_snapshot_writes_state_file() {
    let dir = TempDir::new().unwrap();
    mnemon(&dir).arg("snapshot").assert().success();
    assert!(dir.path().join("state.json").exists());
}

#[test]
fn test_list_policy_versions() {
    let dir = TempDir::new().unwrap();
    mnemon(&dir)
        .arg("list-policy-versions")
        .assert()
        .success()
        .stdout(predicate::str::contains("3 versions"))
        .stdout(predicate::str::contains("recallScore"));
}

#[test]
fn test_associate_and_describe() {
    let dir = TempDir::new().unwrap();

    let out = mnemon(&dir)
        .args(["remember", "first note about pipelines", "--tags", "ci"])
        .output()
        .unwrap();
    let id_a = extract_id(&out.stdout);
    let out = mnemon(&dir)
        .args(["remember", "second note about pipelines", "--tags", "ci"])
        .output()
        .unwrap();
    let id_b = extract_id(&out.stdout);

    mnemon(&dir)
        .args(["associate", &id_a, &id_b, "--weight", "0.7"])
        .assert()
        .success()
        .stdout(predicate::str::contains("0.7"));

    mnemon(&dir)
        .arg("describe")
        .assert()
        .success()
        .stdout(predicate::str::contains("items"));
}

fn extract_id(stdout: &[u8]) -> String {
    let text = String::from_utf8_lossy(stdout);
    text.lines()
        .find_map(|line| line.trim().strip_prefix("id: "))
        .expect("remember output carries an id")
        .trim()
        .to_string()
}
