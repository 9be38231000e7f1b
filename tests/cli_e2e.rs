//! End-to-end CLI tests for the mediagrab binary.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, ResponseTemplate};

mod support;
use support::socket_guard::start_mock_server_or_skip;

/// Binary isolated from the user's config, data dir and log settings.
fn mediagrab(home: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("mediagrab").unwrap();
    cmd.env("XDG_CONFIG_HOME", home.path().join("config"))
        .env("XDG_DATA_HOME", home.path().join("data"))
        .env_remove("RUST_LOG")
        .arg("--db")
        .arg(home.path().join("state.db"));
    cmd
}

/// Test that --help displays usage information and exits with code 0.
#[test]
fn test_binary_help_displays_usage() {
    let mut cmd = Command::cargo_bin("mediagrab").unwrap();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Batch download media"))
        .stdout(predicate::str::contains("clear-history"));
}

/// Test that --version displays version and exits with code 0.
#[test]
fn test_binary_version_displays_version() {
    let mut cmd = Command::cargo_bin("mediagrab").unwrap();
    cmd.arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("mediagrab"));
}

/// Test that a missing subcommand causes non-zero exit.
#[test]
fn test_binary_without_subcommand_returns_error() {
    let mut cmd = Command::cargo_bin("mediagrab").unwrap();
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("Usage"));
}

#[test]
fn test_history_on_fresh_database() {
    let home = TempDir::new().unwrap();
    mediagrab(&home)
        .arg("history")
        .assert()
        .success()
        .stdout(predicate::str::contains("No batches recorded."));
}

#[test]
fn test_fetch_without_input_is_a_no_op() {
    let home = TempDir::new().unwrap();
    mediagrab(&home)
        .arg("fetch")
        .write_stdin("")
        .assert()
        .success()
        .stdout(predicate::str::is_empty());
}

#[test]
fn test_dry_run_lists_and_records_batch() {
    let home = TempDir::new().unwrap();
    let out = home.path().join("out");

    mediagrab(&home)
        .args(["-q", "fetch", "--dry-run", "-o"])
        .arg(&out)
        .arg("https://cdn.example.invalid/a.jpg")
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "would download  https://cdn.example.invalid/a.jpg",
        ));
    assert!(!out.join("a.jpg").exists());

    mediagrab(&home)
        .arg("history")
        .assert()
        .success()
        .stdout(predicate::str::contains("0/1 completed"));
}

#[test]
fn test_dry_run_json_report_from_stdin() {
    let home = TempDir::new().unwrap();
    mediagrab(&home)
        .args(["-q", "fetch", "--dry-run", "--json"])
        .write_stdin("# list\nhttps://cdn.example.invalid/a.jpg\n\nftp://files.example.invalid/b.jpg\n")
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""reason": "dry_run""#))
        .stdout(predicate::str::contains(r#""kind": "unsupported_url""#));
}

#[test]
fn test_invalid_config_file_is_reported() {
    let home = TempDir::new().unwrap();
    let config = home.path().join("bad.toml");
    std::fs::write(&config, "wrokers = 4\n").unwrap();

    mediagrab(&home)
        .arg("--config")
        .arg(&config)
        .arg("history")
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to parse config file"));
}

#[test]
fn test_out_of_range_config_rejected_on_fetch() {
    let home = TempDir::new().unwrap();
    let config = home.path().join("config.toml");
    std::fs::write(&config, "workers = 99\n").unwrap();

    mediagrab(&home)
        .arg("--config")
        .arg(&config)
        .args(["fetch", "--dry-run", "https://cdn.example.invalid/a.jpg"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("workers"));
}

#[test]
fn test_forget_unknown_url() {
    let home = TempDir::new().unwrap();
    mediagrab(&home)
        .args(["forget", "https://cdn.example.invalid/a.jpg"])
        .assert()
        .success()
        .stdout(predicate::str::contains("not recorded"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_fetch_download_skip_forget_cycle() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path("/photo.jpg"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"jpeg-bytes".as_slice()))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/missing.jpg"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let home = TempDir::new().unwrap();
    let out = home.path().join("out");
    let photo = format!("{}/photo.jpg", server.uri());
    let missing = format!("{}/missing.jpg", server.uri());

    // The mock server runs on its own threads, so blocking here is fine.
    let run = |args: Vec<String>| mediagrab(&home).arg("-q").args(args).assert();
    let fetch = |url: &str| {
        vec![
            "fetch".to_string(),
            "-o".to_string(),
            out.display().to_string(),
            url.to_string(),
        ]
    };

    run(fetch(&photo))
        .success()
        .stdout(predicate::str::contains("1 completed"));
    assert_eq!(std::fs::read(out.join("photo.jpg")).unwrap(), b"jpeg-bytes");

    run(fetch(&photo))
        .success()
        .stdout(predicate::str::contains("(already downloaded)"));

    run(vec!["forget".to_string(), photo.clone()])
        .success()
        .stdout(predicate::str::contains("forgot"));

    run(fetch(&missing))
        .code(1)
        .stdout(predicate::str::contains("failed  "))
        .stdout(predicate::str::contains("http_4xx"));

    run(vec!["clear-history".to_string()])
        .success()
        .stdout(predicate::str::contains("batch report(s)"));
}

#[test]
fn test_schedule_add_list_disable_remove() {
    let home = TempDir::new().unwrap();
    let run = |args: &[&str]| mediagrab(&home).arg("-q").args(args).assert();

    run(&["schedule", "list"])
        .success()
        .stdout(predicate::str::contains("No jobs scheduled."));

    run(&[
        "schedule",
        "add",
        "--id",
        "feed",
        "--every",
        "interval",
        "--interval-minutes",
        "15",
        "--start-in-minutes",
        "60",
        "https://cdn.example.invalid/a.jpg",
    ])
    .success()
    .stdout(predicate::str::contains("scheduled feed (interval)"));

    run(&["schedule", "add", "--id", "feed", "https://cdn.example.invalid/b.jpg"])
        .failure()
        .stderr(predicate::str::contains("already exists"));

    run(&["schedule", "disable", "feed"]).success();
    run(&["schedule", "list"])
        .success()
        .stdout(predicate::str::contains("feed  every 15m"))
        .stdout(predicate::str::contains("(disabled)"));

    run(&["schedule", "enable", "missing"])
        .failure()
        .stderr(predicate::str::contains("no job named missing"));

    run(&["schedule", "remove", "feed"]).success();
    run(&["schedule", "remove", "feed"]).failure();
    run(&["schedule", "list"])
        .success()
        .stdout(predicate::str::contains("No jobs scheduled."));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_schedule_run_now_records_events_and_delete_batch() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path("/photo.jpg"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"jpeg-bytes".as_slice()))
        .mount(&server)
        .await;

    let home = TempDir::new().unwrap();
    let photo = format!("{}/photo.jpg", server.uri());
    let run = |args: &[&str]| {
        mediagrab(&home)
            .current_dir(home.path())
            .arg("-q")
            .args(args)
            .assert()
    };

    run(&["schedule", "add", "--id", "once", "--start-in-minutes", "600", &photo]).success();
    run(&["schedule", "run-now", "once"])
        .success()
        .stdout(predicate::str::contains("1 completed"));
    assert_eq!(
        std::fs::read(home.path().join("photo.jpg")).unwrap(),
        b"jpeg-bytes"
    );

    let listing = run(&["schedule", "list"]).success().get_output().stdout.clone();
    let listing = String::from_utf8(listing).unwrap();
    assert!(listing.contains("(disabled)"), "{listing}");
    let batch = listing
        .split("last batch ")
        .nth(1)
        .and_then(|rest| rest.split_whitespace().next())
        .unwrap()
        .to_string();

    run(&["history", "--batch", &batch, "--events"])
        .success()
        .stdout(predicate::str::contains("submitted"))
        .stdout(predicate::str::contains("task_completed"))
        .stdout(predicate::str::contains("finished"));

    run(&["delete-batch", &batch])
        .success()
        .stdout(predicate::str::contains("deleted batch"));
    run(&["history", "--batch", &batch])
        .failure()
        .stderr(predicate::str::contains("no batch named"));
    run(&["delete-batch", &batch]).failure();
}
