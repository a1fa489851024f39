use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixListener;
use std::path::Path;
use std::process::Command;

use assert_cmd::prelude::*;
use predicates::str::contains;
use serde_json::Value;
use tempfile::TempDir;

use mirrorsync_core::{
    config, registry, Direction, ErrorCategory, JobId, JobStatus, PairId, RemoteTarget, ScopeKey,
    SyncJob, TargetId,
};
use mirrorsync_engine::{FileStateStore, StateStore};

fn mirrorsync_cmd(home: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("mirrorsync"));
    cmd.env("HOME", home).env("USERPROFILE", home);
    cmd
}

/// Two targets behind a closed port, one pair, one mirror, no retries.
fn seed(home: &Path, mirror_flags: &[&str]) {
    for id in ["home", "edge"] {
        registry::save_target_at(
            home,
            &RemoteTarget {
                id: TargetId::from(id),
                base_url: "http://127.0.0.1:1/api/v4".to_string(),
                credential: mirrorsync_core::CredentialHandle("MIRRORSYNC_TEST_TOKEN".into()),
                label: None,
            },
        )
        .expect("save target");
    }
    let config_path = config::config_path_at(home);
    fs::write(
        &config_path,
        "limiter:\n  min_interval_ms: 0\n  max_retries: 0\nbatch_item_delay_ms: 0\n",
    )
    .expect("write config");

    mirrorsync_cmd(home)
        .args(["pair", "add", "home-to-edge", "--source", "home", "--target", "edge"])
        .assert()
        .success();
    let mut args = vec!["mirror", "add", "home-to-edge", "7", "team/api"];
    args.extend_from_slice(mirror_flags);
    mirrorsync_cmd(home).args(args).assert().success();
}

fn status_json(home: &Path) -> Value {
    let output = mirrorsync_cmd(home)
        .args(["status", "--json"])
        .output()
        .expect("run status");
    assert!(output.status.success());
    serde_json::from_slice(&output.stdout).expect("status json")
}

#[test]
fn status_lists_never_synced_mirror() {
    let home = TempDir::new().expect("home");
    seed(home.path(), &[]);

    let status = status_json(home.path());
    assert_eq!(status["summary"]["mirrors"], 1);
    assert_eq!(status["summary"]["due"], 1);
    let scope = &status["scopes"][0];
    assert_eq!(scope["scope"]["pair_id"], "home-to-edge");
    assert_eq!(scope["scope"]["direction"], "push");
    assert_eq!(scope["due"]["signal"], "never_synced");
    assert!(scope["checkpoint"].is_null());

    mirrorsync_cmd(home.path())
        .arg("status")
        .assert()
        .success()
        .stdout(contains("HOME-TO-EDGE"))
        .stdout(contains("NEVER SYNCED"));
}

#[test]
fn status_on_empty_home_reports_nothing() {
    let home = TempDir::new().expect("home");
    mirrorsync_cmd(home.path())
        .arg("status")
        .assert()
        .success()
        .stdout(contains("No mirrors configured."));
}

#[test]
fn unreachable_target_fails_the_run_and_records_it() {
    let home = TempDir::new().expect("home");
    seed(home.path(), &[]);

    mirrorsync_cmd(home.path())
        .args(["sync", "home-to-edge", "--project", "7", "--local"])
        .assert()
        .failure()
        .stdout(contains("upsert_mirror failed for team/api"));

    let status = status_json(home.path());
    let checkpoint = &status["scopes"][0]["checkpoint"];
    assert_eq!(checkpoint["last_sync_status"], "failed");
    assert_eq!(checkpoint["consecutive_failures"], 1);
    assert_eq!(checkpoint["last_error"]["category"], "transient");
    assert_eq!(status["summary"]["failing"], 1);
}

#[test]
fn disabled_mirror_without_remote_state_syncs_offline() {
    let home = TempDir::new().expect("home");
    seed(home.path(), &["--disabled"]);

    mirrorsync_cmd(home.path())
        .args(["sync", "home-to-edge", "--local"])
        .assert()
        .success()
        .stdout(contains("1 succeeded"));

    let status = status_json(home.path());
    assert_eq!(status["scopes"][0]["due"]["signal"], "disabled");
    assert_eq!(status["scopes"][0]["checkpoint"]["last_sync_status"], "succeeded");
}

#[test]
fn sync_of_unmirrored_project_errors() {
    let home = TempDir::new().expect("home");
    seed(home.path(), &[]);

    mirrorsync_cmd(home.path())
        .args(["sync", "home-to-edge", "--project", "99", "--local"])
        .assert()
        .failure()
        .stderr(contains("project 99 is not mirrored by 'home-to-edge'"));
}

#[test]
fn daemon_queries_without_a_daemon() {
    let home = TempDir::new().expect("home");

    mirrorsync_cmd(home.path())
        .args(["daemon", "status"])
        .assert()
        .success()
        .stdout(contains("\"running\": false"));
    mirrorsync_cmd(home.path())
        .args(["daemon", "stop"])
        .assert()
        .success()
        .stdout(contains("daemon is not running"));
    mirrorsync_cmd(home.path())
        .args(["conflicts", "--json"])
        .assert()
        .success()
        .stdout(contains("[]"));
    mirrorsync_cmd(home.path())
        .args(["daemon", "logs"])
        .assert()
        .success()
        .stdout(contains("log file not found"));
}

#[test]
fn local_sync_finalizes_jobs_left_running() {
    let home = TempDir::new().expect("home");
    seed(home.path(), &["--disabled"]);
    let store = FileStateStore::at(home.path(), 500);
    let job: SyncJob = serde_json::from_value(serde_json::json!({
        "id": "left-running",
        "scope": { "pair_id": "home-to-edge", "direction": "push", "project_id": 7 },
        "source_instance_id": "home",
        "target_instance_id": "edge",
        "status": "running",
        "started_at": "2026-01-01T00:00:00Z",
    }))
    .expect("job json");
    store.save_job(&job).expect("save job");

    mirrorsync_cmd(home.path())
        .args(["sync", "home-to-edge", "--local"])
        .assert()
        .success()
        .stderr(contains("finalized 1 job(s)"))
        .stdout(contains("1 succeeded"));

    let jobs = store.load_jobs().expect("jobs");
    let left = jobs
        .iter()
        .find(|j| j.id == JobId::from("left-running"))
        .expect("journaled job");
    assert_eq!(left.status, JobStatus::Failed);
    assert_eq!(
        left.error.as_ref().map(|e| e.category),
        Some(ErrorCategory::Interrupted)
    );
    assert!(jobs.iter().all(|j| j.status.is_terminal()));
}

#[test]
fn mirror_remove_drops_only_its_checkpoint() {
    let home = TempDir::new().expect("home");
    seed(home.path(), &["--disabled"]);
    mirrorsync_cmd(home.path())
        .args(["mirror", "add", "home-to-edge", "8", "team/web", "--disabled"])
        .assert()
        .success();
    mirrorsync_cmd(home.path())
        .args(["sync", "home-to-edge", "--local"])
        .assert()
        .success()
        .stdout(contains("2 succeeded"));
    let store = FileStateStore::at(home.path(), 500);
    assert_eq!(
        store.load_checkpoints(&PairId::from("home-to-edge")).expect("load").len(),
        2
    );

    mirrorsync_cmd(home.path())
        .args(["mirror", "remove", "home-to-edge", "7"])
        .assert()
        .success()
        .stdout(contains("Removed project 7"));

    let left = store.load_checkpoints(&PairId::from("home-to-edge")).expect("load");
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].scope, ScopeKey::new("home-to-edge", Direction::Push, 8));
}

#[test]
fn pair_remove_drops_its_checkpoints() {
    let home = TempDir::new().expect("home");
    seed(home.path(), &["--disabled"]);
    mirrorsync_cmd(home.path())
        .args(["sync", "home-to-edge", "--local"])
        .assert()
        .success();
    let store = FileStateStore::at(home.path(), 500);
    assert!(store
        .load_checkpoint(&ScopeKey::new("home-to-edge", Direction::Push, 7))
        .expect("load")
        .is_some());

    mirrorsync_cmd(home.path())
        .args(["pair", "remove", "home-to-edge"])
        .assert()
        .success()
        .stdout(contains("Removed pair 'home-to-edge'"));

    assert!(store
        .load_checkpoints(&PairId::from("home-to-edge"))
        .expect("load")
        .is_empty());
    // A pair re-added under the same id starts from scratch.
    mirrorsync_cmd(home.path())
        .args(["pair", "add", "home-to-edge", "--source", "home", "--target", "edge"])
        .assert()
        .success();
    mirrorsync_cmd(home.path())
        .args(["mirror", "add", "home-to-edge", "7", "team/api"])
        .assert()
        .success();
    assert_eq!(status_json(home.path())["scopes"][0]["due"]["signal"], "never_synced");
}

#[test]
fn local_sync_is_refused_while_the_daemon_answers() {
    let home = TempDir::new().expect("home");
    seed(home.path(), &[]);
    let socket = mirrorsync_daemon::paths::socket_path(home.path());
    fs::create_dir_all(socket.parent().expect("socket dir")).expect("socket dir");
    let listener = UnixListener::bind(&socket).expect("bind socket");
    let server = std::thread::spawn(move || {
        let (stream, _) = listener.accept().expect("accept");
        let mut reader = BufReader::new(stream.try_clone().expect("clone stream"));
        let mut line = String::new();
        reader.read_line(&mut line).expect("read request");
        let mut stream = stream;
        stream
            .write_all(b"{\"ok\":true,\"data\":{\"running\":true}}\n")
            .expect("write response");
        line
    });

    mirrorsync_cmd(home.path())
        .args(["sync", "home-to-edge", "--local"])
        .assert()
        .failure()
        .stderr(contains("the daemon is running"));

    let request = server.join().expect("server thread");
    assert!(request.contains("\"status\""));
    let store = FileStateStore::at(home.path(), 500);
    assert!(store.load_jobs().expect("jobs").is_empty(), "nothing ran locally");
}
