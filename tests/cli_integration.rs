use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::process::{Command, Output, Stdio};
use std::time::{Duration, Instant};

use agentmesh::meshpack::{self, SHARDS};
use serde_json::{Map, Value, json};
use tempfile::tempdir;

fn agentmesh(repo_root: &Path, args: &[&str]) -> Output {
    let binary = assert_cmd::cargo::cargo_bin!("agentmesh");
    let mut cmd = Command::new(binary);
    cmd.current_dir(repo_root);
    cmd.env_remove("AGENTMESH_AGENT");
    cmd.env_remove("AGENTMESH_ORCH_OWNER");
    cmd.env_remove("AGENTMESH_DATA_DIR");
    cmd.env_remove("RUST_LOG");
    cmd.args(args);
    cmd.output().expect("agentmesh command executes")
}

fn json_stdout(output: &Output) -> Value {
    serde_json::from_slice(&output.stdout).expect("stdout is JSON")
}

/// The error object is the last stderr line; log lines may precede it.
fn json_stderr(output: &Output) -> Value {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let last = stderr.lines().last().unwrap_or_default();
    serde_json::from_str(last).expect("stderr ends with a JSON error")
}

fn init(root: &Path) {
    let out = agentmesh(root, &["init"]);
    assert!(out.status.success(), "init failed: {out:?}");
}

#[test]
fn init_twice_is_refused() {
    let dir = tempdir().unwrap();
    init(dir.path());
    assert!(dir.path().join(".agentmesh").join("config.yaml").exists());

    assert_cmd::Command::new(assert_cmd::cargo::cargo_bin!("agentmesh"))
        .current_dir(dir.path())
        .env_remove("AGENTMESH_DATA_DIR")
        .arg("init")
        .assert()
        .failure()
        .code(1)
        .stderr(predicates::str::contains("already_initialized"));
}

#[test]
fn commands_outside_a_mesh_report_not_initialized() {
    let dir = tempdir().unwrap();
    let out = agentmesh(dir.path(), &["claims"]);
    assert_eq!(out.status.code(), Some(1));
    assert_eq!(json_stderr(&out)["error"], "not_initialized");
}

#[test]
fn second_claimant_gets_conflict_exit_code() {
    let dir = tempdir().unwrap();
    init(dir.path());

    let out = agentmesh(dir.path(), &["claim", "src/a.rs", "--agent", "alice", "--ttl", "600"]);
    assert!(out.status.success(), "{out:?}");
    assert_eq!(json_stdout(&out)["agent_id"], "alice");

    let out = agentmesh(dir.path(), &["claim", "src/a.rs", "--agent", "bob"]);
    assert_eq!(out.status.code(), Some(1));
    assert_eq!(json_stderr(&out)["error"], "claim_conflict");

    let out = agentmesh(dir.path(), &["check", "src/a.rs", "--agent", "bob"]);
    assert_eq!(out.status.code(), Some(1));
    let conflicts = json_stdout(&out);
    assert_eq!(conflicts.as_array().map(Vec::len), Some(1));
    assert_eq!(conflicts[0]["agent_id"], "alice");

    let out = agentmesh(dir.path(), &["release", "src/a.rs", "--agent", "alice"]);
    assert!(out.status.success(), "{out:?}");
    let out = agentmesh(dir.path(), &["check", "src/a.rs", "--agent", "bob"]);
    assert!(out.status.success());
}

#[test]
fn invalid_resource_exits_with_input_code() {
    let dir = tempdir().unwrap();
    init(dir.path());

    let out = agentmesh(dir.path(), &["claim", "PORT:", "--agent", "alice"]);
    assert_eq!(out.status.code(), Some(3));
    assert_eq!(json_stderr(&out)["error"], "invalid_resource");
}

#[test]
fn malformed_arguments_exit_with_input_code() {
    let dir = tempdir().unwrap();
    init(dir.path());

    let out = agentmesh(dir.path(), &["claim", "PORT:1", "--ttl", "abc"]);
    assert_eq!(out.status.code(), Some(3));
    let err = json_stderr(&out);
    assert_eq!(err["error"], "usage_error");
    assert!(err["message"].as_str().unwrap().contains("abc"));

    let out = agentmesh(dir.path(), &["--format", "pretty", "claim", "PORT:1", "--bogus"]);
    assert_eq!(out.status.code(), Some(3));
    assert!(String::from_utf8_lossy(&out.stderr).starts_with("error: "));

    let out = agentmesh(dir.path(), &["--help"]);
    assert_eq!(out.status.code(), Some(0));
    assert!(String::from_utf8_lossy(&out.stdout).contains("Usage"));
}

#[test]
fn queued_waiter_boosts_holder_until_release() {
    let dir = tempdir().unwrap();
    init(dir.path());

    let out = agentmesh(dir.path(), &["claim", "PORT:8080", "--agent", "alice", "--priority", "3"]);
    assert!(out.status.success(), "{out:?}");

    let binary = assert_cmd::cargo::cargo_bin!("agentmesh");
    let waiter = Command::new(binary)
        .current_dir(dir.path())
        .env_remove("AGENTMESH_AGENT")
        .env_remove("AGENTMESH_DATA_DIR")
        .args(["wait", "PORT:8080", "--agent", "bob", "--priority", "9", "--timeout", "30"])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    let queued = loop {
        let listed = json_stdout(&agentmesh(dir.path(), &["waiters", "PORT:8080"]));
        if listed.as_array().is_some_and(|w| !w.is_empty()) {
            break listed;
        }
        assert!(Instant::now() < deadline, "waiter never queued");
        std::thread::sleep(Duration::from_millis(50));
    };
    assert_eq!(queued[0]["agent_id"], "bob");
    assert_eq!(queued[0]["priority"], 9);

    let claims = json_stdout(&agentmesh(dir.path(), &["claims"]));
    assert_eq!(claims[0]["priority"], 3);
    assert_eq!(claims[0]["effective_priority"], 9);

    let out = agentmesh(dir.path(), &["release", "PORT:8080", "--agent", "alice"]);
    assert!(out.status.success(), "{out:?}");
    let done = waiter.wait_with_output().unwrap();
    assert!(done.status.success(), "{done:?}");
    let outcome = json_stdout(&done);
    assert_eq!(outcome["resource_id"], "PORT:8080");
    assert_eq!(outcome["queued"], true);

    let listed = json_stdout(&agentmesh(dir.path(), &["waiters"]));
    assert_eq!(listed, json!([]));
}

#[test]
fn out_of_range_priority_is_a_usage_error() {
    let dir = tempdir().unwrap();
    init(dir.path());
    let out = agentmesh(dir.path(), &["wait", "PORT:1", "--priority", "11", "--timeout", "0"]);
    assert_eq!(out.status.code(), Some(3));
    assert_eq!(json_stderr(&out)["error"], "usage_error");
}

#[test]
fn soft_check_reports_holders_importing_removed_symbols() {
    let dir = tempdir().unwrap();
    let repo = git2::Repository::init(dir.path()).unwrap();
    fs::write(dir.path().join("models.py"), "def load():\n    pass\n\ndef save():\n    pass\n").unwrap();
    fs::write(dir.path().join("app.py"), "from models import load, save\n").unwrap();
    let mut index = repo.index().unwrap();
    index.add_path(Path::new("models.py")).unwrap();
    index.add_path(Path::new("app.py")).unwrap();
    index.write().unwrap();
    let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
    let sig = git2::Signature::now("dev", "dev@example.com").unwrap();
    repo.commit(Some("HEAD"), &sig, &sig, "initial", &tree, &[]).unwrap();

    init(dir.path());
    let out = agentmesh(dir.path(), &["claim", "app.py", "--agent", "bob"]);
    assert!(out.status.success(), "{out:?}");

    fs::write(dir.path().join("models.py"), "def save():\n    pass\n").unwrap();

    let out = agentmesh(dir.path(), &["check", "models.py", "--agent", "alice", "--soft"]);
    assert!(out.status.success(), "{out:?}");
    let report = json_stdout(&out);
    assert_eq!(report["conflicts"], json!([]));
    let soft = report["soft_conflicts"].as_array().unwrap();
    assert_eq!(soft.len(), 1);
    assert_eq!(soft[0]["affected_agent"], "bob");
    assert_eq!(soft[0]["symbols"], json!(["load"]));
    assert!(soft[0]["affected_file"].as_str().unwrap().ends_with("app.py"));

    // Without --soft the output stays a plain list of hard conflicts.
    let out = agentmesh(dir.path(), &["check", "models.py", "--agent", "alice"]);
    assert_eq!(json_stdout(&out), json!([]));
}

#[test]
fn legacy_pack_is_refused_unless_accepted() {
    let dir = tempdir().unwrap();
    init(dir.path());

    let mut shards = BTreeMap::new();
    for name in SHARDS {
        shards.insert(name.to_string(), Vec::new());
    }
    let mut manifest: Map<String, Value> = Map::new();
    manifest.insert("episode_id".into(), json!("ep_legacy"));
    manifest.insert(
        "signature".into(),
        json!(meshpack::legacy_hmac("ep_legacy", &shards).unwrap()),
    );
    let pack = dir.path().join("old.meshpack");
    meshpack::write_pack(&pack, &manifest, &shards).unwrap();
    let pack = pack.to_str().unwrap();

    let out = agentmesh(dir.path(), &["episode", "verify", pack]);
    assert_eq!(out.status.code(), Some(2));
    assert_eq!(json_stderr(&out)["error"], "legacy_pack_rejected");

    let out = agentmesh(dir.path(), &["episode", "verify", pack, "--accept-legacy"]);
    assert!(out.status.success(), "{out:?}");
    assert_eq!(json_stdout(&out)["kind"], "legacy_hmac");
}

#[test]
fn witnessed_commit_verifies() {
    let dir = tempdir().unwrap();
    let repo = git2::Repository::init(dir.path()).unwrap();
    fs::write(dir.path().join("hello.txt"), "hello\n").unwrap();
    let mut index = repo.index().unwrap();
    index.add_path(Path::new("hello.txt")).unwrap();
    index.write().unwrap();

    init(dir.path());
    assert!(agentmesh(dir.path(), &["key", "generate"]).status.success());
    let out = agentmesh(dir.path(), &["episode", "start", "--title", "greeting", "--agent", "alice"]);
    assert!(out.status.success(), "{out:?}");

    let out = agentmesh(dir.path(), &["commit", "-m", "add greeting", "--agent", "alice"]);
    assert!(out.status.success(), "{out:?}");
    let report = json_stdout(&out);
    assert_eq!(report["files"], json!(["hello.txt"]));

    let head = repo.head().unwrap().peel_to_commit().unwrap();
    assert!(head.message().unwrap().contains("AgentMesh-Witness"));

    let out = agentmesh(dir.path(), &["witness", "verify", "HEAD"]);
    assert!(out.status.success(), "{out:?}");
    assert_eq!(json_stdout(&out)["verdict"], "VERIFIED");

    let out = agentmesh(dir.path(), &["events", "verify"]);
    assert!(out.status.success(), "{out:?}");
    assert_eq!(json_stdout(&out)["ok"], true);
}

#[test]
fn orchestration_requires_the_lease_holder() {
    let dir = tempdir().unwrap();
    init(dir.path());

    let out = agentmesh(dir.path(), &["--format", "minimal", "orch", "lease-acquire"]);
    assert!(out.status.success(), "{out:?}");
    let owner = String::from_utf8(out.stdout).unwrap().trim().to_string();
    assert!(owner.starts_with("orchctl_"));

    let out = agentmesh(dir.path(), &["orch", "--owner", &owner, "create", "wire the api"]);
    assert!(out.status.success(), "{out:?}");
    let task_id = json_stdout(&out)["task_id"].as_str().unwrap().to_string();

    // No owner means a transient lease, which the live one blocks.
    let out = agentmesh(dir.path(), &["orch", "assign", &task_id, "worker-1"]);
    assert_eq!(out.status.code(), Some(1));
    assert_eq!(json_stderr(&out)["error"], "lease_conflict");

    let out = agentmesh(dir.path(), &["orch", "--owner", &owner, "assign", &task_id, "worker-1"]);
    assert!(out.status.success(), "{out:?}");
    assert_eq!(json_stdout(&out)["to_state"], "ASSIGNED");

    let out = agentmesh(dir.path(), &["orch", "--owner", &owner, "lease-release"]);
    assert!(out.status.success(), "{out:?}");

    let out = agentmesh(dir.path(), &["orch", "show", &task_id]);
    assert_eq!(json_stdout(&out)["state"], "ASSIGNED");
}
