use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn dgx_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_dgx"))
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let config_content = format!(
        r#"default_plan = "free"

[db]
path = "{}/data/dgx.sqlite"

[embedding]
provider = "disabled"

[server]
bind = "127.0.0.1:0"

[plans.free]
modes = ["naive"]
monthly_queries = 100

[plans.pro]
modes = ["naive", "local", "global", "hybrid", "mix"]
"#,
        root.display()
    );

    let config_path = config_dir.join("dgx.toml");
    fs::write(&config_path, config_content).unwrap();

    fs::write(
        root.join("snapshot.json"),
        r#"{
  "documents": [
    { "id": "handbook", "title": "Support Handbook", "chunks": [
        { "chunk_index": 0, "content": "Refunds are issued within 30 days of purchase." },
        { "chunk_index": 1, "content": "Disputed refunds are escalated to the billing team." }
    ] }
  ],
  "entities": [
    { "id": "refund-policy", "name": "Refund Policy", "entity_type": "policy",
      "source_chunk_ids": ["handbook:0"] },
    { "id": "billing-team", "name": "Billing Team", "entity_type": "team",
      "description": "Handles payment disputes", "source_chunk_ids": ["handbook:1"] }
  ],
  "relations": [
    { "id": "escalates-to", "source_entity_id": "refund-policy",
      "target_entity_id": "billing-team", "relation_type": "escalates_to",
      "source_chunk_ids": ["handbook:1"] }
  ]
}"#,
    )
    .unwrap();

    (tmp, config_path)
}

fn run_dgx(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = dgx_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run dgx binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

fn snapshot_path(config_path: &Path) -> String {
    config_path
        .parent()
        .and_then(Path::parent)
        .unwrap()
        .join("snapshot.json")
        .display()
        .to_string()
}

#[test]
fn test_init_creates_database() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_dgx(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_dgx(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_dgx(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_missing_config_errors() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, success) = run_dgx(&tmp.path().join("nope.toml"), &["init"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"));
}

#[test]
fn test_import_snapshot() {
    let (_tmp, config_path) = setup_test_env();
    run_dgx(&config_path, &["init"]);

    let snapshot = snapshot_path(&config_path);
    let (stdout, stderr, success) =
        run_dgx(&config_path, &["import", &snapshot, "--tenant", "acme"]);
    assert!(success, "import failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("documents: 1"));
    assert!(stdout.contains("chunks: 2"));
    assert!(stdout.contains("entities: 2"));
    assert!(stdout.contains("relations: 1"));
}

#[test]
fn test_import_twice_rejects_duplicates() {
    let (_tmp, config_path) = setup_test_env();
    run_dgx(&config_path, &["init"]);

    let snapshot = snapshot_path(&config_path);
    let (_, _, first) = run_dgx(&config_path, &["import", &snapshot, "--tenant", "acme"]);
    assert!(first);
    let (_, _, second) = run_dgx(&config_path, &["import", &snapshot, "--tenant", "acme"]);
    assert!(!second, "re-importing the same document ids should fail");
}

#[test]
fn test_two_tenants_import_same_snapshot() {
    let (_tmp, config_path) = setup_test_env();
    run_dgx(&config_path, &["init"]);

    let snapshot = snapshot_path(&config_path);
    for tenant in ["acme", "globex"] {
        let (_, stderr, success) = run_dgx(&config_path, &["import", &snapshot, "--tenant", tenant]);
        assert!(success, "import for {} failed: {}", tenant, stderr);
    }
}

#[test]
fn test_embed_pending_errors_when_disabled() {
    let (_tmp, config_path) = setup_test_env();
    run_dgx(&config_path, &["init"]);

    let (_, stderr, success) = run_dgx(&config_path, &["embed", "pending"]);
    assert!(!success);
    assert!(stderr.contains("disabled"));
}

#[test]
fn test_plan_set_and_show() {
    let (_tmp, config_path) = setup_test_env();
    run_dgx(&config_path, &["init"]);

    let (stdout, _, success) = run_dgx(&config_path, &["plan", "show", "acme"]);
    assert!(success);
    assert!(stdout.contains("plan: free"));
    assert!(stdout.contains("modes: naive\n"));
    assert!(stdout.contains("0 / 100"));

    let (_, stderr, success) = run_dgx(&config_path, &["plan", "set", "acme", "pro"]);
    assert!(success, "plan set failed: {}", stderr);

    let (stdout, _, success) = run_dgx(&config_path, &["plan", "show", "acme"]);
    assert!(success);
    assert!(stdout.contains("plan: pro"));
    assert!(stdout.contains("modes: naive, local, global, hybrid, mix"));
    assert!(stdout.contains("unlimited"));
}

#[test]
fn test_plan_set_unknown_plan_errors() {
    let (_tmp, config_path) = setup_test_env();
    run_dgx(&config_path, &["init"]);

    let (_, stderr, success) = run_dgx(&config_path, &["plan", "set", "acme", "platinum"]);
    assert!(!success);
    assert!(stderr.contains("unknown plan"));
}

#[test]
fn test_query_empty_is_rejected() {
    let (_tmp, config_path) = setup_test_env();
    run_dgx(&config_path, &["init"]);

    let (_, stderr, success) = run_dgx(&config_path, &["query", "  ", "--tenant", "acme"]);
    assert!(!success);
    assert!(stderr.contains("query must not be empty"));
}

#[test]
fn test_query_top_k_out_of_range_is_rejected() {
    let (_tmp, config_path) = setup_test_env();
    run_dgx(&config_path, &["init"]);

    let (_, stderr, success) = run_dgx(
        &config_path,
        &["query", "refunds", "--tenant", "acme", "--top-k", "0"],
    );
    assert!(!success);
    assert!(stderr.contains("top_k"));
}

#[test]
fn test_query_fails_when_embedding_disabled() {
    let (_tmp, config_path) = setup_test_env();
    run_dgx(&config_path, &["init"]);

    let (_, stderr, success) = run_dgx(&config_path, &["query", "refunds", "--tenant", "acme"]);
    assert!(!success);
    assert!(stderr.contains("embedding failed"));
}
