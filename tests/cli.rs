use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn hca_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("hca");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/hca.sqlite"

[storage]
dir = "{root}/storage"

[embedding]
provider = "disabled"

[generation]
provider = "disabled"

[auth]
secret = "cli-test-secret"

[server]
bind = "127.0.0.1:8731"
"#,
        root = root.display()
    );

    let config_path = config_dir.join("hca.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_hca(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = hca_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .env_remove("SECRET_KEY")
        .env_remove("GEMINI_API_KEY")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run hca binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

#[test]
fn test_init_creates_database() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_hca(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data/hca.sqlite").exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_hca(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_hca(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, success) = run_hca(&tmp.path().join("nope.toml"), &["init"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"));
}

#[test]
fn test_invalid_config_rejected() {
    let (_tmp, config_path) = setup_test_env();
    let mut content = fs::read_to_string(&config_path).unwrap();
    content.push_str("\n[retrieval]\ntop_k = 0\n");
    fs::write(&config_path, content).unwrap();

    let (_, stderr, success) = run_hca(&config_path, &["init"]);
    assert!(!success);
    assert!(stderr.contains("top_k"));
}

#[test]
fn test_unknown_user_is_an_error() {
    let (_tmp, config_path) = setup_test_env();
    run_hca(&config_path, &["init"]);

    let (_, stderr, success) = run_hca(&config_path, &["history", "show", "--user", "nobody"]);
    assert!(!success);
    assert!(stderr.contains("no such user: nobody"));

    let (_, stderr, success) = run_hca(&config_path, &["search", "dose", "--user", "nobody"]);
    assert!(!success);
    assert!(stderr.contains("no such user"));
}

#[test]
fn test_ingest_missing_file_fails() {
    let (tmp, config_path) = setup_test_env();
    run_hca(&config_path, &["init"]);

    let missing = tmp.path().join("missing.pdf");
    let (_, _, success) = run_hca(
        &config_path,
        &["ingest", missing.to_str().unwrap(), "--user", "nobody"],
    );
    assert!(!success);
}
