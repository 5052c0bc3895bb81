//! Integration tests for the `workpool` binary's offline commands.
//!
//! Each test points `XDG_CONFIG_HOME` at its own temp dir, so no real
//! config file is touched.

use std::path::Path;
use std::process::{Command, Output};

fn workpool(config_home: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_workpool"))
        .args(args)
        .env("XDG_CONFIG_HOME", config_home)
        .env("RUST_LOG", "warn")
        .output()
        .expect("failed to run workpool binary")
}

#[test]
fn init_writes_default_config() {
    let tmp = tempfile::TempDir::new().unwrap();
    let out = workpool(tmp.path(), &["init"]);
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));

    let path = tmp.path().join("workpool").join("config.toml");
    let contents = std::fs::read_to_string(&path).unwrap();
    let parsed: toml::Value = toml::from_str(&contents).unwrap();
    assert_eq!(parsed["server"]["port"].as_integer(), Some(7000));
    assert_eq!(parsed["pool"]["size"].as_integer(), Some(4));
    assert_eq!(parsed["worker"]["progress_every"].as_integer(), Some(10));

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}

#[test]
fn init_refuses_to_overwrite_without_force() {
    let tmp = tempfile::TempDir::new().unwrap();
    let dir = tmp.path().join("workpool");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("config.toml"), "[pool]\nsize = 9\n").unwrap();

    let out = workpool(tmp.path(), &["init"]);
    assert!(!out.status.success());
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("--force"), "unexpected stderr: {stderr}");
    let kept = std::fs::read_to_string(dir.join("config.toml")).unwrap();
    assert!(kept.contains("size = 9"));

    let out = workpool(tmp.path(), &["init", "--force"]);
    assert!(out.status.success());
    let replaced = std::fs::read_to_string(dir.join("config.toml")).unwrap();
    assert!(replaced.contains("size = 4"));
}

#[test]
fn serve_rejects_invalid_config_before_binding() {
    let tmp = tempfile::TempDir::new().unwrap();
    let dir = tmp.path().join("workpool");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("config.toml"), "[worker]\nmin_ticks = 10\nmax_ticks = 2\n").unwrap();

    let out = workpool(tmp.path(), &["serve"]);
    assert!(!out.status.success());
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("min_ticks"), "unexpected stderr: {stderr}");
}

#[test]
fn completions_for_bash_mention_subcommands() {
    let tmp = tempfile::TempDir::new().unwrap();
    let out = workpool(tmp.path(), &["completions", "bash"]);
    assert!(out.status.success());
    let script = String::from_utf8_lossy(&out.stdout);
    assert!(script.contains("workpool"));
    assert!(script.contains("serve"));
}
