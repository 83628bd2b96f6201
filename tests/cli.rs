// The binary resolves its home from $HOME only on unix.
#![cfg(unix)]

use assert_cmd::Command;
use predicates::str::contains;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::tempdir;

const BLOCK: &str = "# >>> myagent >>>\nexport PATH=\"/somewhere:$PATH\"\n# <<< myagent <<<\n";

fn bin() -> Command {
    let path = assert_cmd::cargo::cargo_bin!("myagent-installer");
    Command::new(path)
}

/// Runs against an isolated home with every override cleared.
fn bin_in(home: &Path) -> Command {
    let mut cmd = bin();
    cmd.env("HOME", home)
        .env("SHELL", "/bin/bash")
        .env_remove("MYAGENT_ASSUME_YES")
        .env_remove("MYAGENT_LOCAL_FEED")
        .env_remove("MYAGENT_VERSION")
        .env_remove("MYAGENT_RELEASE_REPO")
        .env_remove("MYAGENT_NO_MODIFY_PATH")
        .env_remove("MYAGENT_HARNESS_FIXTURE");
    cmd
}

fn parse_json(bytes: &[u8]) -> Value {
    serde_json::from_slice(bytes).expect("json output")
}

fn binary_path(home: &Path) -> PathBuf {
    home.join(".local").join("bin").join("myagent")
}

fn write_stub_binary(home: &Path, version_line: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = binary_path(home);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(
        &path,
        format!(
            "#!/bin/sh\ncase \"$1\" in\n  --version) echo \"{version_line}\" ;;\n  *) echo \"myagent is not running\" ;;\nesac\n"
        ),
    )
    .unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

#[test]
fn paths_json_reports_locations_under_home() {
    let dir = tempdir().unwrap();
    let output = bin_in(dir.path())
        .arg("--json")
        .arg("paths")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let json = parse_json(&output);
    assert_eq!(json["ok"], true);
    let result = &json["result"];
    assert!(result["binary_path"]
        .as_str()
        .unwrap()
        .contains(".local"));
    assert!(result["config_dir"].as_str().unwrap().ends_with(".myagent"));
    assert!(result["pid_file_path"]
        .as_str()
        .unwrap()
        .ends_with("myagent.pid"));
    assert_eq!(result["binary_exists"], false);
}

#[test]
fn paths_targets_the_profile_of_the_configured_shell() {
    let dir = tempdir().unwrap();
    bin_in(dir.path())
        .env("SHELL", "/usr/bin/zsh")
        .arg("paths")
        .assert()
        .success()
        .stdout(contains(".zshrc"));
}

#[test]
fn uninstall_without_confirmation_fails_before_touching_anything() {
    let dir = tempdir().unwrap();
    let binary = binary_path(dir.path());
    fs::create_dir_all(binary.parent().unwrap()).unwrap();
    fs::write(&binary, "OLDBIN").unwrap();

    bin_in(dir.path())
        .arg("uninstall")
        .assert()
        .failure()
        .code(1)
        .stderr(contains("--yes"));
    assert_eq!(fs::read(&binary).unwrap(), b"OLDBIN");
}

#[test]
fn uninstall_on_empty_home_succeeds() {
    let dir = tempdir().unwrap();
    let output = bin_in(dir.path())
        .env("MYAGENT_ASSUME_YES", "1")
        .arg("--json")
        .arg("uninstall")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let json = parse_json(&output);
    let steps = json["result"]["steps"].as_array().unwrap();
    assert_eq!(steps.len(), 4);
    assert_eq!(steps[0]["step"], "stop_daemon");
    assert_eq!(steps[0]["outcome"], "skipped");
    for step in &steps[1..] {
        assert_eq!(step["outcome"], "already_absent", "{step}");
    }
}

#[test]
fn uninstall_removes_binary_config_and_profile_block() {
    let dir = tempdir().unwrap();
    let binary = write_stub_binary(dir.path(), "myagent 1.0.0");
    let config_dir = dir.path().join(".myagent");
    fs::create_dir_all(config_dir.join("logs")).unwrap();
    fs::write(config_dir.join("myagent.pid"), "99999").unwrap();
    let bashrc = dir.path().join(".bashrc");
    fs::write(&bashrc, format!("alias ll='ls -l'\n\n{BLOCK}")).unwrap();

    bin_in(dir.path())
        .arg("uninstall")
        .arg("--yes")
        .assert()
        .success()
        .stdout(contains("removed"));

    assert!(!binary.exists());
    assert!(!config_dir.exists());
    assert_eq!(fs::read_to_string(&bashrc).unwrap(), "alias ll='ls -l'\n");
}

#[test]
fn uninstall_dry_run_reports_without_removing() {
    let dir = tempdir().unwrap();
    let binary = write_stub_binary(dir.path(), "myagent 1.0.0");
    fs::create_dir_all(dir.path().join(".myagent")).unwrap();

    bin_in(dir.path())
        .arg("uninstall")
        .arg("--dry-run")
        .assert()
        .success()
        .stdout(contains("would remove"));
    assert!(binary.exists());
    assert!(dir.path().join(".myagent").exists());
}

#[test]
fn install_from_unreachable_feed_fails_without_side_effects() {
    let dir = tempdir().unwrap();
    let assert = bin_in(dir.path())
        .env("MYAGENT_LOCAL_FEED", "http://127.0.0.1:9")
        .arg("install")
        .assert()
        .failure()
        .code(1);
    let stderr = String::from_utf8_lossy(&assert.get_output().stderr).to_string();
    assert!(stderr.contains("network error"), "{stderr}");
    assert_eq!(stderr.trim_end().lines().count(), 1, "{stderr}");
    assert!(!dir.path().join(".local").exists());
    assert!(!dir.path().join(".bashrc").exists());
}

#[test]
fn install_json_error_envelope_carries_code() {
    let dir = tempdir().unwrap();
    let output = bin_in(dir.path())
        .env("MYAGENT_LOCAL_FEED", "http://127.0.0.1:9")
        .arg("--json")
        .arg("install")
        .arg("--version-tag=")
        .assert()
        .failure()
        .get_output()
        .stdout
        .clone();
    let json = parse_json(&output);
    assert_eq!(json["ok"], false);
    assert_eq!(json["error_code"], "version_not_found");
}

#[test]
fn harness_local_run_restores_prior_binary() {
    let dir = tempdir().unwrap();
    let binary = binary_path(dir.path());
    fs::create_dir_all(binary.parent().unwrap()).unwrap();
    fs::write(&binary, "OLDBIN").unwrap();

    bin_in(dir.path())
        .arg("harness")
        .arg("--local")
        .assert()
        .success()
        .stdout(contains("PASS fresh install reports not running"))
        .stdout(contains("0 failed"))
        .stdout(contains("prior installation restored"));

    assert_eq!(fs::read(&binary).unwrap(), b"OLDBIN");
    assert!(!dir.path().join(".myagent").exists());
    assert!(!dir.path().join(".bashrc").exists());
}

#[test]
fn harness_json_report_counts_assertions() {
    let dir = tempdir().unwrap();
    let bashrc = dir.path().join(".bashrc");
    fs::write(&bashrc, "export EDITOR=vi\n").unwrap();

    let output = bin_in(dir.path())
        .arg("--json")
        .arg("harness")
        .arg("--local")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let json = parse_json(&output);
    assert_eq!(json["ok"], true);
    assert_eq!(json["result"]["failed"], 0);
    assert_eq!(json["result"]["restored"], true);
    assert!(json["result"]["passed"].as_u64().unwrap() >= 6);
    assert_eq!(fs::read_to_string(&bashrc).unwrap(), "export EDITOR=vi\n");
    assert!(!binary_path(dir.path()).exists());
}

#[test]
fn harness_local_run_ignores_a_pinned_version() {
    let dir = tempdir().unwrap();
    bin_in(dir.path())
        .env("MYAGENT_VERSION", "v1.2.3")
        .arg("harness")
        .arg("--local")
        .assert()
        .success()
        .stdout(contains("PASS install succeeds (installed 0.0.0-test)"))
        .stdout(contains("0 failed"));
    assert!(!binary_path(dir.path()).exists());
}
