//! Backup, exercise and restore of a real installation.
//!
//! Any installation present before the run is put back byte for byte
//! afterwards, whatever the exercise phase did.

mod backup;
mod feed;
mod fixture;

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::daemon::{query_status, query_version, ProgramRunner};
use crate::error::InstallerError;
use crate::install::{install, InstallOptions};
use crate::path_env::PathTarget;
use crate::paths::{InstallPaths, PROGRAM_NAME};
use crate::platform::PlatformDescriptor;
use crate::release::ReleaseFeed;
use crate::uninstall::{uninstall, Step};

use backup::BackupGuard;
use feed::LocalFeed;
use fixture::prepare_fixture;

#[derive(Debug, Clone)]
pub struct HarnessOptions {
    pub local: bool,
    pub fixture: Option<PathBuf>,
    pub repo: String,
    pub pinned_tag: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Assertion {
    pub name: String,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HarnessReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub platform: PlatformDescriptor,
    pub feed_url: Option<String>,
    pub saved_binaries: usize,
    pub assertions: Vec<Assertion>,
    pub passed: usize,
    pub failed: usize,
    pub restored: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restore_error: Option<String>,
}

impl HarnessReport {
    pub fn succeeded(&self) -> bool {
        self.failed == 0
    }

    pub fn lines(&self) -> Vec<String> {
        let mut lines: Vec<String> = self
            .assertions
            .iter()
            .map(|assertion| {
                let mark = if assertion.passed { "PASS" } else { "FAIL" };
                match &assertion.detail {
                    Some(detail) => format!("{mark} {} ({detail})", assertion.name),
                    None => format!("{mark} {}", assertion.name),
                }
            })
            .collect();
        lines.push(format!("{} passed, {} failed", self.passed, self.failed));
        match &self.restore_error {
            Some(err) => lines.push(format!("restore FAILED: {err}")),
            None => lines.push("prior installation restored".to_string()),
        }
        lines
    }
}

#[derive(Default)]
struct Recorder {
    assertions: Vec<Assertion>,
}

impl Recorder {
    fn check(&mut self, name: &str, passed: bool, detail: Option<String>) -> bool {
        tracing::info!(assertion = name, passed, "harness assertion");
        self.assertions.push(Assertion {
            name: name.to_string(),
            passed,
            detail,
        });
        passed
    }
}

/// Runs the three-phase protocol. Only a failed backup is returned as an
/// error; everything after it lands in the report.
pub fn run<R: ProgramRunner>(
    paths: &InstallPaths,
    platform: &PlatformDescriptor,
    path_target: &PathTarget,
    options: &HarnessOptions,
    runner: &R,
) -> Result<HarnessReport, InstallerError> {
    let started_at = Utc::now();
    let guard = BackupGuard::acquire(paths, path_target)?;
    let saved_binaries = guard.saved_binary_count();

    let mut recorder = Recorder::default();
    let mut feed_url = None;
    if let Err(err) = exercise(
        paths,
        platform,
        path_target,
        options,
        runner,
        &mut recorder,
        &mut feed_url,
    ) {
        recorder.check("harness setup", false, Some(err.to_string()));
    }

    let restore_error = match guard.restore() {
        Ok(()) => None,
        Err(err) => {
            tracing::error!(error = %err, "failed to restore installation after harness run");
            Some(err.to_string())
        }
    };

    let passed = recorder.assertions.iter().filter(|a| a.passed).count();
    let failed = recorder.assertions.len() - passed;
    Ok(HarnessReport {
        started_at,
        finished_at: Utc::now(),
        platform: *platform,
        feed_url,
        saved_binaries,
        assertions: recorder.assertions,
        passed,
        failed,
        restored: restore_error.is_none(),
        restore_error,
    })
}

fn exercise<R: ProgramRunner>(
    paths: &InstallPaths,
    platform: &PlatformDescriptor,
    path_target: &PathTarget,
    options: &HarnessOptions,
    runner: &R,
    recorder: &mut Recorder,
    feed_url: &mut Option<String>,
) -> Result<(), InstallerError> {
    let scratch = tempfile::Builder::new()
        .prefix("myagent-harness-")
        .tempdir()?;
    let local_feed = if options.local {
        let fixture = prepare_fixture(options.fixture.as_deref(), platform, scratch.path())?;
        let feed = LocalFeed::launch(&fixture, platform, &options.repo)?;
        tracing::debug!(pid = feed.pid(), "harness feed running");
        Some(feed)
    } else {
        None
    };
    let feed = match &local_feed {
        Some(local) => local.feed(),
        None => ReleaseFeed::github(&options.repo),
    };
    *feed_url = Some(feed.latest_url());

    // The local feed only serves the fixed test tag.
    let pinned_tag = if options.local {
        if let Some(tag) = &options.pinned_tag {
            tracing::warn!(%tag, "ignoring pinned tag in local mode");
        }
        None
    } else {
        options.pinned_tag.clone()
    };
    let install_options = InstallOptions {
        pinned_tag,
        modify_path: true,
    };
    let installed = install(&feed, platform, paths, path_target, &install_options, runner);
    let install_ok = recorder.check(
        "install succeeds",
        installed.is_ok(),
        match &installed {
            Ok(report) => Some(format!("installed {}", report.release.version_tag)),
            Err(err) => Some(err.to_string()),
        },
    );
    drop(local_feed);

    if install_ok {
        let located = which::which_in(PROGRAM_NAME, Some(&paths.install_dir), &paths.home);
        recorder.check(
            "binary is installed and executable",
            located.as_ref().is_ok_and(|found| *found == paths.binary_path),
            Some(match &located {
                Ok(found) => found.display().to_string(),
                Err(err) => format!("{}: {err}", paths.binary_path.display()),
            }),
        );

        let version = query_version(runner, &paths.binary_path);
        recorder.check(
            "version output names the program",
            version.as_deref().is_some_and(|text| text.contains(PROGRAM_NAME)),
            version.clone(),
        );

        let status = query_status(runner, &paths.binary_path);
        recorder.check(
            "fresh install reports not running",
            status.as_deref().is_some_and(|text| text.contains("not running")),
            status.clone(),
        );
    }

    let removed = uninstall(paths, path_target, runner, false);
    recorder.check(
        "uninstall succeeds",
        removed.is_ok(),
        Some(match &removed {
            Ok(report) => format!(
                "binary step: {:?}",
                report.outcome_of(Step::RemoveBinary)
            ),
            Err(err) => err.to_string(),
        }),
    );
    recorder.check(
        "binary removed",
        !paths.binary_path.exists(),
        Some(paths.binary_path.display().to_string()),
    );
    recorder.check(
        "config directory removed",
        !paths.config_dir.exists(),
        Some(paths.config_dir.display().to_string()),
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::tests::MockRunner;
    use crate::path_env::ShellProfileMarker;
    use crate::platform::resolve;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn failed_install_is_recorded_and_state_restored() {
        let dir = tempdir().unwrap();
        let paths = InstallPaths::under_home(dir.path());
        let target = PathTarget::Profile(ShellProfileMarker::for_shell(Some("zsh"), &paths));
        fs::create_dir_all(&paths.install_dir).unwrap();
        fs::write(&paths.binary_path, "OLDBIN").unwrap();
        let platform = resolve("linux", "x86_64", None).unwrap();
        // An empty pinned tag fails before any request is made.
        let options = HarnessOptions {
            local: false,
            fixture: None,
            repo: "acme/tool".to_string(),
            pinned_tag: Some(String::new()),
        };

        let report = run(&paths, &platform, &target, &options, &MockRunner::default()).unwrap();

        assert!(!report.succeeded());
        assert_eq!(report.assertions[0].name, "install succeeds");
        assert!(!report.assertions[0].passed);
        assert!(report.restored);
        assert_eq!(report.saved_binaries, 1);
        assert_eq!(fs::read(&paths.binary_path).unwrap(), b"OLDBIN");
        assert!(!paths.config_dir.exists());
    }

    #[test]
    fn report_lines_summarize_counts() {
        let platform = resolve("linux", "x86_64", None).unwrap();
        let report = HarnessReport {
            started_at: Utc::now(),
            finished_at: Utc::now(),
            platform,
            feed_url: None,
            saved_binaries: 0,
            assertions: vec![
                Assertion {
                    name: "install succeeds".to_string(),
                    passed: true,
                    detail: None,
                },
                Assertion {
                    name: "binary removed".to_string(),
                    passed: false,
                    detail: Some("/h/.local/bin/myagent".to_string()),
                },
            ],
            passed: 1,
            failed: 1,
            restored: false,
            restore_error: Some("restore incomplete: disk full".to_string()),
        };
        let text = report.lines().join("\n");
        assert!(text.contains("PASS install succeeds"));
        assert!(text.contains("FAIL binary removed (/h/.local/bin/myagent)"));
        assert!(text.contains("1 passed, 1 failed"));
        assert!(text.contains("restore FAILED"));
    }
}
