use std::fs;
use std::io::{self, IsTerminal};
use std::path::Path;

use dialoguer::theme::ColorfulTheme;
use dialoguer::Confirm;
use serde::Serialize;

use crate::daemon::{stop_daemon, ProgramRunner, StopOutcome};
use crate::error::InstallerError;
use crate::path_env::{PathChange, PathTarget};
use crate::paths::InstallPaths;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    StopDaemon,
    RemoveBinary,
    RemoveConfigDir,
    RemovePathEntry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Removed,
    AlreadyAbsent,
    Attempted,
    Skipped,
    WouldRemove,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub step: Step,
    pub target: String,
    pub outcome: StepOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UninstallReport {
    pub dry_run: bool,
    pub steps: Vec<StepReport>,
}

impl UninstallReport {
    pub fn outcome_of(&self, step: Step) -> Option<StepOutcome> {
        self.steps
            .iter()
            .find(|report| report.step == step)
            .map(|report| report.outcome)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Proceed,
    Declined,
}

/// Decides whether the uninstall may touch anything.
///
/// `--yes` (or its environment override) and `--dry-run` skip the prompt. A
/// run without a terminal has nobody to ask and fails instead of guessing.
pub fn confirm_uninstall(
    paths: &InstallPaths,
    assume_yes: bool,
    dry_run: bool,
) -> Result<Confirmation, InstallerError> {
    if assume_yes || dry_run {
        return Ok(Confirmation::Proceed);
    }
    if !io::stdin().is_terminal() || !io::stderr().is_terminal() {
        return Err(InstallerError::Config(
            "uninstall needs confirmation; pass --yes or set MYAGENT_ASSUME_YES=1 (or use --dry-run to preview)"
                .to_string(),
        ));
    }
    let accepted = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(format!(
            "Remove {} and {}?",
            paths.binary_path.display(),
            paths.config_dir.display()
        ))
        .default(false)
        .interact()?;
    Ok(if accepted {
        Confirmation::Proceed
    } else {
        Confirmation::Declined
    })
}

/// Runs the four uninstall steps in order. The daemon is always asked to stop
/// while its binary still exists; a missing target is never an error.
pub fn uninstall<R: ProgramRunner>(
    paths: &InstallPaths,
    path_target: &PathTarget,
    runner: &R,
    dry_run: bool,
) -> Result<UninstallReport, InstallerError> {
    let mut steps = Vec::with_capacity(4);

    steps.push(if dry_run {
        StepReport {
            step: Step::StopDaemon,
            target: paths.binary_path.display().to_string(),
            outcome: StepOutcome::Skipped,
            detail: Some("dry run".to_string()),
        }
    } else {
        stop_step(runner, paths)
    });

    steps.push(removal_step(
        Step::RemoveBinary,
        &paths.binary_path,
        dry_run,
    )?);
    steps.push(removal_step(
        Step::RemoveConfigDir,
        &paths.config_dir,
        dry_run,
    )?);

    let path_outcome = if dry_run {
        if path_target.contains_entry(paths)? {
            StepOutcome::WouldRemove
        } else {
            StepOutcome::AlreadyAbsent
        }
    } else {
        match path_target.remove(paths)? {
            PathChange::Removed => StepOutcome::Removed,
            _ => StepOutcome::AlreadyAbsent,
        }
    };
    steps.push(StepReport {
        step: Step::RemovePathEntry,
        target: path_target.describe(),
        outcome: path_outcome,
        detail: None,
    });

    for report in &steps {
        tracing::info!(step = ?report.step, outcome = ?report.outcome, target = %report.target, "uninstall step");
    }
    Ok(UninstallReport { dry_run, steps })
}

fn stop_step<R: ProgramRunner>(runner: &R, paths: &InstallPaths) -> StepReport {
    let (outcome, detail) = match stop_daemon(runner, paths) {
        StopOutcome::Stopped => (StepOutcome::Attempted, Some("stop requested".to_string())),
        StopOutcome::NotStopped { reason } => (StepOutcome::Attempted, Some(reason)),
        StopOutcome::BinaryAbsent => (
            StepOutcome::Skipped,
            Some("no installed binary to ask".to_string()),
        ),
    };
    StepReport {
        step: Step::StopDaemon,
        target: paths.binary_path.display().to_string(),
        outcome,
        detail,
    }
}

fn removal_step(step: Step, path: &Path, dry_run: bool) -> Result<StepReport, InstallerError> {
    let outcome = if dry_run {
        if fs::symlink_metadata(path).is_ok() {
            StepOutcome::WouldRemove
        } else {
            StepOutcome::AlreadyAbsent
        }
    } else if remove_path(path)? {
        StepOutcome::Removed
    } else {
        StepOutcome::AlreadyAbsent
    };
    Ok(StepReport {
        step,
        target: path.display().to_string(),
        outcome,
        detail: None,
    })
}

/// Removes a file, symlink or directory tree. `Ok(false)` when nothing was there.
pub fn remove_path(path: &Path) -> Result<bool, InstallerError> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(InstallerError::from_fs(err, "failed to inspect", path)),
    };
    let removed = if meta.file_type().is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    match removed {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(InstallerError::from_fs(err, "failed to remove", path)),
    }
}
