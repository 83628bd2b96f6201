use std::path::PathBuf;

use serde::Serialize;

use crate::archive::{install_release, PlacedBinary};
use crate::daemon::{daemon_reported_running, query_status, query_version, ProgramRunner};
use crate::error::InstallerError;
use crate::path_env::{PathChange, PathTarget};
use crate::paths::InstallPaths;
use crate::platform::PlatformDescriptor;
use crate::release::{is_up_to_date, locate, ReleaseDescriptor, ReleaseFeed};

#[derive(Debug, Clone, Default)]
pub struct InstallOptions {
    pub pinned_tag: Option<String>,
    pub modify_path: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstallReport {
    pub platform: PlatformDescriptor,
    pub release: ReleaseDescriptor,
    pub binary_path: PathBuf,
    /// `None` when the installed binary was already current and left alone.
    pub binary: Option<PlacedBinary>,
    pub up_to_date: bool,
    pub previous_version: Option<String>,
    pub installed_version: Option<String>,
    pub path_target: Option<String>,
    pub path_change: Option<PathChange>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restart_hint: Option<String>,
}

/// Locate, download, place, then make the install directory reachable.
///
/// The platform is resolved by the caller so an unsupported host fails before
/// anything here runs. Nothing on disk changes until the release is located.
/// An installed binary at least as new as the latest release is kept; a pinned
/// tag always reinstalls.
pub fn install<R: ProgramRunner>(
    feed: &ReleaseFeed,
    platform: &PlatformDescriptor,
    paths: &InstallPaths,
    path_target: &PathTarget,
    options: &InstallOptions,
    runner: &R,
) -> Result<InstallReport, InstallerError> {
    let client = feed.http_client()?;
    let release = locate(feed, &client, platform, options.pinned_tag.as_deref())?;
    tracing::info!(
        tag = %release.version_tag,
        asset = %release.asset_filename,
        "release located"
    );

    let previous_version = query_version(runner, &paths.binary_path);
    let up_to_date = options.pinned_tag.is_none()
        && is_up_to_date(previous_version.as_deref(), &release.version_tag);
    let (binary, installed_version) = if up_to_date {
        tracing::info!(
            installed = previous_version.as_deref().unwrap_or_default(),
            latest = %release.version_tag,
            "already up to date"
        );
        (None, previous_version.clone())
    } else {
        let placed = install_release(&client, &release, platform, paths, runner)?;
        (Some(placed), query_version(runner, &paths.binary_path))
    };

    let replaced_existing = binary.as_ref().is_some_and(|placed| placed.replaced_existing);
    let restart_hint = if replaced_existing {
        query_status(runner, &paths.binary_path)
            .filter(|status| daemon_reported_running(status))
            .map(|_| {
                format!(
                    "updated to {}; run `myagent restart` to apply it to the running daemon",
                    release.version_tag
                )
            })
    } else {
        None
    };

    let (path_target_desc, path_change) = if options.modify_path {
        let change = path_target.add(paths).map_err(|err| match err {
            InstallerError::ProfileWrite(msg) => InstallerError::ProfileWrite(format!(
                "{msg}; {} was installed but {} is not on PATH",
                paths.binary_path.display(),
                paths.install_dir.display()
            )),
            other => other,
        })?;
        (Some(path_target.describe()), Some(change))
    } else {
        (None, None)
    };

    Ok(InstallReport {
        platform: *platform,
        release,
        binary_path: paths.binary_path.clone(),
        binary,
        up_to_date,
        previous_version,
        installed_version,
        path_target: path_target_desc,
        path_change,
        restart_hint,
    })
}

impl InstallReport {
    /// Human-readable summary lines.
    pub fn lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        match &self.previous_version {
            Some(previous) if self.up_to_date => lines.push(format!(
                "{previous} is already up to date (latest is {})",
                self.release.version_tag
            )),
            Some(previous) => lines.push(format!(
                "Replaced {previous} with {} ({})",
                self.release.version_tag, self.platform
            )),
            None => lines.push(format!(
                "Installed myagent {} ({})",
                self.release.version_tag, self.platform
            )),
        }
        lines.push(format!("Binary: {}", self.binary_path.display()));
        match (&self.path_target, self.path_change) {
            (Some(target), Some(PathChange::Added)) => {
                lines.push(format!("Added install directory to PATH in {target}"));
                lines.push("Open a new shell to pick up the change.".to_string());
            }
            (Some(target), Some(_)) => {
                lines.push(format!("PATH already configured in {target}"));
            }
            _ => lines.push("PATH left unchanged".to_string()),
        }
        if let Some(hint) = &self.restart_hint {
            lines.push(hint.clone());
        }
        lines
    }
}
