use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use reqwest::blocking::Client;
use serde::Serialize;
use tar::Archive;
use tempfile::{NamedTempFile, TempPath};
use zip::ZipArchive;

use crate::daemon::ProgramRunner;
use crate::error::InstallerError;
use crate::paths::InstallPaths;
use crate::platform::{ArchiveKind, PlatformDescriptor};
use crate::release::ReleaseDescriptor;

#[derive(Debug, Clone, Serialize)]
pub struct PlacedBinary {
    pub binary_path: PathBuf,
    pub bytes: u64,
    pub replaced_existing: bool,
}

/// Fetches the release asset, pulls the executable out of it and places it at
/// the canonical binary path.
///
/// The asset is staged in the system temp directory so a failed download never
/// touches an existing installation; the staging file is gone once this returns.
pub fn install_release<R: ProgramRunner>(
    client: &Client,
    release: &ReleaseDescriptor,
    platform: &PlatformDescriptor,
    paths: &InstallPaths,
    runner: &R,
) -> Result<PlacedBinary, InstallerError> {
    let staging = download_to_staging(client, &release.download_url)?;
    let result = extract_binary(
        staging.path(),
        platform.archive_kind(),
        &platform.executable_name(),
    )
    .and_then(|bytes| place_binary(paths, &bytes, runner));
    if let Err(err) = staging.close() {
        tracing::warn!(error = %err, "failed to remove staging file");
    }
    result
}

pub fn download_to_staging(client: &Client, url: &str) -> Result<NamedTempFile, InstallerError> {
    let mut staging = tempfile::Builder::new()
        .prefix("myagent-download-")
        .tempfile()
        .map_err(|err| InstallerError::Download(format!("failed to create staging file: {err}")))?;
    tracing::debug!(%url, staging = %staging.path().display(), "downloading release asset");
    let mut response = client
        .get(url)
        .send()
        .map_err(|err| InstallerError::Download(format!("{url}: {err}")))?;
    let status = response.status();
    if !status.is_success() {
        return Err(InstallerError::Download(format!("{url}: HTTP {status}")));
    }
    response
        .copy_to(staging.as_file_mut())
        .map_err(|err| InstallerError::Download(format!("{url}: {err}")))?;
    staging
        .as_file_mut()
        .flush()
        .map_err(|err| InstallerError::Download(format!("{url}: {err}")))?;
    Ok(staging)
}

/// Reads the named executable out of the archive. Nested directories inside the
/// archive are tolerated; the entry is matched by file name.
pub fn extract_binary(
    archive_path: &Path,
    kind: ArchiveKind,
    binary_name: &str,
) -> Result<Vec<u8>, InstallerError> {
    let found = match kind {
        ArchiveKind::TarGz => read_from_tar_gz(archive_path, binary_name),
        ArchiveKind::Zip => read_from_zip(archive_path, binary_name),
    }
    .map_err(|err| {
        InstallerError::Download(format!(
            "failed to read {} archive {}: {err}",
            kind.extension(),
            archive_path.display()
        ))
    })?;
    found.ok_or_else(|| {
        InstallerError::Download(format!(
            "archive {} does not contain {binary_name}",
            archive_path.display()
        ))
    })
}

fn read_from_tar_gz(archive_path: &Path, binary_name: &str) -> io::Result<Option<Vec<u8>>> {
    let file = File::open(archive_path)?;
    let mut archive = Archive::new(GzDecoder::new(file));
    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let matches = entry
            .path()?
            .file_name()
            .map(|name| name == binary_name)
            .unwrap_or(false);
        if matches {
            let mut buf = Vec::new();
            entry.read_to_end(&mut buf)?;
            return Ok(Some(buf));
        }
    }
    Ok(None)
}

fn read_from_zip(archive_path: &Path, binary_name: &str) -> io::Result<Option<Vec<u8>>> {
    let file = File::open(archive_path)?;
    let mut archive = ZipArchive::new(file).map_err(io::Error::other)?;
    for index in 0..archive.len() {
        let mut entry = archive.by_index(index).map_err(io::Error::other)?;
        if entry.is_dir() {
            continue;
        }
        let matches = entry
            .enclosed_name()
            .and_then(|path| path.file_name().map(|name| name == binary_name))
            .unwrap_or(false);
        if matches {
            let mut buf = Vec::new();
            entry.read_to_end(&mut buf)?;
            return Ok(Some(buf));
        }
    }
    Ok(None)
}

/// Writes the executable next to its final location, marks it runnable, checks
/// that it starts, then renames it over the canonical binary path.
pub fn place_binary<R: ProgramRunner>(
    paths: &InstallPaths,
    bytes: &[u8],
    runner: &R,
) -> Result<PlacedBinary, InstallerError> {
    fs::create_dir_all(&paths.install_dir).map_err(|err| {
        InstallerError::from_fs(err, "failed to create install directory", &paths.install_dir)
    })?;
    let replaced_existing = paths.binary_path.exists();

    let mut staged = tempfile::Builder::new()
        .prefix(".myagent-")
        .suffix(".partial")
        .tempfile_in(&paths.install_dir)
        .map_err(|err| {
            InstallerError::from_fs(err, "failed to write into", &paths.install_dir)
        })?;
    staged.write_all(bytes)?;
    staged.as_file().sync_all()?;
    // Closing the handle before exec avoids ETXTBSY on Linux.
    let staged = staged.into_temp_path();
    mark_executable(&staged)?;
    verify_runs(runner, &staged)?;

    staged.persist(&paths.binary_path).map_err(|err| {
        InstallerError::from_fs(err.error, "failed to place binary at", &paths.binary_path)
    })?;
    tracing::info!(binary = %paths.binary_path.display(), replaced_existing, "binary placed");
    Ok(PlacedBinary {
        binary_path: paths.binary_path.clone(),
        bytes: bytes.len() as u64,
        replaced_existing,
    })
}

#[cfg(unix)]
fn mark_executable(path: &TempPath) -> Result<(), InstallerError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
        .map_err(|err| InstallerError::from_fs(err, "failed to mark executable", path))
}

#[cfg(not(unix))]
fn mark_executable(_path: &TempPath) -> Result<(), InstallerError> {
    Ok(())
}

fn verify_runs<R: ProgramRunner>(runner: &R, staged: &Path) -> Result<(), InstallerError> {
    let output = runner.run(staged, &["--version"]).map_err(|err| {
        InstallerError::Download(format!("downloaded binary failed to start: {err}"))
    })?;
    if !output.success() {
        return Err(InstallerError::Download(format!(
            "downloaded binary exited with status {} on --version",
            output.status_code
        )));
    }
    Ok(())
}
