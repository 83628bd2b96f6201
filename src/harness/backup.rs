use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::error::InstallerError;
use crate::path_env::{PathSnapshot, PathTarget};
use crate::paths::InstallPaths;
use crate::uninstall::remove_path;

#[derive(Debug)]
struct SavedBinary {
    original: PathBuf,
    saved: SavedEntry,
}

#[derive(Debug)]
enum SavedEntry {
    Absent,
    File { stash: PathBuf, mode: Option<u32> },
    /// Recreated as a link to the same target, never as a copy.
    Symlink(PathBuf),
}

/// Snapshot of a real installation, held for the length of a harness run.
///
/// `acquire` copies every location into a private vault before clearing any of
/// them. `restore` puts everything back exactly once; dropping the guard
/// without calling it restores as well.
#[derive(Debug)]
pub struct BackupGuard {
    vault: Option<TempDir>,
    binaries: Vec<SavedBinary>,
    config_dir: PathBuf,
    config_stash: Option<PathBuf>,
    path_target: PathTarget,
    path_snapshot: PathSnapshot,
    restored: bool,
}

impl BackupGuard {
    pub fn acquire(paths: &InstallPaths, path_target: &PathTarget) -> Result<Self, InstallerError> {
        let vault = tempfile::Builder::new()
            .prefix("myagent-harness-vault-")
            .tempdir()?;

        let mut binaries = Vec::new();
        for (index, location) in paths.known_binary_locations().into_iter().enumerate() {
            let saved = save_binary(&location, &vault.path().join(format!("binary-{index}")))?;
            binaries.push(SavedBinary {
                original: location,
                saved,
            });
        }

        let config_stash = if paths.config_dir.is_dir() {
            let stash = vault.path().join("config");
            copy_dir_recursive(&paths.config_dir, &stash)?;
            Some(stash)
        } else {
            None
        };

        let path_snapshot = path_target.snapshot()?;

        let guard = Self {
            vault: Some(vault),
            binaries,
            config_dir: paths.config_dir.clone(),
            config_stash,
            path_target: path_target.clone(),
            path_snapshot,
            restored: false,
        };
        // Dropping the guard on a failed clear restores what was already removed.
        guard.clear()?;
        tracing::info!(
            saved_binaries = guard.saved_binary_count(),
            config_saved = guard.config_stash.is_some(),
            "installation backed up"
        );
        Ok(guard)
    }

    pub fn saved_binary_count(&self) -> usize {
        self.binaries
            .iter()
            .filter(|binary| !matches!(binary.saved, SavedEntry::Absent))
            .count()
    }

    fn clear(&self) -> Result<(), InstallerError> {
        for saved in &self.binaries {
            remove_path(&saved.original)?;
        }
        remove_path(&self.config_dir)?;
        Ok(())
    }

    pub fn restore(mut self) -> Result<(), InstallerError> {
        self.restore_once()
    }

    fn restore_once(&mut self) -> Result<(), InstallerError> {
        if self.restored {
            return Ok(());
        }
        self.restored = true;

        let mut failures: Vec<String> = Vec::new();
        for saved in &self.binaries {
            if let Err(err) = restore_binary(saved) {
                failures.push(err.to_string());
            }
        }
        if let Err(err) = restore_config(&self.config_dir, self.config_stash.as_deref()) {
            failures.push(err.to_string());
        }
        if let Err(err) = self.path_target.restore(&self.path_snapshot) {
            failures.push(err.to_string());
        }

        if let Some(vault) = self.vault.take() {
            if failures.is_empty() {
                if let Err(err) = vault.close() {
                    tracing::warn!(error = %err, "failed to delete harness vault");
                }
            } else {
                // Keep the copies around so they can be recovered by hand.
                let kept = vault.keep();
                failures.push(format!("backup kept at {}", kept.display()));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(InstallerError::Config(format!(
                "restore incomplete: {}",
                failures.join("; ")
            )))
        }
    }
}

impl Drop for BackupGuard {
    fn drop(&mut self) {
        if let Err(err) = self.restore_once() {
            tracing::error!(error = %err, "failed to restore installation");
        }
    }
}

fn save_binary(location: &Path, stash: &Path) -> Result<SavedEntry, InstallerError> {
    let meta = match fs::symlink_metadata(location) {
        Ok(meta) => meta,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(SavedEntry::Absent),
        Err(err) => return Err(InstallerError::from_fs(err, "failed to inspect", location)),
    };
    if cfg!(unix) && meta.file_type().is_symlink() {
        let target = fs::read_link(location)
            .map_err(|err| InstallerError::from_fs(err, "failed to read symlink", location))?;
        return Ok(SavedEntry::Symlink(target));
    }
    // Elsewhere a link is saved as a copy of what it points at.
    if !location.is_file() {
        return Ok(SavedEntry::Absent);
    }
    fs::copy(location, stash)
        .map_err(|err| InstallerError::from_fs(err, "failed to back up", location))?;
    Ok(SavedEntry::File {
        stash: stash.to_path_buf(),
        mode: file_mode(location),
    })
}

fn restore_binary(binary: &SavedBinary) -> Result<(), InstallerError> {
    let original = &binary.original;
    remove_path(original)?;
    if matches!(binary.saved, SavedEntry::Absent) {
        return Ok(());
    }
    if let Some(parent) = original.parent() {
        fs::create_dir_all(parent)
            .map_err(|err| InstallerError::from_fs(err, "failed to recreate", parent))?;
    }
    match &binary.saved {
        SavedEntry::Absent => Ok(()),
        SavedEntry::File { stash, mode } => {
            fs::copy(stash, original)
                .map_err(|err| InstallerError::from_fs(err, "failed to restore", original))?;
            set_file_mode(original, *mode)
        }
        SavedEntry::Symlink(target) => create_symlink(target, original)
            .map_err(|err| InstallerError::from_fs(err, "failed to create symlink", original)),
    }
}

fn restore_config(config_dir: &Path, stash: Option<&Path>) -> Result<(), InstallerError> {
    remove_path(config_dir)?;
    match stash {
        Some(stash) => copy_dir_recursive(stash, config_dir),
        None => Ok(()),
    }
}

/// Copies a directory tree, recreating symlinks instead of following them.
pub fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<(), InstallerError> {
    fs::create_dir_all(dst).map_err(|err| InstallerError::from_fs(err, "failed to create", dst))?;
    let entries =
        fs::read_dir(src).map_err(|err| InstallerError::from_fs(err, "failed to read", src))?;
    for entry in entries {
        let entry = entry?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        let metadata = fs::symlink_metadata(&src_path)
            .map_err(|err| InstallerError::from_fs(err, "failed to stat", &src_path))?;
        if metadata.is_dir() {
            copy_dir_recursive(&src_path, &dst_path)?;
            continue;
        }

        if cfg!(unix) && metadata.file_type().is_symlink() {
            let target = fs::read_link(&src_path)
                .map_err(|err| InstallerError::from_fs(err, "failed to read symlink", &src_path))?;
            create_symlink(&target, &dst_path)
                .map_err(|err| InstallerError::from_fs(err, "failed to create symlink", &dst_path))?;
            continue;
        }

        fs::copy(&src_path, &dst_path)
            .map_err(|err| InstallerError::from_fs(err, "failed to copy", &src_path))?;
    }
    Ok(())
}

#[cfg(unix)]
fn create_symlink(target: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(not(unix))]
fn create_symlink(_target: &Path, link: &Path) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        format!("cannot recreate symlink {}", link.display()),
    ))
}

#[cfg(unix)]
fn file_mode(path: &Path) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path).ok().map(|meta| meta.permissions().mode())
}

#[cfg(not(unix))]
fn file_mode(_path: &Path) -> Option<u32> {
    None
}

#[cfg(unix)]
fn set_file_mode(path: &Path, mode: Option<u32>) -> Result<(), InstallerError> {
    use std::os::unix::fs::PermissionsExt;
    match mode {
        Some(mode) => fs::set_permissions(path, fs::Permissions::from_mode(mode))
            .map_err(|err| InstallerError::from_fs(err, "failed to restore mode of", path)),
        None => Ok(()),
    }
}

#[cfg(not(unix))]
fn set_file_mode(_path: &Path, _mode: Option<u32>) -> Result<(), InstallerError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path_env::ShellProfileMarker;
    use tempfile::tempdir;

    fn setup(home: &Path) -> (InstallPaths, PathTarget) {
        let paths = InstallPaths::under_home(home);
        let target = PathTarget::Profile(ShellProfileMarker::for_shell(Some("bash"), &paths));
        (paths, target)
    }

    #[test]
    fn acquire_clears_and_restore_reinstates() {
        let dir = tempdir().unwrap();
        let (paths, target) = setup(dir.path());
        fs::create_dir_all(&paths.install_dir).unwrap();
        fs::write(&paths.binary_path, "OLDBIN").unwrap();
        fs::create_dir_all(paths.config_dir.join("sessions")).unwrap();
        fs::write(paths.config_dir.join("sessions/one.json"), "{}").unwrap();
        fs::write(dir.path().join(".bashrc"), "alias ll='ls -l'\n").unwrap();

        let guard = BackupGuard::acquire(&paths, &target).unwrap();
        assert_eq!(guard.saved_binary_count(), 1);
        assert!(!paths.binary_path.exists());
        assert!(!paths.config_dir.exists());

        fs::write(&paths.binary_path, "NEWBIN").unwrap();
        fs::create_dir_all(&paths.config_dir).unwrap();
        target.add(&paths).unwrap();

        guard.restore().unwrap();
        assert_eq!(fs::read(&paths.binary_path).unwrap(), b"OLDBIN");
        assert_eq!(
            fs::read_to_string(paths.config_dir.join("sessions/one.json")).unwrap(),
            "{}"
        );
        assert_eq!(
            fs::read_to_string(dir.path().join(".bashrc")).unwrap(),
            "alias ll='ls -l'\n"
        );
    }

    #[test]
    fn absent_locations_are_absent_again() {
        let dir = tempdir().unwrap();
        let (paths, target) = setup(dir.path());

        let guard = BackupGuard::acquire(&paths, &target).unwrap();
        assert_eq!(guard.saved_binary_count(), 0);
        fs::create_dir_all(&paths.install_dir).unwrap();
        fs::write(&paths.binary_path, "stub").unwrap();
        fs::create_dir_all(&paths.config_dir).unwrap();

        guard.restore().unwrap();
        assert!(!paths.binary_path.exists());
        assert!(!paths.config_dir.exists());
        assert!(!dir.path().join(".bashrc").exists());
    }

    #[test]
    fn drop_restores_when_restore_was_never_called() {
        let dir = tempdir().unwrap();
        let (paths, target) = setup(dir.path());
        fs::create_dir_all(&paths.install_dir).unwrap();
        fs::write(&paths.binary_path, "OLDBIN").unwrap();

        let result = std::panic::catch_unwind(|| {
            let _guard = BackupGuard::acquire(&paths, &target).unwrap();
            fs::write(&paths.binary_path, "NEWBIN").unwrap();
            panic!("assertion blew up mid-run");
        });
        assert!(result.is_err());
        assert_eq!(fs::read(&paths.binary_path).unwrap(), b"OLDBIN");
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_binary_is_restored_as_a_link() {
        let dir = tempdir().unwrap();
        let (paths, target) = setup(dir.path());
        let real = dir.path().join("real-myagent");
        fs::write(&real, "DEVBUILD").unwrap();
        fs::create_dir_all(&paths.install_dir).unwrap();
        std::os::unix::fs::symlink(&real, &paths.binary_path).unwrap();

        let guard = BackupGuard::acquire(&paths, &target).unwrap();
        assert_eq!(guard.saved_binary_count(), 1);
        assert!(fs::symlink_metadata(&paths.binary_path).is_err());
        assert_eq!(fs::read(&real).unwrap(), b"DEVBUILD");
        fs::write(&paths.binary_path, "NEWBIN").unwrap();

        guard.restore().unwrap();
        let meta = fs::symlink_metadata(&paths.binary_path).unwrap();
        assert!(meta.file_type().is_symlink());
        assert_eq!(fs::read_link(&paths.binary_path).unwrap(), real);
        assert_eq!(fs::read(&real).unwrap(), b"DEVBUILD");
    }

    #[cfg(unix)]
    #[test]
    fn mode_and_symlinks_survive() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let (paths, target) = setup(dir.path());
        fs::create_dir_all(&paths.install_dir).unwrap();
        fs::write(&paths.binary_path, "OLDBIN").unwrap();
        fs::set_permissions(&paths.binary_path, fs::Permissions::from_mode(0o700)).unwrap();
        fs::create_dir_all(&paths.config_dir).unwrap();
        fs::write(paths.config_dir.join("config.json"), "{}").unwrap();
        std::os::unix::fs::symlink("config.json", paths.config_dir.join("current")).unwrap();

        let guard = BackupGuard::acquire(&paths, &target).unwrap();
        guard.restore().unwrap();

        let mode = fs::metadata(&paths.binary_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
        let link = fs::read_link(paths.config_dir.join("current")).unwrap();
        assert_eq!(link, PathBuf::from("config.json"));
    }
}
