use std::env;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::error::InstallerError;
use crate::paths::InstallPaths;

pub const BLOCK_BEGIN: &str = "# >>> myagent >>>";
pub const BLOCK_END: &str = "# <<< myagent <<<";

/// A sentinel-delimited region appended to a text file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkedBlock {
    body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRemoval {
    pub content: String,
    /// Nothing but the block was in the file, so the file itself should go.
    pub delete_file: bool,
}

impl MarkedBlock {
    pub fn new(body: impl Into<String>) -> Self {
        Self { body: body.into() }
    }

    pub fn rendered(&self) -> String {
        format!("{BLOCK_BEGIN}\n{}\n{BLOCK_END}\n", self.body)
    }

    pub fn contains(content: &str) -> bool {
        content.lines().any(|line| line.trim_end() == BLOCK_BEGIN)
    }

    /// Returns the new file content, or `None` when a block is already present.
    /// `existing` is `None` when the file does not exist yet.
    pub fn insert(&self, existing: Option<&str>) -> Option<String> {
        match existing {
            Some(content) if Self::contains(content) => None,
            Some(content) => Some(format!("{content}\n{}", self.rendered())),
            None => Some(self.rendered()),
        }
    }

    /// Cuts the sentinel-bounded region and the separator `insert` put before
    /// it. Every other byte is left alone. `None` when no block is present.
    pub fn remove(content: &str) -> Option<BlockRemoval> {
        let mut offset = 0;
        let mut begin: Option<usize> = None;
        let mut stop: Option<usize> = None;
        for line in content.split_inclusive('\n') {
            let start = offset;
            offset += line.len();
            let trimmed = line.trim_end();
            match begin {
                None if trimmed == BLOCK_BEGIN => begin = Some(start),
                Some(_) if trimmed == BLOCK_END => {
                    stop = Some(offset);
                    break;
                }
                _ => {}
            }
        }
        let begin = begin?;
        // An unterminated block only loses its opening sentinel.
        let stop = stop.unwrap_or_else(|| {
            content[begin..]
                .find('\n')
                .map(|pos| begin + pos + 1)
                .unwrap_or(content.len())
        });

        let prefix = &content[..begin];
        let suffix = &content[stop..];
        let delete_file = prefix.is_empty() && suffix.is_empty();
        let prefix = if prefix.ends_with('\n') && (suffix.is_empty() || prefix.ends_with("\n\n")) {
            &prefix[..prefix.len() - 1]
        } else {
            prefix
        };
        Some(BlockRemoval {
            content: format!("{prefix}{suffix}"),
            delete_file,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShellKind {
    Zsh,
    Bash,
    Fish,
    Posix,
}

impl ShellKind {
    pub fn from_shell_path(shell: Option<&str>) -> Self {
        let name = shell
            .and_then(|value| Path::new(value.trim()).file_name())
            .and_then(|name| name.to_str())
            .unwrap_or_default();
        match name {
            "zsh" => ShellKind::Zsh,
            "bash" => ShellKind::Bash,
            "fish" => ShellKind::Fish,
            _ => ShellKind::Posix,
        }
    }
}

/// The one profile file a run targets, and the block it manages there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellProfileMarker {
    pub shell: ShellKind,
    pub profile_path: PathBuf,
    pub block: MarkedBlock,
}

impl ShellProfileMarker {
    pub fn for_shell(shell: Option<&str>, paths: &InstallPaths) -> Self {
        let shell = ShellKind::from_shell_path(shell);
        let home = &paths.home;
        let dir = paths.install_dir.display();
        let (profile_path, body) = match shell {
            ShellKind::Zsh => (home.join(".zshrc"), format!("export PATH=\"{dir}:$PATH\"")),
            ShellKind::Bash => (home.join(".bashrc"), format!("export PATH=\"{dir}:$PATH\"")),
            ShellKind::Fish => (
                home.join(".config").join("fish").join("config.fish"),
                format!("set -gx PATH \"{dir}\" $PATH"),
            ),
            ShellKind::Posix => (home.join(".profile"), format!("export PATH=\"{dir}:$PATH\"")),
        };
        Self {
            shell,
            profile_path,
            block: MarkedBlock::new(body),
        }
    }

    fn read(&self) -> Result<Option<String>, InstallerError> {
        match fs::read_to_string(&self.profile_path) {
            Ok(content) => Ok(Some(content)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(profile_error(&self.profile_path, err)),
        }
    }

    /// The file edits land in. A symlinked profile is followed so the link
    /// itself survives and the block comes out of the file it went into.
    fn resolved_path(&self) -> PathBuf {
        fs::canonicalize(&self.profile_path).unwrap_or_else(|_| self.profile_path.clone())
    }

    fn add(&self) -> Result<PathChange, InstallerError> {
        let existing = self.read()?;
        let Some(updated) = self.block.insert(existing.as_deref()) else {
            return Ok(PathChange::AlreadyPresent);
        };
        // `insert` only ever appends, so only the new tail is written.
        let appended = &updated[existing.as_deref().map_or(0, str::len)..];
        if let Some(parent) = self.profile_path.parent() {
            fs::create_dir_all(parent).map_err(|err| profile_error(parent, err))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.profile_path)
            .map_err(|err| profile_error(&self.profile_path, err))?;
        file.write_all(appended.as_bytes())
            .map_err(|err| profile_error(&self.profile_path, err))?;
        Ok(PathChange::Added)
    }

    fn remove(&self) -> Result<PathChange, InstallerError> {
        let Some(existing) = self.read()? else {
            return Ok(PathChange::AlreadyAbsent);
        };
        let Some(removal) = MarkedBlock::remove(&existing) else {
            return Ok(PathChange::AlreadyAbsent);
        };
        let target = self.resolved_path();
        if removal.delete_file {
            fs::remove_file(&target).map_err(|err| profile_error(&target, err))?;
        } else {
            write_atomic_text_file_preserving_mode(&target, &removal.content)
                .map_err(|err| profile_error(&target, err))?;
        }
        Ok(PathChange::Removed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PathChange {
    Added,
    AlreadyPresent,
    Removed,
    AlreadyAbsent,
}

/// Captured state of whatever `PathTarget` mutates, for the test harness.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSnapshot {
    Profile(Option<Vec<u8>>),
    Registry(Option<UserPathValue>),
}

/// The user `Path` registry value and whether it is stored as `REG_EXPAND_SZ`.
#[cfg_attr(not(windows), allow(dead_code))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserPathValue {
    pub value: String,
    pub expandable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathTarget {
    Profile(ShellProfileMarker),
    /// `HKCU\Environment\Path`; only usable on Windows.
    UserRegistry,
}

impl PathTarget {
    pub fn detect(paths: &InstallPaths) -> Self {
        if cfg!(windows) {
            return PathTarget::UserRegistry;
        }
        let shell = env::var("SHELL").ok();
        PathTarget::Profile(ShellProfileMarker::for_shell(shell.as_deref(), paths))
    }

    pub fn describe(&self) -> String {
        match self {
            PathTarget::Profile(marker) => marker.profile_path.display().to_string(),
            PathTarget::UserRegistry => r"HKCU\Environment\Path".to_string(),
        }
    }

    pub fn add(&self, paths: &InstallPaths) -> Result<PathChange, InstallerError> {
        let change = match self {
            PathTarget::Profile(marker) => marker.add()?,
            PathTarget::UserRegistry => registry::add(&paths.install_dir)?,
        };
        tracing::info!(target_file = %self.describe(), ?change, "path entry add");
        Ok(change)
    }

    pub fn remove(&self, paths: &InstallPaths) -> Result<PathChange, InstallerError> {
        let change = match self {
            PathTarget::Profile(marker) => marker.remove()?,
            PathTarget::UserRegistry => registry::remove(&paths.install_dir)?,
        };
        tracing::info!(target_file = %self.describe(), ?change, "path entry remove");
        Ok(change)
    }

    /// Whether the install directory is currently managed by this target.
    pub fn contains_entry(&self, paths: &InstallPaths) -> Result<bool, InstallerError> {
        match self {
            PathTarget::Profile(marker) => Ok(marker
                .read()?
                .as_deref()
                .is_some_and(MarkedBlock::contains)),
            PathTarget::UserRegistry => Ok(registry::read_user_path()?
                .is_some_and(|current| {
                    path_list_contains(&current.value, &paths.install_dir.display().to_string())
                })),
        }
    }

    pub fn snapshot(&self) -> Result<PathSnapshot, InstallerError> {
        match self {
            PathTarget::Profile(marker) => match fs::read(&marker.profile_path) {
                Ok(bytes) => Ok(PathSnapshot::Profile(Some(bytes))),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    Ok(PathSnapshot::Profile(None))
                }
                Err(err) => Err(profile_error(&marker.profile_path, err)),
            },
            PathTarget::UserRegistry => Ok(PathSnapshot::Registry(registry::read_user_path()?)),
        }
    }

    /// Puts the captured state back. A no-op when nothing changed.
    pub fn restore(&self, snapshot: &PathSnapshot) -> Result<(), InstallerError> {
        if self.snapshot().ok().as_ref() == Some(snapshot) {
            return Ok(());
        }
        match (self, snapshot) {
            (PathTarget::Profile(marker), PathSnapshot::Profile(Some(bytes))) => {
                fs::write(&marker.profile_path, bytes)
                    .map_err(|err| profile_error(&marker.profile_path, err))
            }
            (PathTarget::Profile(marker), PathSnapshot::Profile(None)) => {
                match fs::remove_file(&marker.profile_path) {
                    Ok(()) => Ok(()),
                    Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
                    Err(err) => Err(profile_error(&marker.profile_path, err)),
                }
            }
            (PathTarget::UserRegistry, PathSnapshot::Registry(value)) => {
                registry::write_user_path(value.as_ref())
            }
            _ => Err(InstallerError::Config(
                "path snapshot does not match the path target".to_string(),
            )),
        }
    }
}

fn profile_error(path: &Path, err: io::Error) -> InstallerError {
    InstallerError::ProfileWrite(format!("{}: {err}", path.display()))
}

fn write_atomic_text_file_preserving_mode(path: &Path, content: &str) -> io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let tmp_path = parent.join(format!(
        ".{}.tmp.{}.{}",
        path.file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "profile".to_string()),
        std::process::id(),
        ts
    ));
    let permissions = fs::metadata(path)?.permissions();
    fs::write(&tmp_path, content)?;
    fs::set_permissions(&tmp_path, permissions)?;
    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err);
    }
    Ok(())
}

/// Pure string edits on a `;`-separated Windows path value.
pub fn path_list_contains(value: &str, dir: &str) -> bool {
    value.to_ascii_lowercase().contains(&dir.to_ascii_lowercase())
}

#[cfg(any(windows, test))]
pub fn path_list_prepend(value: &str, dir: &str) -> String {
    if value.trim().is_empty() {
        dir.to_string()
    } else {
        format!("{dir};{value}")
    }
}

#[cfg(any(windows, test))]
pub fn path_list_without(value: &str, dir: &str) -> Option<String> {
    let normalized = dir.trim_end_matches('\\');
    let kept: Vec<&str> = value
        .split(';')
        .filter(|entry| !entry.trim_end_matches('\\').eq_ignore_ascii_case(normalized))
        .collect();
    let rebuilt = kept.join(";");
    if rebuilt == value {
        None
    } else {
        Some(rebuilt)
    }
}

/// The value after adding `dir`, keeping the stored type. A missing value is
/// created as `REG_EXPAND_SZ`, the type Windows itself uses for `Path`.
#[cfg(any(windows, test))]
fn user_path_with(current: Option<&UserPathValue>, dir: &str) -> Option<UserPathValue> {
    match current {
        Some(current) if path_list_contains(&current.value, dir) => None,
        Some(current) => Some(UserPathValue {
            value: path_list_prepend(&current.value, dir),
            expandable: current.expandable,
        }),
        None => Some(UserPathValue {
            value: dir.to_string(),
            expandable: true,
        }),
    }
}

#[cfg(any(windows, test))]
fn user_path_without(current: &UserPathValue, dir: &str) -> Option<UserPathValue> {
    path_list_without(&current.value, dir).map(|value| UserPathValue {
        value,
        expandable: current.expandable,
    })
}

/// NUL-terminated UTF-16LE, the wire form of a registry string value.
#[cfg(any(windows, test))]
fn encode_registry_string(value: &str) -> Vec<u8> {
    value
        .encode_utf16()
        .chain(std::iter::once(0))
        .flat_map(u16::to_le_bytes)
        .collect()
}

#[cfg(windows)]
mod registry {
    use std::env;
    use std::io;
    use std::path::Path;

    use winreg::enums::{RegType, HKEY_CURRENT_USER, KEY_READ};
    use winreg::{RegKey, RegValue};

    use super::{
        encode_registry_string, path_list_contains, path_list_prepend, user_path_with,
        user_path_without, PathChange, UserPathValue,
    };
    use crate::error::InstallerError;

    const ENVIRONMENT_KEY: &str = "Environment";
    const PATH_VALUE: &str = "Path";

    fn registry_error(err: io::Error) -> InstallerError {
        InstallerError::ProfileWrite(format!(r"HKCU\Environment\Path: {err}"))
    }

    pub fn read_user_path() -> Result<Option<UserPathValue>, InstallerError> {
        let hkcu = RegKey::predef(HKEY_CURRENT_USER);
        let key = match hkcu.open_subkey_with_flags(ENVIRONMENT_KEY, KEY_READ) {
            Ok(key) => key,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(registry_error(err)),
        };
        let raw = match key.get_raw_value(PATH_VALUE) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(registry_error(err)),
        };
        let expandable = matches!(raw.vtype, RegType::REG_EXPAND_SZ);
        let value = key
            .get_value::<String, _>(PATH_VALUE)
            .map_err(registry_error)?;
        Ok(Some(UserPathValue { value, expandable }))
    }

    pub fn write_user_path(value: Option<&UserPathValue>) -> Result<(), InstallerError> {
        let hkcu = RegKey::predef(HKEY_CURRENT_USER);
        let (key, _) = hkcu
            .create_subkey(ENVIRONMENT_KEY)
            .map_err(registry_error)?;
        match value {
            Some(path) => {
                let vtype = if path.expandable {
                    RegType::REG_EXPAND_SZ
                } else {
                    RegType::REG_SZ
                };
                let raw = RegValue {
                    bytes: encode_registry_string(&path.value).into(),
                    vtype,
                };
                key.set_raw_value(PATH_VALUE, &raw).map_err(registry_error)
            }
            None => match key.delete_value(PATH_VALUE) {
                Ok(()) => Ok(()),
                Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(err) => Err(registry_error(err)),
            },
        }
    }

    pub fn add(install_dir: &Path) -> Result<PathChange, InstallerError> {
        let dir = install_dir.display().to_string();
        let current = read_user_path()?;
        let Some(updated) = user_path_with(current.as_ref(), &dir) else {
            return Ok(PathChange::AlreadyPresent);
        };
        write_user_path(Some(&updated))?;
        // The running session should see the command without a restart.
        let process_path = env::var("PATH").unwrap_or_default();
        if !path_list_contains(&process_path, &dir) {
            env::set_var("PATH", path_list_prepend(&process_path, &dir));
        }
        Ok(PathChange::Added)
    }

    pub fn remove(install_dir: &Path) -> Result<PathChange, InstallerError> {
        let dir = install_dir.display().to_string();
        let Some(current) = read_user_path()? else {
            return Ok(PathChange::AlreadyAbsent);
        };
        match user_path_without(&current, &dir) {
            Some(updated) => {
                write_user_path(Some(&updated))?;
                Ok(PathChange::Removed)
            }
            None => Ok(PathChange::AlreadyAbsent),
        }
    }
}

#[cfg(not(windows))]
mod registry {
    use std::path::Path;

    use super::{PathChange, UserPathValue};
    use crate::error::InstallerError;

    fn unsupported() -> InstallerError {
        InstallerError::Config("the user path registry only exists on Windows".to_string())
    }

    pub fn read_user_path() -> Result<Option<UserPathValue>, InstallerError> {
        Err(unsupported())
    }

    pub fn write_user_path(_value: Option<&UserPathValue>) -> Result<(), InstallerError> {
        Err(unsupported())
    }

    pub fn add(_install_dir: &Path) -> Result<PathChange, InstallerError> {
        Err(unsupported())
    }

    pub fn remove(_install_dir: &Path) -> Result<PathChange, InstallerError> {
        Err(unsupported())
    }
}
