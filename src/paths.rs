use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use dirs::home_dir;
use serde::Serialize;

use crate::error::InstallerError;

pub const PROGRAM_NAME: &str = "myagent";

/// Every on-disk location the installer and uninstaller touch.
///
/// Computed once per invocation and handed to each step by reference, so a
/// step's filesystem footprint is visible from its signature.
#[derive(Debug, Clone, Serialize)]
pub struct InstallPaths {
    pub home: PathBuf,
    pub install_dir: PathBuf,
    pub binary_path: PathBuf,
    pub config_dir: PathBuf,
    pub pid_file_path: PathBuf,
}

impl InstallPaths {
    pub fn resolve() -> Result<Self, InstallerError> {
        let home = required_home_dir()?;
        Ok(Self::under_home(&home))
    }

    pub fn under_home(home: &Path) -> Self {
        let install_dir = home.join(".local").join("bin");
        let binary_path = install_dir.join(format!("{PROGRAM_NAME}{}", env::consts::EXE_SUFFIX));
        let config_dir = home.join(format!(".{PROGRAM_NAME}"));
        let pid_file_path = config_dir.join(format!("{PROGRAM_NAME}.pid"));
        Self {
            home: home.to_path_buf(),
            install_dir,
            binary_path,
            config_dir,
            pid_file_path,
        }
    }

    /// Places a previous installation of the program may live. The canonical
    /// binary path always comes first.
    pub fn known_binary_locations(&self) -> Vec<PathBuf> {
        vec![
            self.binary_path.clone(),
            self.home
                .join(".cargo")
                .join("bin")
                .join(format!("{PROGRAM_NAME}{}", env::consts::EXE_SUFFIX)),
        ]
    }
}

/// Every managed location hangs off the home directory, so a missing or
/// relative home stops the run before anything is touched.
fn required_home_dir() -> Result<PathBuf, InstallerError> {
    let home = home_dir()
        .filter(|home| !home.as_os_str().is_empty())
        .ok_or_else(|| InstallerError::Config("no home directory; set HOME".to_string()))?;
    if !home.is_absolute() {
        return Err(InstallerError::Config(format!(
            "home directory {} is not an absolute path",
            home.display()
        )));
    }
    fs::canonicalize(&home).map_err(|err| {
        InstallerError::Config(format!(
            "home directory {} is unusable: {err}",
            home.display()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locations_hang_off_home() {
        let home = PathBuf::from("/home/someone");
        let paths = InstallPaths::under_home(&home);
        assert_eq!(paths.install_dir, home.join(".local/bin"));
        assert!(paths.binary_path.starts_with(&paths.install_dir));
        assert_eq!(paths.config_dir, home.join(".myagent"));
        assert_eq!(paths.pid_file_path, home.join(".myagent/myagent.pid"));
    }

    #[test]
    fn canonical_binary_is_first_known_location() {
        let paths = InstallPaths::under_home(Path::new("/home/someone"));
        let known = paths.known_binary_locations();
        assert_eq!(known[0], paths.binary_path);
        assert!(known[1].starts_with("/home/someone/.cargo/bin"));
    }
}
