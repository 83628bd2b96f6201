use std::io;
use std::path::Path;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum InstallerError {
    #[error("unsupported platform: {os}/{arch}")]
    UnsupportedPlatform { os: String, arch: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("version not found: {0}")]
    VersionNotFound(String),
    #[error("download failed: {0}")]
    Download(String),
    #[error("permission denied: {0}")]
    Permission(String),
    #[error("failed to update PATH configuration: {0}")]
    ProfileWrite(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("prompt error: {0}")]
    Prompt(#[from] dialoguer::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl InstallerError {
    pub fn code(&self) -> &'static str {
        match self {
            InstallerError::UnsupportedPlatform { .. } => "unsupported_platform",
            InstallerError::Network(_) => "network",
            InstallerError::VersionNotFound(_) => "version_not_found",
            InstallerError::Download(_) => "download",
            InstallerError::Permission(_) => "permission",
            InstallerError::ProfileWrite(_) => "profile_write",
            InstallerError::Config(_) => "config",
            InstallerError::Io(_) => "io",
            InstallerError::Prompt(_) => "prompt",
            InstallerError::Json(_) => "json",
        }
    }

    /// Maps `PermissionDenied` to the permission variant and keeps the path in the message.
    pub fn from_fs(err: io::Error, action: &str, path: &Path) -> Self {
        if err.kind() == io::ErrorKind::PermissionDenied {
            InstallerError::Permission(format!("{action} {}: {err}", path.display()))
        } else {
            InstallerError::Io(io::Error::new(
                err.kind(),
                format!("{action} {}: {err}", path.display()),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_denied_maps_to_permission_variant() {
        let err = io::Error::new(io::ErrorKind::PermissionDenied, "nope");
        let mapped = InstallerError::from_fs(err, "create directory", Path::new("/opt/x"));
        assert_eq!(mapped.code(), "permission");
        assert!(mapped.to_string().contains("/opt/x"));
    }

    #[test]
    fn other_io_errors_keep_context() {
        let err = io::Error::new(io::ErrorKind::NotFound, "gone");
        let mapped = InstallerError::from_fs(err, "read", Path::new("/tmp/y"));
        assert_eq!(mapped.code(), "io");
        assert!(mapped.to_string().contains("read /tmp/y"));
    }

    #[test]
    fn diagnostics_are_single_line() {
        let err = InstallerError::UnsupportedPlatform {
            os: "freebsd".to_string(),
            arch: "x86_64".to_string(),
        };
        assert_eq!(err.to_string(), "unsupported platform: freebsd/x86_64");
        assert!(!err.to_string().contains('\n'));
    }
}
