use std::env;
use std::fmt;
use std::process::Command;

use serde::Serialize;

use crate::error::InstallerError;
use crate::paths::PROGRAM_NAME;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OsFamily {
    Linux,
    Darwin,
    Windows,
}

impl OsFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            OsFamily::Linux => "linux",
            OsFamily::Darwin => "darwin",
            OsFamily::Windows => "windows",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Arch {
    #[serde(rename = "x86_64")]
    X86_64,
    #[serde(rename = "aarch64")]
    Aarch64,
}

impl Arch {
    pub fn as_str(&self) -> &'static str {
        match self {
            Arch::X86_64 => "x86_64",
            Arch::Aarch64 => "aarch64",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveKind {
    TarGz,
    Zip,
}

impl ArchiveKind {
    pub fn extension(&self) -> &'static str {
        match self {
            ArchiveKind::TarGz => "tar.gz",
            ArchiveKind::Zip => "zip",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PlatformDescriptor {
    pub os: OsFamily,
    pub arch: Arch,
}

impl fmt::Display for PlatformDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os.as_str(), self.arch.as_str())
    }
}

/// Every (os, arch) pair a release asset is published for.
pub const SUPPORTED_MATRIX: &[(OsFamily, Arch)] = &[
    (OsFamily::Linux, Arch::X86_64),
    (OsFamily::Linux, Arch::Aarch64),
    (OsFamily::Darwin, Arch::X86_64),
    (OsFamily::Darwin, Arch::Aarch64),
    (OsFamily::Windows, Arch::X86_64),
];

impl PlatformDescriptor {
    pub fn detect() -> Result<Self, InstallerError> {
        let os = env::consts::OS;
        let arch = env::consts::ARCH;
        resolve(os, arch, probe_translated(os))
    }

    pub fn archive_kind(&self) -> ArchiveKind {
        match self.os {
            OsFamily::Windows => ArchiveKind::Zip,
            OsFamily::Linux | OsFamily::Darwin => ArchiveKind::TarGz,
        }
    }

    pub fn executable_name(&self) -> String {
        match self.os {
            OsFamily::Windows => format!("{PROGRAM_NAME}.exe"),
            OsFamily::Linux | OsFamily::Darwin => PROGRAM_NAME.to_string(),
        }
    }

    pub fn asset_filename(&self) -> String {
        format!(
            "{}-{}-{}.{}",
            PROGRAM_NAME,
            self.os.as_str(),
            self.arch.as_str(),
            self.archive_kind().extension()
        )
    }
}

fn normalize_os(raw: &str) -> Option<OsFamily> {
    let value = raw.trim().to_ascii_lowercase();
    match value.as_str() {
        "linux" => Some(OsFamily::Linux),
        "macos" | "darwin" | "osx" => Some(OsFamily::Darwin),
        "windows" | "win32" | "windows_nt" => Some(OsFamily::Windows),
        other
            if other.starts_with("mingw")
                || other.starts_with("msys")
                || other.starts_with("cygwin") =>
        {
            Some(OsFamily::Windows)
        }
        _ => None,
    }
}

fn normalize_arch(raw: &str) -> Option<Arch> {
    let value = raw.trim().to_ascii_lowercase();
    match value.as_str() {
        "x86_64" | "amd64" | "x64" => Some(Arch::X86_64),
        "aarch64" | "arm64" => Some(Arch::Aarch64),
        _ => None,
    }
}

/// Maps raw OS/architecture signals onto the published asset matrix.
///
/// `translated` is the emulation probe: `Some(true)` on a darwin host means the
/// current process runs under x86_64 translation on ARM hardware, so the native
/// aarch64 asset is selected instead.
pub fn resolve(
    raw_os: &str,
    raw_arch: &str,
    translated: Option<bool>,
) -> Result<PlatformDescriptor, InstallerError> {
    let unsupported = || InstallerError::UnsupportedPlatform {
        os: raw_os.trim().to_string(),
        arch: raw_arch.trim().to_string(),
    };
    let os = normalize_os(raw_os).ok_or_else(unsupported)?;
    let mut arch = normalize_arch(raw_arch).ok_or_else(unsupported)?;
    if os == OsFamily::Darwin && arch == Arch::X86_64 && translated == Some(true) {
        tracing::debug!("translated process detected; selecting native aarch64 asset");
        arch = Arch::Aarch64;
    }
    if !SUPPORTED_MATRIX.contains(&(os, arch)) {
        return Err(unsupported());
    }
    Ok(PlatformDescriptor { os, arch })
}

/// Asks the kernel whether this process runs under Rosetta. Only darwin has a probe.
fn probe_translated(raw_os: &str) -> Option<bool> {
    if normalize_os(raw_os) != Some(OsFamily::Darwin) {
        return None;
    }
    let output = Command::new("sysctl")
        .arg("-n")
        .arg("sysctl.proc_translated")
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).trim() == "1")
}
