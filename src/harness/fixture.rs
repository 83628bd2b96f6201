use std::fs::{self, File};
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::InstallerError;
use crate::paths::PROGRAM_NAME;
use crate::platform::{ArchiveKind, PlatformDescriptor};
use crate::release::TEST_VERSION_TAG;

/// POSIX shell stand-in for the real program. Answers the three invocations
/// the harness and uninstaller make.
pub fn stub_script() -> String {
    format!(
        r#"#!/bin/sh
case "$1" in
  --version|-V|version)
    echo "{PROGRAM_NAME} {TEST_VERSION_TAG}"
    ;;
  status)
    echo "{PROGRAM_NAME} is not running"
    ;;
  stop)
    echo "{PROGRAM_NAME} is not running"
    ;;
  *)
    echo "{PROGRAM_NAME} {TEST_VERSION_TAG} (harness stub)"
    ;;
esac
exit 0
"#
    )
}

/// Picks the archive the local feed will serve: the one supplied by the
/// caller, or a generated stub where one can be built.
pub fn prepare_fixture(
    supplied: Option<&Path>,
    platform: &PlatformDescriptor,
    scratch: &Path,
) -> Result<PathBuf, InstallerError> {
    if let Some(path) = supplied {
        if !path.is_file() {
            return Err(InstallerError::Config(format!(
                "harness fixture not found: {}",
                path.display()
            )));
        }
        return Ok(path.to_path_buf());
    }
    match platform.archive_kind() {
        ArchiveKind::TarGz => {
            let path = scratch.join(platform.asset_filename());
            write_stub_tar_gz(&path, &platform.executable_name())?;
            Ok(path)
        }
        ArchiveKind::Zip => Err(InstallerError::Config(format!(
            "no stub fixture can be generated for {platform}; pass --fixture or set MYAGENT_HARNESS_FIXTURE"
        ))),
    }
}

fn write_stub_tar_gz(path: &Path, executable_name: &str) -> Result<(), InstallerError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let script = stub_script();
    let file = File::create(path)
        .map_err(|err| InstallerError::from_fs(err, "failed to create fixture", path))?;
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
    let mut header = tar::Header::new_gnu();
    header.set_size(script.len() as u64);
    header.set_mode(0o755);
    header.set_cksum();
    builder.append_data(
        &mut header,
        format!("{PROGRAM_NAME}-{TEST_VERSION_TAG}/{executable_name}"),
        script.as_bytes(),
    )?;
    builder.into_inner()?.finish()?;
    Ok(())
}
