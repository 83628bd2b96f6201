use std::env;
use std::fs;
use std::net::{Ipv4Addr, TcpListener};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::Duration;

use tempfile::TempDir;

use crate::error::InstallerError;
use crate::platform::PlatformDescriptor;
use crate::release::{ReleaseFeed, TEST_VERSION_TAG};

const STARTUP_DELAY: Duration = Duration::from_millis(500);

/// A synthetic release feed served by a detached `serve-feed` child process.
///
/// The child is killed and reaped when this value is dropped.
pub struct LocalFeed {
    _root: TempDir,
    child: Child,
    base_url: String,
    repo: String,
}

impl LocalFeed {
    pub fn launch(
        fixture: &Path,
        platform: &PlatformDescriptor,
        repo: &str,
    ) -> Result<Self, InstallerError> {
        let root = tempfile::Builder::new()
            .prefix("myagent-feed-")
            .tempdir()?;
        layout_feed(root.path(), fixture, platform, repo)?;

        let port = free_loopback_port()?;
        let exe = env::current_exe()?;
        let mut child = Command::new(exe)
            .arg("serve-feed")
            .arg("--root")
            .arg(root.path())
            .arg("--port")
            .arg(port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|err| InstallerError::Config(format!("failed to start local feed: {err}")))?;
        thread::sleep(STARTUP_DELAY);
        if let Some(status) = child.try_wait()? {
            return Err(InstallerError::Config(format!(
                "local feed exited during startup with {status}"
            )));
        }

        let base_url = format!("http://127.0.0.1:{port}");
        tracing::info!(pid = child.id(), %base_url, "local feed started");
        Ok(Self {
            _root: root,
            child,
            base_url,
            repo: repo.to_string(),
        })
    }

    pub fn feed(&self) -> ReleaseFeed {
        ReleaseFeed::local(&self.base_url, &self.repo)
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }
}

impl Drop for LocalFeed {
    fn drop(&mut self) {
        if let Err(err) = self.child.kill() {
            tracing::warn!(pid = self.child.id(), error = %err, "failed to stop local feed");
        }
        let _ = self.child.wait();
    }
}

/// Writes the stub `latest` document and the asset where the feed URLs expect them.
pub fn layout_feed(
    root: &Path,
    fixture: &Path,
    platform: &PlatformDescriptor,
    repo: &str,
) -> Result<PathBuf, InstallerError> {
    let latest_dir = root.join("repos").join(repo).join("releases");
    fs::create_dir_all(&latest_dir)?;
    let document = serde_json::json!({
        "tag_name": TEST_VERSION_TAG,
        "name": format!("myagent {TEST_VERSION_TAG}"),
        "draft": false,
        "prerelease": true,
    });
    fs::write(
        latest_dir.join("latest"),
        serde_json::to_vec_pretty(&document)?,
    )?;

    let asset_dir = root
        .join(repo)
        .join("releases")
        .join("download")
        .join(TEST_VERSION_TAG);
    fs::create_dir_all(&asset_dir)?;
    let asset = asset_dir.join(platform.asset_filename());
    fs::copy(fixture, &asset)
        .map_err(|err| InstallerError::from_fs(err, "failed to stage fixture", fixture))?;
    Ok(asset)
}

fn free_loopback_port() -> Result<u16, InstallerError> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    Ok(listener.local_addr()?.port())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::resolve;
    use crate::release::extract_tag_name;
    use tempfile::tempdir;

    #[test]
    fn layout_matches_feed_urls() {
        let dir = tempdir().unwrap();
        let fixture = dir.path().join("fixture.tar.gz");
        fs::write(&fixture, "archive").unwrap();
        let root = dir.path().join("root");
        let platform = resolve("linux", "aarch64", None).unwrap();

        let asset = layout_feed(&root, &fixture, &platform, "acme/tool").unwrap();

        let feed = ReleaseFeed::local("http://127.0.0.1:1", "acme/tool");
        let latest_rel = feed.latest_url().replace("http://127.0.0.1:1/", "");
        let latest = fs::read_to_string(root.join(latest_rel)).unwrap();
        assert_eq!(extract_tag_name(&latest).as_deref(), Some(TEST_VERSION_TAG));

        let asset_rel = feed
            .download_url(TEST_VERSION_TAG, &platform.asset_filename())
            .replace("http://127.0.0.1:1/", "");
        assert_eq!(asset, root.join(asset_rel));
        assert_eq!(fs::read_to_string(&asset).unwrap(), "archive");
    }
}
