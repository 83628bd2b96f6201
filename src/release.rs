use reqwest::blocking::Client;
use serde::Serialize;

use crate::error::InstallerError;
use crate::platform::PlatformDescriptor;

pub const DEFAULT_REPO: &str = "vecbase-labs/myagent";
pub const GITHUB_API_BASE: &str = "https://api.github.com";
pub const GITHUB_DOWNLOAD_BASE: &str = "https://github.com";
pub const TEST_VERSION_TAG: &str = "0.0.0-test";

const TAG_KEY: &str = "\"tag_name\"";

pub fn user_agent() -> String {
    format!("myagent-installer/{}", env!("CARGO_PKG_VERSION"))
}

/// Where release metadata and assets are fetched from.
#[derive(Debug, Clone, Serialize)]
pub struct ReleaseFeed {
    pub api_base: String,
    pub download_base: String,
    pub repo: String,
    pub local: bool,
}

impl ReleaseFeed {
    pub fn github(repo: &str) -> Self {
        Self {
            api_base: GITHUB_API_BASE.to_string(),
            download_base: GITHUB_DOWNLOAD_BASE.to_string(),
            repo: repo.to_string(),
            local: false,
        }
    }

    /// A locally served feed. Both endpoints live under the same base URL.
    pub fn local(base_url: &str, repo: &str) -> Self {
        let base = base_url.trim_end_matches('/').to_string();
        Self {
            api_base: base.clone(),
            download_base: base,
            repo: repo.to_string(),
            local: true,
        }
    }

    pub fn latest_url(&self) -> String {
        format!("{}/repos/{}/releases/latest", self.api_base, self.repo)
    }

    pub fn download_url(&self, version_tag: &str, asset_filename: &str) -> String {
        format!(
            "{}/{}/releases/download/{}/{}",
            self.download_base, self.repo, version_tag, asset_filename
        )
    }

    pub fn http_client(&self) -> Result<Client, InstallerError> {
        let mut builder = Client::builder().user_agent(user_agent());
        if self.local {
            builder = builder.no_proxy();
        }
        builder
            .build()
            .map_err(|err| InstallerError::Network(format!("failed to build HTTP client: {err}")))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReleaseDescriptor {
    pub version_tag: String,
    pub asset_filename: String,
    pub download_url: String,
}

pub fn describe(
    feed: &ReleaseFeed,
    platform: &PlatformDescriptor,
    version_tag: &str,
) -> ReleaseDescriptor {
    let asset_filename = platform.asset_filename();
    ReleaseDescriptor {
        version_tag: version_tag.to_string(),
        download_url: feed.download_url(version_tag, &asset_filename),
        asset_filename,
    }
}

/// Pulls the `tag_name` string out of a release document without parsing the
/// whole thing. Whitespace and field order are irrelevant; only the key has to
/// appear verbatim. Returns `None` when the key is missing or its value is empty.
pub fn extract_tag_name(document: &str) -> Option<String> {
    let mut search_from = 0;
    while let Some(found) = document[search_from..].find(TAG_KEY) {
        let after_key = search_from + found + TAG_KEY.len();
        search_from = after_key;
        let rest = document[after_key..].trim_start();
        let Some(rest) = rest.strip_prefix(':') else {
            continue;
        };
        let rest = rest.trim_start();
        let Some(rest) = rest.strip_prefix('"') else {
            continue;
        };
        let mut value = String::new();
        let mut escaped = false;
        let mut closed = false;
        for ch in rest.chars() {
            if escaped {
                value.push(ch);
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                closed = true;
                break;
            } else {
                value.push(ch);
            }
        }
        if !closed {
            return None;
        }
        let value = value.trim().to_string();
        return if value.is_empty() { None } else { Some(value) };
    }
    None
}

pub fn fetch_latest_tag(feed: &ReleaseFeed, client: &Client) -> Result<String, InstallerError> {
    let url = feed.latest_url();
    tracing::debug!(%url, "fetching latest release metadata");
    let response = client
        .get(&url)
        .header("Accept", "application/vnd.github+json")
        .send()
        .map_err(|err| InstallerError::Network(format!("{url}: {err}")))?;
    let status = response.status();
    if !status.is_success() {
        return Err(InstallerError::Network(format!(
            "failed to resolve latest release: HTTP {status} from {url}"
        )));
    }
    let body = response
        .text()
        .map_err(|err| InstallerError::Network(format!("{url}: {err}")))?;
    extract_tag_name(&body).ok_or_else(|| {
        InstallerError::VersionNotFound(format!("no tag_name in release metadata from {url}"))
    })
}

/// Reads `major.minor.patch` from a tag like `v1.2.3` or a `--version` line
/// like `myagent 1.2.3`. Anything that does not start with three numbers is `None`.
pub fn parse_version(text: &str) -> Option<(u64, u64, u64)> {
    let word = text.split_whitespace().last()?;
    let word = word.strip_prefix('v').unwrap_or(word);
    let mut parts = word.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    let patch = parts.next()?.parse().ok()?;
    Some((major, minor, patch))
}

/// True only when both sides parse and the latest tag is not newer.
pub fn is_up_to_date(installed_version: Option<&str>, latest_tag: &str) -> bool {
    match (installed_version.and_then(parse_version), parse_version(latest_tag)) {
        (Some(installed), Some(latest)) => latest <= installed,
        _ => false,
    }
}

/// Resolves the release to install. A pinned tag skips the metadata request.
pub fn locate(
    feed: &ReleaseFeed,
    client: &Client,
    platform: &PlatformDescriptor,
    pinned_tag: Option<&str>,
) -> Result<ReleaseDescriptor, InstallerError> {
    let tag = match pinned_tag.map(str::trim) {
        Some("") => {
            return Err(InstallerError::VersionNotFound(
                "pinned version tag is empty".to_string(),
            ))
        }
        Some(tag) => tag.to_string(),
        None => fetch_latest_tag(feed, client)?,
    };
    Ok(describe(feed, platform, &tag))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::resolve;

    #[test]
    fn tag_is_found_regardless_of_layout() {
        let compact = r#"{"id":1,"tag_name":"v1.2.3","assets":[]}"#;
        assert_eq!(extract_tag_name(compact).as_deref(), Some("v1.2.3"));

        let spaced = "{\n  \"name\": \"Release\",\n  \"tag_name\"  :\n\t \"0.4.0\" ,\n  \"draft\": false\n}";
        assert_eq!(extract_tag_name(spaced).as_deref(), Some("0.4.0"));
    }

    #[test]
    fn missing_or_empty_tag_is_none() {
        assert_eq!(extract_tag_name(r#"{"name":"x"}"#), None);
        assert_eq!(extract_tag_name(r#"{"tag_name": ""}"#), None);
        assert_eq!(extract_tag_name(r#"{"tag_name": "   "}"#), None);
        assert_eq!(extract_tag_name(r#"{"tag_name": "unterminated"#), None);
    }

    #[test]
    fn key_mentioned_in_a_value_is_skipped() {
        let doc = r#"{"body": "see \"tag_name\" docs", "tag_name": "v2.0.0"}"#;
        assert_eq!(extract_tag_name(doc).as_deref(), Some("v2.0.0"));
    }

    #[test]
    fn download_url_is_a_fixed_template() {
        let feed = ReleaseFeed::github(DEFAULT_REPO);
        let platform = resolve("linux", "aarch64", None).unwrap();
        let release = describe(&feed, &platform, "v0.3.1");
        assert_eq!(release.asset_filename, "myagent-linux-aarch64.tar.gz");
        assert_eq!(
            release.download_url,
            "https://github.com/vecbase-labs/myagent/releases/download/v0.3.1/myagent-linux-aarch64.tar.gz"
        );
        assert_eq!(
            feed.latest_url(),
            "https://api.github.com/repos/vecbase-labs/myagent/releases/latest"
        );
    }

    #[test]
    fn local_feed_shares_one_base() {
        let feed = ReleaseFeed::local("http://127.0.0.1:4000/", "acme/tool");
        assert_eq!(
            feed.latest_url(),
            "http://127.0.0.1:4000/repos/acme/tool/releases/latest"
        );
        assert_eq!(
            feed.download_url(TEST_VERSION_TAG, "a.zip"),
            "http://127.0.0.1:4000/acme/tool/releases/download/0.0.0-test/a.zip"
        );
    }

    #[test]
    fn versions_compare_numerically() {
        assert_eq!(parse_version("v1.10.0"), Some((1, 10, 0)));
        assert_eq!(parse_version("myagent 0.3.1\n"), Some((0, 3, 1)));
        assert_eq!(parse_version(TEST_VERSION_TAG), None);
        assert_eq!(parse_version(""), None);

        assert!(is_up_to_date(Some("myagent 1.10.0"), "v1.9.9"));
        assert!(is_up_to_date(Some("myagent 1.2.0"), "v1.2.0"));
        assert!(!is_up_to_date(Some("myagent 1.2.0"), "v1.2.1"));
        assert!(!is_up_to_date(None, "v1.2.0"));
        assert!(!is_up_to_date(Some("garbage"), "v1.2.0"));
    }

    #[test]
    fn pinned_tag_skips_the_network() {
        let feed = ReleaseFeed::local("http://127.0.0.1:9", DEFAULT_REPO);
        let client = feed.http_client().unwrap();
        let platform = resolve("linux", "x86_64", None).unwrap();
        let release = locate(&feed, &client, &platform, Some(" v9.9.9 ")).unwrap();
        assert_eq!(release.version_tag, "v9.9.9");

        let err = locate(&feed, &client, &platform, Some("")).unwrap_err();
        assert_eq!(err.code(), "version_not_found");
    }
}
