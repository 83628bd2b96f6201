mod archive;
mod daemon;
mod error;
mod feed_server;
mod harness;
mod install;
mod path_env;
mod paths;
mod platform;
mod release;
mod uninstall;

use std::io;
use std::path::PathBuf;

use clap::builder::BoolishValueParser;
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use tracing_subscriber::EnvFilter;

use crate::daemon::SystemRunner;
use crate::error::InstallerError;
use crate::harness::HarnessOptions;
use crate::install::InstallOptions;
use crate::path_env::PathTarget;
use crate::paths::InstallPaths;
use crate::platform::PlatformDescriptor;
use crate::release::{ReleaseFeed, DEFAULT_REPO};
use crate::uninstall::{Confirmation, StepOutcome};

const LOG_ENV: &str = "MYAGENT_INSTALLER_LOG";

#[derive(Parser, Debug)]
#[command(
    name = "myagent-installer",
    version,
    about = "Install, remove and smoke-test the myagent CLI"
)]
struct Cli {
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Download the latest release into ~/.local/bin and put it on PATH
    Install {
        /// Install this tag instead of the latest release
        #[arg(long = "version-tag", env = "MYAGENT_VERSION")]
        version_tag: Option<String>,
        #[arg(long, env = "MYAGENT_RELEASE_REPO", default_value = DEFAULT_REPO)]
        repo: String,
        /// Base URL of a locally served release feed
        #[arg(long, env = "MYAGENT_LOCAL_FEED")]
        local_feed: Option<String>,
        #[arg(
            long,
            env = "MYAGENT_NO_MODIFY_PATH",
            value_parser = BoolishValueParser::new(),
            default_value_t = false
        )]
        no_modify_path: bool,
    },
    /// Stop the daemon and remove the binary, its data and the PATH entry
    Uninstall {
        #[arg(
            long,
            short = 'y',
            env = "MYAGENT_ASSUME_YES",
            value_parser = BoolishValueParser::new(),
            default_value_t = false
        )]
        yes: bool,
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    /// Back up, install, verify, uninstall, and restore
    Harness {
        /// Serve a synthetic release from a local feed instead of GitHub
        #[arg(long, default_value_t = false)]
        local: bool,
        #[arg(long, env = "MYAGENT_HARNESS_FIXTURE")]
        fixture: Option<PathBuf>,
        #[arg(long, env = "MYAGENT_RELEASE_REPO", default_value = DEFAULT_REPO)]
        repo: String,
        #[arg(long = "version-tag", env = "MYAGENT_VERSION")]
        version_tag: Option<String>,
    },
    /// Print every location the installer manages
    Paths,
    #[command(hide = true)]
    ServeFeed {
        #[arg(long)]
        root: PathBuf,
        #[arg(long)]
        port: u16,
    },
}

#[derive(Debug, Serialize)]
struct JsonResult<T: Serialize> {
    ok: bool,
    result: Option<T>,
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_code: Option<&'static str>,
}

struct Context {
    json: bool,
}

fn main() -> Result<(), InstallerError> {
    init_tracing();
    let cli = Cli::parse();
    let ctx = Context { json: cli.json };
    let runner = SystemRunner;

    let result = match cli.command {
        Commands::Install {
            version_tag,
            repo,
            local_feed,
            no_modify_path,
        } => handle_install(
            &ctx,
            version_tag,
            &repo,
            local_feed.as_deref(),
            !no_modify_path,
            &runner,
        ),
        Commands::Uninstall { yes, dry_run } => handle_uninstall(&ctx, yes, dry_run, &runner),
        Commands::Harness {
            local,
            fixture,
            repo,
            version_tag,
        } => handle_harness(
            &ctx,
            HarnessOptions {
                local,
                fixture,
                repo,
                pinned_tag: version_tag,
            },
            &runner,
        ),
        Commands::Paths => handle_paths(&ctx),
        Commands::ServeFeed { root, port } => feed_server::serve(&root, port),
    };

    if let Err(err) = result {
        tracing::debug!(code = err.code(), "command failed");
        if ctx.json {
            let payload = JsonResult::<serde_json::Value> {
                ok: false,
                result: None,
                error: Some(err.to_string()),
                error_code: Some(err.code()),
            };
            print_json(&payload)?;
        } else {
            eprintln!("myagent-installer: {err}");
        }
        std::process::exit(1);
    }

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .try_init();
}

fn handle_install(
    ctx: &Context,
    version_tag: Option<String>,
    repo: &str,
    local_feed: Option<&str>,
    modify_path: bool,
    runner: &SystemRunner,
) -> Result<(), InstallerError> {
    let platform = PlatformDescriptor::detect()?;
    let paths = InstallPaths::resolve()?;
    let feed = match local_feed.map(str::trim).filter(|url| !url.is_empty()) {
        Some(url) => ReleaseFeed::local(url, repo),
        None => ReleaseFeed::github(repo),
    };
    let path_target = PathTarget::detect(&paths);
    let options = InstallOptions {
        pinned_tag: version_tag,
        modify_path,
    };
    let report = install::install(&feed, &platform, &paths, &path_target, &options, runner)?;
    output(ctx, &report, report.lines())
}

fn handle_uninstall(
    ctx: &Context,
    yes: bool,
    dry_run: bool,
    runner: &SystemRunner,
) -> Result<(), InstallerError> {
    let paths = InstallPaths::resolve()?;
    if uninstall::confirm_uninstall(&paths, yes, dry_run)? == Confirmation::Declined {
        return output(
            ctx,
            &json!({ "action": "uninstall", "cancelled": true }),
            vec!["uninstall cancelled".to_string()],
        );
    }
    let path_target = PathTarget::detect(&paths);
    let report = uninstall::uninstall(&paths, &path_target, runner, dry_run)?;
    let lines = report
        .steps
        .iter()
        .map(|step| {
            let verb = match step.outcome {
                StepOutcome::Removed => "removed",
                StepOutcome::AlreadyAbsent => "already absent",
                StepOutcome::Attempted => "attempted",
                StepOutcome::Skipped => "skipped",
                StepOutcome::WouldRemove => "would remove",
            };
            match &step.detail {
                Some(detail) => format!("{verb}: {} ({detail})", step.target),
                None => format!("{verb}: {}", step.target),
            }
        })
        .collect();
    output(ctx, &report, lines)
}

fn handle_harness(
    ctx: &Context,
    options: HarnessOptions,
    runner: &SystemRunner,
) -> Result<(), InstallerError> {
    let platform = PlatformDescriptor::detect()?;
    let paths = InstallPaths::resolve()?;
    let path_target = PathTarget::detect(&paths);
    let report = harness::run(&paths, &platform, &path_target, &options, runner)?;
    if ctx.json {
        print_json(&JsonResult {
            ok: report.succeeded(),
            error: (!report.succeeded())
                .then(|| format!("{} assertion(s) failed", report.failed)),
            error_code: None,
            result: Some(&report),
        })?;
    } else {
        for line in report.lines() {
            println!("{line}");
        }
    }
    if !report.succeeded() {
        std::process::exit(1);
    }
    Ok(())
}

fn handle_paths(ctx: &Context) -> Result<(), InstallerError> {
    let paths = InstallPaths::resolve()?;
    let path_target = PathTarget::detect(&paths);
    let platform = PlatformDescriptor::detect();
    let payload = json!({
        "home": paths.home,
        "install_dir": paths.install_dir,
        "binary_path": paths.binary_path,
        "binary_exists": paths.binary_path.is_file(),
        "config_dir": paths.config_dir,
        "config_exists": paths.config_dir.is_dir(),
        "pid_file_path": paths.pid_file_path,
        "path_target": path_target.describe(),
        "shell": match &path_target {
            PathTarget::Profile(marker) => Some(marker.shell),
            PathTarget::UserRegistry => None,
        },
        "known_binary_locations": paths.known_binary_locations(),
        "platform": platform.as_ref().ok(),
        "asset": platform.as_ref().ok().map(|p| p.asset_filename()),
    });
    let mut lines = vec![
        format!("install_dir: {}", paths.install_dir.display()),
        format!("binary_path: {}", paths.binary_path.display()),
        format!("config_dir: {}", paths.config_dir.display()),
        format!("pid_file_path: {}", paths.pid_file_path.display()),
        format!("path_target: {}", path_target.describe()),
    ];
    match &platform {
        Ok(platform) => lines.push(format!(
            "platform: {platform} ({})",
            platform.asset_filename()
        )),
        Err(err) => lines.push(format!("platform: {err}")),
    }
    output(ctx, &payload, lines)
}

fn output<T: Serialize>(ctx: &Context, payload: &T, lines: Vec<String>) -> Result<(), InstallerError> {
    if ctx.json {
        let wrapper = JsonResult {
            ok: true,
            result: Some(payload),
            error: None,
            error_code: None,
        };
        print_json(&wrapper)?;
    } else {
        for line in lines {
            println!("{line}");
        }
    }
    Ok(())
}

fn print_json<T: Serialize>(payload: &T) -> Result<(), InstallerError> {
    let text = serde_json::to_string_pretty(payload)?;
    println!("{}", text);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn serve_feed_is_hidden_but_parses() {
        let cli = Cli::try_parse_from([
            "myagent-installer",
            "serve-feed",
            "--root",
            "/tmp/feed",
            "--port",
            "8080",
        ])
        .unwrap();
        assert!(matches!(cli.command, Commands::ServeFeed { port: 8080, .. }));
        let help = Cli::command().render_help().to_string();
        assert!(!help.contains("serve-feed"));
    }

    #[test]
    fn global_json_flag_after_subcommand() {
        let cli = Cli::try_parse_from(["myagent-installer", "paths", "--json"]).unwrap();
        assert!(cli.json);
    }
}
