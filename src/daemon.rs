use std::fs;
use std::io;
use std::path::Path;
use std::process::{Command, Stdio};

use serde::Serialize;

use crate::paths::InstallPaths;

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status_code == 0
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).trim().to_string()
    }

    fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }
}

/// Subprocess seam for talking to the installed program.
pub trait ProgramRunner {
    fn run(&self, program: &Path, args: &[&str]) -> Result<CommandOutput, io::Error>;
}

pub struct SystemRunner;

impl ProgramRunner for SystemRunner {
    fn run(&self, program: &Path, args: &[&str]) -> Result<CommandOutput, io::Error> {
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()?;
        let status_code = output
            .status
            .code()
            .unwrap_or(if output.status.success() { 0 } else { 1 });
        Ok(CommandOutput {
            status_code,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum StopOutcome {
    Stopped,
    NotStopped { reason: String },
    BinaryAbsent,
}

/// Asks the installed program to stop its background instance.
///
/// Never fails: a daemon that was never started, or a stop command that
/// errors, must not block the uninstall that follows.
pub fn stop_daemon<R: ProgramRunner>(runner: &R, paths: &InstallPaths) -> StopOutcome {
    if !paths.binary_path.is_file() {
        if let Some(pid) = read_pid_file(&paths.pid_file_path) {
            tracing::warn!(
                pid,
                pid_file = %paths.pid_file_path.display(),
                "binary is gone but a pid file remains; the daemon may still be running"
            );
        }
        return StopOutcome::BinaryAbsent;
    }
    match runner.run(&paths.binary_path, &["stop"]) {
        Ok(output) if output.success() => {
            tracing::info!(output = %output.stdout_text(), "daemon stop requested");
            StopOutcome::Stopped
        }
        Ok(output) => {
            let mut reason = output.stderr_text();
            if reason.is_empty() {
                reason = output.stdout_text();
            }
            if reason.is_empty() {
                reason = format!("stop exited with status {}", output.status_code);
            }
            tracing::debug!(%reason, "daemon stop reported nothing to stop");
            StopOutcome::NotStopped { reason }
        }
        Err(err) => {
            tracing::warn!(error = %err, "failed to invoke daemon stop");
            StopOutcome::NotStopped {
                reason: err.to_string(),
            }
        }
    }
}

pub fn query_version<R: ProgramRunner>(runner: &R, binary: &Path) -> Option<String> {
    query(runner, binary, "--version")
}

pub fn query_status<R: ProgramRunner>(runner: &R, binary: &Path) -> Option<String> {
    query(runner, binary, "status")
}

fn query<R: ProgramRunner>(runner: &R, binary: &Path, arg: &str) -> Option<String> {
    if !binary.is_file() {
        return None;
    }
    match runner.run(binary, &[arg]) {
        Ok(output) if output.success() => Some(output.stdout_text()),
        Ok(output) => {
            tracing::debug!(arg, status = output.status_code, "program query failed");
            None
        }
        Err(err) => {
            tracing::debug!(arg, error = %err, "program query could not run");
            None
        }
    }
}

pub fn daemon_reported_running(status: &str) -> bool {
    status.contains("is running") && !status.contains("not running")
}

fn read_pid_file(path: &Path) -> Option<u32> {
    let text = fs::read_to_string(path).ok()?;
    text.trim().parse::<u32>().ok()
}
