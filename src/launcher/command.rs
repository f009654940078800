//! External commands and the runner that starts them.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// An external command line, stored as argv rather than a shell string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,

    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory; relative paths resolve against the install dir
    #[serde(default)]
    pub cwd: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new<I>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().collect(),
            cwd: None,
        }
    }

    /// Build from argv given on the command line (`program arg...`).
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self::new(program.clone(), args.iter().cloned()))
    }

    /// Set the value following `flag`, if the flag is present.
    pub fn replace_flag_value(&mut self, flag: &str, value: &str) {
        if let Some(idx) = self.args.iter().position(|a| a == flag) {
            if let Some(slot) = self.args.get_mut(idx + 1) {
                *slot = value.to_string();
            }
        }
    }

    /// Working directory resolved against `install_dir`.
    pub fn working_dir(&self, install_dir: &Path) -> PathBuf {
        match &self.cwd {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => install_dir.join(dir),
            None => install_dir.to_path_buf(),
        }
    }

    /// A tokio command ready to spawn.
    pub fn to_command(&self, install_dir: &Path) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).current_dir(self.working_dir(install_dir));
        cmd
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            if arg.contains(' ') {
                write!(f, " \"{}\"", arg)?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

/// Result of starting one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    /// Foreground command exited (code is `None` when killed by a signal)
    Exited { code: Option<i32> },

    /// Background command is still running after the grace period
    Running { pid: u32 },

    /// Foreground command was stopped by Ctrl+C
    Interrupted,

    /// Command could not be started
    SpawnFailed { reason: String },
}

impl RunStatus {
    /// Whether this status calls for the fallback command.
    pub fn is_failure(&self) -> bool {
        match self {
            RunStatus::Exited { code } => *code != Some(0),
            RunStatus::SpawnFailed { .. } => true,
            RunStatus::Running { .. } | RunStatus::Interrupted => false,
        }
    }
}

/// Starts server commands, in the foreground or detached.
#[async_trait]
pub trait ServerRunner: Send + Sync {
    /// Run until the command exits or Ctrl+C arrives.
    async fn run_foreground(&self, spec: &CommandSpec, install_dir: &Path) -> RunStatus;

    /// Spawn detached and report its state after `grace`.
    async fn spawn_detached(&self, spec: &CommandSpec, install_dir: &Path, grace: Duration) -> RunStatus;
}

/// Runner that starts real OS processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsRunner;

#[cfg(windows)]
const CREATE_NEW_CONSOLE: u32 = 0x0000_0010;

#[async_trait]
impl ServerRunner for OsRunner {
    async fn run_foreground(&self, spec: &CommandSpec, install_dir: &Path) -> RunStatus {
        info!(command = %spec, "Starting in foreground");

        let mut child = match spec.to_command(install_dir).kill_on_drop(true).spawn() {
            Ok(child) => child,
            Err(e) => {
                return RunStatus::SpawnFailed {
                    reason: format!("{}: {}", spec.program, e),
                }
            }
        };

        tokio::select! {
            status = child.wait() => match status {
                Ok(status) => RunStatus::Exited { code: status.code() },
                Err(e) => RunStatus::SpawnFailed { reason: format!("wait failed: {}", e) },
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, stopping foreground process");
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "Failed to kill foreground process");
                }
                RunStatus::Interrupted
            }
        }
    }

    async fn spawn_detached(&self, spec: &CommandSpec, install_dir: &Path, grace: Duration) -> RunStatus {
        info!(command = %spec, "Starting in background");

        let mut cmd = spec.to_command(install_dir);
        cmd.stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::null());
        #[cfg(windows)]
        cmd.creation_flags(CREATE_NEW_CONSOLE);
        // Own process group: Ctrl+C and hangups aimed at the launcher's group miss it
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return RunStatus::SpawnFailed {
                    reason: format!("{}: {}", spec.program, e),
                }
            }
        };

        let Some(pid) = child.id() else {
            return RunStatus::Exited { code: None };
        };

        tokio::time::sleep(grace).await;

        match child.try_wait() {
            Ok(Some(status)) => RunStatus::Exited { code: status.code() },
            Ok(None) => {
                debug!(pid = pid, "Background process alive after grace period");
                RunStatus::Running { pid }
            }
            Err(e) => {
                warn!(pid = pid, error = %e, "Could not poll background process");
                RunStatus::Running { pid }
            }
        }
    }
}

/// Run `spec` and, if it fails, `fallback` exactly once.
///
/// Returns the final status and whether the fallback ran.
pub async fn run_with_fallback<R: ServerRunner + ?Sized>(
    runner: &R,
    spec: &CommandSpec,
    fallback: Option<&CommandSpec>,
    install_dir: &Path,
    background: Option<Duration>,
) -> (RunStatus, bool) {
    let start = |cmd: &CommandSpec| {
        let cmd = cmd.clone();
        async move {
            match background {
                Some(grace) => runner.spawn_detached(&cmd, install_dir, grace).await,
                None => runner.run_foreground(&cmd, install_dir).await,
            }
        }
    };

    let status = start(spec).await;
    if !status.is_failure() {
        return (status, false);
    }

    let Some(fallback) = fallback else {
        warn!(command = %spec, status = ?status, "Start command failed, no fallback configured");
        return (status, false);
    };

    warn!(command = %spec, status = ?status, fallback = %fallback, "Start command failed, trying fallback");
    (start(fallback).await, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_quotes_spaces() {
        let spec = CommandSpec::new("python", ["my server.py".to_string(), "--port".to_string(), "8000".to_string()]);
        assert_eq!(spec.to_string(), "python \"my server.py\" --port 8000");
    }

    #[test]
    fn test_from_argv() {
        assert!(CommandSpec::from_argv(&[]).is_none());
        let spec = CommandSpec::from_argv(&["node".to_string(), "server.js".to_string()]).unwrap();
        assert_eq!(spec.program, "node");
        assert_eq!(spec.args, vec!["server.js"]);
    }

    #[test]
    fn test_working_dir() {
        let base = Path::new("/opt/bot");
        let mut spec = CommandSpec::new("python", Vec::new());
        assert_eq!(spec.working_dir(base), PathBuf::from("/opt/bot"));
        spec.cwd = Some(PathBuf::from("mcp-metatrader5-server"));
        assert_eq!(spec.working_dir(base), PathBuf::from("/opt/bot/mcp-metatrader5-server"));
    }

    #[test]
    fn test_failure_classification() {
        assert!(RunStatus::Exited { code: Some(1) }.is_failure());
        assert!(RunStatus::Exited { code: None }.is_failure());
        assert!(RunStatus::SpawnFailed { reason: "x".into() }.is_failure());
        assert!(!RunStatus::Exited { code: Some(0) }.is_failure());
        assert!(!RunStatus::Running { pid: 1 }.is_failure());
        assert!(!RunStatus::Interrupted.is_failure());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_os_runner_foreground_exit_code() {
        let spec = CommandSpec::new("sh", ["-c".to_string(), "exit 3".to_string()]);
        let status = OsRunner.run_foreground(&spec, Path::new(".")).await;
        assert_eq!(status, RunStatus::Exited { code: Some(3) });
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_os_runner_missing_program() {
        let spec = CommandSpec::new("fxlaunch-definitely-missing-binary", Vec::new());
        let status = OsRunner.run_foreground(&spec, Path::new(".")).await;
        assert!(matches!(status, RunStatus::SpawnFailed { .. }));
    }

    #[cfg(unix)]
    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("sh", ["-c".to_string(), script.to_string()])
    }

    #[cfg(unix)]
    async fn kill(pid: u32) {
        use crate::process::{ProcessTable, SystemProcessTable};
        let _ = SystemProcessTable::new().force_kill(pid).await;
    }

    /// Process group id from `/proc/<pid>/stat`.
    #[cfg(target_os = "linux")]
    fn pgid(pid: u32) -> u32 {
        let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).unwrap();
        let after_name = &stat[stat.rfind(')').unwrap() + 1..];
        // state, ppid, pgrp
        after_name.split_whitespace().nth(2).unwrap().parse().unwrap()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_background_still_running_after_grace() {
        let status = OsRunner
            .spawn_detached(&sh("sleep 5"), Path::new("."), Duration::from_millis(200))
            .await;
        let RunStatus::Running { pid } = status else {
            panic!("expected a running background process, got {:?}", status);
        };
        kill(pid).await;
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_background_gets_own_process_group() {
        let status = OsRunner
            .spawn_detached(&sh("sleep 5"), Path::new("."), Duration::from_millis(200))
            .await;
        let RunStatus::Running { pid } = status else {
            panic!("expected a running background process, got {:?}", status);
        };

        let child_group = pgid(pid);
        let own_group = pgid(std::process::id());
        kill(pid).await;

        assert_eq!(child_group, pid);
        assert_ne!(child_group, own_group);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_background_nonzero_exit_tries_fallback() {
        let (status, used_fallback) = run_with_fallback(
            &OsRunner,
            &sh("exit 1"),
            Some(&sh("sleep 5")),
            Path::new("."),
            Some(Duration::from_millis(300)),
        )
        .await;

        assert!(used_fallback);
        let RunStatus::Running { pid } = status else {
            panic!("expected the fallback to be running, got {:?}", status);
        };
        kill(pid).await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_background_zero_exit_is_not_retried() {
        let (status, used_fallback) = run_with_fallback(
            &OsRunner,
            &sh("exit 0"),
            Some(&sh("exit 0")),
            Path::new("."),
            Some(Duration::from_millis(300)),
        )
        .await;

        assert!(!used_fallback);
        assert_eq!(status, RunStatus::Exited { code: Some(0) });
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_os_runner_fallback_after_failure() {
        let primary = CommandSpec::new("sh", ["-c".to_string(), "exit 1".to_string()]);
        let fallback = CommandSpec::new("sh", ["-c".to_string(), "exit 0".to_string()]);
        let (status, used_fallback) =
            run_with_fallback(&OsRunner, &primary, Some(&fallback), Path::new("."), None).await;
        assert!(used_fallback);
        assert_eq!(status, RunStatus::Exited { code: Some(0) });
    }
}
