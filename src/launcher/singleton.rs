//! Ensure a single server owns a port, then start a fresh one on it.
//!
//! Sequence:
//! 1. Optionally check that a required process (the trading terminal) is
//!    alive; if not, warn and wait for the operator, never abort
//! 2. Find every process bound to the port
//! 3. Force-kill each one, ignoring failures
//! 4. Start the server in the foreground or detached, with one fallback

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use futures::future::join_all;
use tracing::{debug, info, warn};

use super::command::{run_with_fallback, CommandSpec, RunStatus, ServerRunner};
use crate::operator::Operator;
use crate::process::ProcessTable;

/// How the server is started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartMode {
    /// Block until the server exits
    Foreground,

    /// Detach and return once the grace period has passed
    Background { grace: Duration },
}

impl StartMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StartMode::Foreground => "foreground",
            StartMode::Background { .. } => "background",
        }
    }
}

/// Everything one launch needs.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    /// Label used in logs and the journal ("mcp-server", "bot")
    pub name: String,

    /// Address the server binds, recorded in the journal
    pub host: String,
    pub port: u16,
    pub command: CommandSpec,
    pub fallback: Option<CommandSpec>,
    pub install_dir: PathBuf,
    pub mode: StartMode,

    /// Image name that must be running first, if any
    pub require_process: Option<String>,

    /// Clear the port before starting
    pub clear_port: bool,
}

/// Final state of a launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchOutcome {
    Exited { code: Option<i32> },
    Detached { pid: u32 },
    Interrupted,
    Failed { reason: String },
}

impl LaunchOutcome {
    pub fn is_success(&self) -> bool {
        match self {
            LaunchOutcome::Exited { code } => *code == Some(0),
            LaunchOutcome::Detached { .. } | LaunchOutcome::Interrupted => true,
            LaunchOutcome::Failed { .. } => false,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        match self {
            LaunchOutcome::Detached { pid } => Some(*pid),
            _ => None,
        }
    }

    /// Short label stored in the journal.
    pub fn label(&self) -> String {
        match self {
            LaunchOutcome::Exited { code: Some(code) } => format!("exited({})", code),
            LaunchOutcome::Exited { code: None } => "exited(signal)".to_string(),
            LaunchOutcome::Detached { pid } => format!("detached({})", pid),
            LaunchOutcome::Interrupted => "interrupted".to_string(),
            LaunchOutcome::Failed { reason } => format!("failed: {}", reason),
        }
    }
}

impl From<RunStatus> for LaunchOutcome {
    fn from(status: RunStatus) -> Self {
        match status {
            RunStatus::Exited { code } => LaunchOutcome::Exited { code },
            RunStatus::Running { pid } => LaunchOutcome::Detached { pid },
            RunStatus::Interrupted => LaunchOutcome::Interrupted,
            RunStatus::SpawnFailed { reason } => LaunchOutcome::Failed { reason },
        }
    }
}

/// What a launch did.
#[derive(Debug, Clone)]
pub struct LaunchReport {
    pub name: String,
    pub port: u16,

    /// `None` when no check was requested or the check itself failed
    pub dependency_running: Option<bool>,

    /// PIDs found on the port before starting
    pub occupants: Vec<u32>,

    /// PIDs successfully killed
    pub killed: Vec<u32>,

    /// PIDs whose kill failed (usually already gone)
    pub kill_failures: Vec<u32>,

    pub used_fallback: bool,

    /// PIDs on the port after a background start
    pub listeners_after: Option<Vec<u32>>,

    pub outcome: LaunchOutcome,
}

impl LaunchReport {
    pub fn new(name: &str, port: u16) -> Self {
        Self {
            name: name.to_string(),
            port,
            dependency_running: None,
            occupants: Vec::new(),
            killed: Vec::new(),
            kill_failures: Vec::new(),
            used_fallback: false,
            listeners_after: None,
            outcome: LaunchOutcome::Exited { code: None },
        }
    }
}

impl fmt::Display for LaunchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Launch: {} (port {}) ===", self.name, self.port)?;
        let dependency = match self.dependency_running {
            Some(true) => "running",
            Some(false) => "NOT running",
            None => "not checked",
        };
        writeln!(f, "Dependency:     {}", dependency)?;
        writeln!(f, "Port occupants: {:?}", self.occupants)?;
        writeln!(f, "Killed:         {:?}", self.killed)?;
        if !self.kill_failures.is_empty() {
            writeln!(f, "Kill failures:  {:?}", self.kill_failures)?;
        }
        writeln!(f, "Fallback used:  {}", if self.used_fallback { "Yes" } else { "No" })?;
        if let Some(after) = &self.listeners_after {
            writeln!(f, "Listeners now:  {:?}", after)?;
        }
        writeln!(f, "Outcome:        {}", self.outcome.label())?;
        Ok(())
    }
}

/// Launch sequence shared by every entry point.
pub struct SingletonLauncher<'a> {
    processes: &'a dyn ProcessTable,
    runner: &'a dyn ServerRunner,
    operator: &'a dyn Operator,
}

impl<'a> SingletonLauncher<'a> {
    pub fn new(
        processes: &'a dyn ProcessTable,
        runner: &'a dyn ServerRunner,
        operator: &'a dyn Operator,
    ) -> Self {
        Self {
            processes,
            runner,
            operator,
        }
    }

    /// Run the full sequence for one server.
    pub async fn launch(&self, request: &LaunchRequest) -> LaunchReport {
        let mut report = LaunchReport::new(&request.name, request.port);

        info!(
            name = %request.name,
            port = request.port,
            mode = request.mode.as_str(),
            "Launching"
        );

        if let Some(image) = &request.require_process {
            report.dependency_running = self.check_dependency(image).await;
        }

        if request.clear_port {
            let (occupants, killed, failures) = self.clear_port(request.port).await;
            if !killed.is_empty() {
                self.operator.notice(&format!(
                    "Stopped {} process(es) on port {}",
                    killed.len(),
                    request.port
                ));
            }
            report.occupants = occupants;
            report.killed = killed;
            report.kill_failures = failures;
        }

        let background = match request.mode {
            StartMode::Foreground => None,
            StartMode::Background { grace } => Some(grace),
        };

        let (status, used_fallback) = run_with_fallback(
            self.runner,
            &request.command,
            request.fallback.as_ref(),
            &request.install_dir,
            background,
        )
        .await;
        report.used_fallback = used_fallback;
        report.outcome = status.into();

        if let LaunchOutcome::Detached { pid } = report.outcome {
            report.listeners_after = self.verify_singleton(request.port, pid).await;
        }

        if background.is_some() && report.outcome == (LaunchOutcome::Exited { code: Some(0) }) {
            warn!(name = %request.name, "Background process exited during the grace period");
            self.operator.warn(&format!(
                "{} exited with code 0 right after starting and is not running",
                request.name
            ));
        } else if !report.outcome.is_success() {
            self.operator.warn(&format!(
                "{} did not start cleanly: {}",
                request.name,
                report.outcome.label()
            ));
        }

        report
    }

    /// Kill everything bound to `port`. Returns (occupants, killed, failed).
    pub async fn clear_port(&self, port: u16) -> (Vec<u32>, Vec<u32>, Vec<u32>) {
        let own_pid = std::process::id();

        let occupants = match self.processes.listeners(port).await {
            Ok(pids) => pids,
            Err(e) => {
                warn!(port = port, error = %e, "Could not list port owners, assuming none");
                return (Vec::new(), Vec::new(), Vec::new());
            }
        };

        let targets: Vec<u32> = occupants.iter().copied().filter(|pid| *pid != own_pid).collect();
        if targets.is_empty() {
            debug!(port = port, "Port is free");
            return (occupants, Vec::new(), Vec::new());
        }

        info!(port = port, pids = ?targets, "Killing processes bound to port");

        let results = join_all(targets.iter().map(|pid| self.processes.force_kill(*pid))).await;

        let mut killed = Vec::new();
        let mut failures = Vec::new();
        for (pid, result) in targets.into_iter().zip(results) {
            match result {
                Ok(()) => killed.push(pid),
                Err(e) => {
                    // The process may have exited between listing and killing
                    debug!(pid = pid, error = %e, "Kill failed, ignoring");
                    failures.push(pid);
                }
            }
        }

        (occupants, killed, failures)
    }

    async fn check_dependency(&self, image: &str) -> Option<bool> {
        match self.processes.is_running(image).await {
            Ok(true) => {
                debug!(image = image, "Required process is running");
                Some(true)
            }
            Ok(false) => {
                self.operator.warn(&format!(
                    "{} is not running. Start and log in to MetaTrader 5 first.",
                    image
                ));
                self.operator
                    .acknowledge("Press Enter to continue anyway...")
                    .await;
                Some(false)
            }
            Err(e) => {
                self.operator
                    .warn(&format!("Could not check whether {} is running: {}", image, e));
                None
            }
        }
    }

    async fn verify_singleton(&self, port: u16, pid: u32) -> Option<Vec<u32>> {
        match self.processes.listeners(port).await {
            Ok(pids) => {
                if pids.len() > 1 {
                    warn!(port = port, pids = ?pids, "More than one process bound to port");
                } else if pids.is_empty() {
                    debug!(port = port, pid = pid, "Server not listening yet");
                }
                Some(pids)
            }
            Err(e) => {
                debug!(error = %e, "Could not verify port owners");
                None
            }
        }
    }
}
