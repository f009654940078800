//! Keep the bot running: forward its output, restart it when it dies.
//!
//! Handles:
//! - Starting the bot with piped output and logging every line
//! - Checking the child on a fixed interval
//! - Restarting after a delay, up to a maximum number of restarts
//! - Polite stop with a forced kill after a timeout on shutdown

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::db::Database;
use crate::launcher::CommandSpec;
use crate::process::ProcessTable;

/// How long to wait for the bot's last output lines after it exits.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Supervisor configuration.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub command: CommandSpec,
    pub install_dir: PathBuf,

    /// Restarts allowed before giving up
    pub max_restarts: u32,

    /// Wait before each restart
    pub restart_delay: Duration,

    /// How often the child is polled
    pub check_interval: Duration,

    /// Grace period between the polite stop and the forced kill
    pub stop_timeout: Duration,
}

/// What to do after the child exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    Restart { attempt: u32 },
    GiveUp,
}

/// Counts restarts against a fixed budget.
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    max_restarts: u32,
    restarts: u32,
}

impl RestartPolicy {
    pub fn new(max_restarts: u32) -> Self {
        Self {
            max_restarts,
            restarts: 0,
        }
    }

    /// Decide after an exit; consumes one restart when restarting.
    pub fn on_exit(&mut self) -> RestartDecision {
        if self.restarts < self.max_restarts {
            self.restarts += 1;
            RestartDecision::Restart {
                attempt: self.restarts,
            }
        } else {
            RestartDecision::GiveUp
        }
    }

    pub fn restarts(&self) -> u32 {
        self.restarts
    }
}

/// How supervision ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorOutcome {
    /// Restart budget exhausted
    GaveUp,

    /// Shutdown requested
    Stopped,
}

/// Summary of one supervisor session.
#[derive(Debug, Clone)]
pub struct SupervisorSummary {
    pub session_id: String,
    pub starts: u32,
    pub restarts: u32,
    pub last_exit_code: Option<i32>,
    pub outcome: SupervisorOutcome,
}

impl fmt::Display for SupervisorSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Supervisor Session ===")?;
        writeln!(f, "Session:   {}", self.session_id)?;
        writeln!(f, "Starts:    {}", self.starts)?;
        writeln!(f, "Restarts:  {}", self.restarts)?;
        writeln!(
            f,
            "Last exit: {}",
            self.last_exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "-".to_string())
        )?;
        writeln!(
            f,
            "Outcome:   {}",
            match self.outcome {
                SupervisorOutcome::GaveUp => "gave up after maximum restarts",
                SupervisorOutcome::Stopped => "stopped",
            }
        )?;
        Ok(())
    }
}

/// Runs and restarts one bot process.
pub struct Supervisor<'a> {
    config: SupervisorConfig,
    processes: &'a dyn ProcessTable,
    journal: Option<&'a Database>,
    session_id: String,
}

impl<'a> Supervisor<'a> {
    pub fn new(
        config: SupervisorConfig,
        processes: &'a dyn ProcessTable,
        journal: Option<&'a Database>,
    ) -> Self {
        Self {
            config,
            processes,
            journal,
            session_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Supervise until the restart budget runs out or `shutdown` resolves.
    pub async fn run<S>(&self, shutdown: S) -> Result<SupervisorSummary>
    where
        S: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        let mut policy = RestartPolicy::new(self.config.max_restarts);
        let mut starts = 0u32;
        let mut last_exit_code = None;

        info!(
            session = %self.session_id,
            command = %self.config.command,
            max_restarts = self.config.max_restarts,
            "Supervisor starting"
        );

        loop {
            match self.spawn() {
                Ok((mut child, forwarders)) => {
                    starts += 1;
                    let pid = child.id();
                    info!(pid = ?pid, "Bot started");
                    self.record("started", pid, None, policy.restarts(), None).await;

                    let mut ticker = interval(self.config.check_interval.max(Duration::from_millis(10)));
                    let exit_code = loop {
                        tokio::select! {
                            _ = &mut shutdown => {
                                info!("Shutdown requested, stopping bot");
                                self.stop(&mut child).await;
                                self.record("stopped", pid, None, policy.restarts(), None).await;
                                return Ok(self.summary(starts, policy.restarts(), last_exit_code, SupervisorOutcome::Stopped));
                            }
                            _ = ticker.tick() => {
                                let status = child.try_wait().context("Failed to poll bot process")?;
                                if let Some(status) = status {
                                    break status.code();
                                }
                            }
                        }
                    };

                    drain_output(forwarders).await;
                    last_exit_code = exit_code;
                    warn!(pid = ?pid, code = ?exit_code, "Bot process terminated");
                    self.record("exited", pid, exit_code, policy.restarts(), None).await;
                }
                Err(e) => {
                    error!(error = %e, "Failed to start bot");
                    let detail = format!("{:#}", e);
                    self.record("spawn_failed", None, None, policy.restarts(), Some(&detail)).await;
                }
            }

            match policy.on_exit() {
                RestartDecision::Restart { attempt } => {
                    info!(
                        attempt = attempt,
                        max = self.config.max_restarts,
                        "Restarting bot"
                    );
                    self.record("restarting", None, None, attempt, None).await;

                    tokio::select! {
                        _ = &mut shutdown => {
                            info!("Shutdown requested during restart delay");
                            self.record("stopped", None, None, attempt, None).await;
                            return Ok(self.summary(starts, attempt, last_exit_code, SupervisorOutcome::Stopped));
                        }
                        _ = tokio::time::sleep(self.config.restart_delay) => {}
                    }
                }
                RestartDecision::GiveUp => {
                    error!(
                        max = self.config.max_restarts,
                        "Maximum restart attempts reached. Giving up."
                    );
                    self.record("gave_up", None, last_exit_code, policy.restarts(), None).await;
                    return Ok(self.summary(starts, policy.restarts(), last_exit_code, SupervisorOutcome::GaveUp));
                }
            }
        }
    }

    /// Start the bot and the tasks forwarding its output.
    fn spawn(&self) -> Result<(Child, Vec<JoinHandle<()>>)> {
        let mut cmd = self.config.command.to_command(&self.config.install_dir);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn {}", self.config.command))?;

        let mut forwarders = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            forwarders.push(tokio::spawn(forward_lines(stdout, false)));
        }
        if let Some(stderr) = child.stderr.take() {
            forwarders.push(tokio::spawn(forward_lines(stderr, true)));
        }

        Ok((child, forwarders))
    }

    /// Ask the child to exit, then force it after the stop timeout.
    async fn stop(&self, child: &mut Child) {
        if let Some(pid) = child.id() {
            match self.processes.terminate(pid).await {
                Ok(()) => {
                    match tokio::time::timeout(self.config.stop_timeout, child.wait()).await {
                        Ok(Ok(status)) => {
                            info!(code = ?status.code(), "Bot stopped");
                            return;
                        }
                        Ok(Err(e)) => warn!(error = %e, "Failed waiting for bot"),
                        Err(_) => warn!("Bot did not terminate gracefully, forcing..."),
                    }
                }
                Err(e) => debug!(error = %e, "Polite stop failed, forcing"),
            }
        }

        if let Err(e) = child.kill().await {
            warn!(error = %e, "Failed to kill bot");
        } else {
            info!("Bot killed");
        }
    }

    async fn record(
        &self,
        event: &str,
        pid: Option<u32>,
        exit_code: Option<i32>,
        restart_count: u32,
        detail: Option<&str>,
    ) {
        let Some(db) = self.journal else {
            return;
        };
        if let Err(e) = db
            .record_supervisor_event(&self.session_id, event, pid, exit_code, restart_count, detail)
            .await
        {
            warn!(event = event, error = %e, "Failed to journal supervisor event");
        }
    }

    fn summary(
        &self,
        starts: u32,
        restarts: u32,
        last_exit_code: Option<i32>,
        outcome: SupervisorOutcome,
    ) -> SupervisorSummary {
        SupervisorSummary {
            session_id: self.session_id.clone(),
            starts,
            restarts,
            last_exit_code,
            outcome,
        }
    }
}

/// Wait for the forwarders to reach end of output.
///
/// A grandchild holding the pipes open keeps them alive, hence the timeout.
async fn drain_output(forwarders: Vec<JoinHandle<()>>) {
    let drained = tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, futures::future::join_all(forwarders)).await;
    if drained.is_err() {
        debug!("Bot output still open after exit, not waiting for it");
    }
}

/// Log each line the bot prints.
async fn forward_lines<R>(reader: R, is_stderr: bool)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if is_stderr => error!("BOT ERROR: {}", line.trim_end()),
            Ok(Some(line)) => info!("BOT: {}", line.trim_end()),
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "Bot output closed");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use anyhow::anyhow;
    use async_trait::async_trait;

    #[test]
    fn test_restart_policy_budget() {
        let mut policy = RestartPolicy::new(2);
        assert_eq!(policy.on_exit(), RestartDecision::Restart { attempt: 1 });
        assert_eq!(policy.on_exit(), RestartDecision::Restart { attempt: 2 });
        assert_eq!(policy.on_exit(), RestartDecision::GiveUp);
        assert_eq!(policy.on_exit(), RestartDecision::GiveUp);
        assert_eq!(policy.restarts(), 2);
    }

    #[test]
    fn test_zero_restarts_gives_up_immediately() {
        let mut policy = RestartPolicy::new(0);
        assert_eq!(policy.on_exit(), RestartDecision::GiveUp);
    }

    /// Table whose polite stop always fails, so the supervisor must force.
    struct NoTerminate;

    #[async_trait]
    impl ProcessTable for NoTerminate {
        async fn listeners(&self, _port: u16) -> Result<Vec<u32>> {
            Ok(Vec::new())
        }

        async fn is_running(&self, _image: &str) -> Result<bool> {
            Ok(false)
        }

        async fn force_kill(&self, _pid: u32) -> Result<()> {
            Err(anyhow!("unsupported"))
        }

        async fn terminate(&self, _pid: u32) -> Result<()> {
            Err(anyhow!("unsupported"))
        }
    }

    #[cfg(unix)]
    fn config(script: &str, max_restarts: u32) -> SupervisorConfig {
        SupervisorConfig {
            command: CommandSpec::new("sh", ["-c".to_string(), script.to_string()]),
            install_dir: PathBuf::from("."),
            max_restarts,
            restart_delay: Duration::from_millis(0),
            check_interval: Duration::from_millis(10),
            stop_timeout: Duration::from_millis(500),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_gives_up_after_max_restarts() {
        let db = crate::db::tests::temp_db().await;
        let table = NoTerminate;
        let supervisor = Supervisor::new(config("echo hello; exit 3", 2), &table, Some(&db));

        let summary = supervisor.run(std::future::pending::<()>()).await.unwrap();

        assert_eq!(summary.outcome, SupervisorOutcome::GaveUp);
        assert_eq!(summary.starts, 3);
        assert_eq!(summary.restarts, 2);
        assert_eq!(summary.last_exit_code, Some(3));

        let events = db.session_events(supervisor.session_id()).await.unwrap();
        let names: Vec<&str> = events.iter().map(|e| e.event.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "started", "exited", "restarting",
                "started", "exited", "restarting",
                "started", "exited", "gave_up",
            ]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shutdown_stops_running_bot() {
        let table = NoTerminate;
        let supervisor = Supervisor::new(config("sleep 30", 5), &table, None);

        let shutdown = tokio::time::sleep(Duration::from_millis(200));
        let summary = tokio::time::timeout(Duration::from_secs(10), supervisor.run(shutdown))
            .await
            .expect("supervisor must stop on shutdown")
            .unwrap();

        assert_eq!(summary.outcome, SupervisorOutcome::Stopped);
        assert_eq!(summary.starts, 1);
        assert_eq!(summary.restarts, 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_bot_output_reaches_log_file() {
        use tracing_subscriber::prelude::*;

        let path = std::env::temp_dir().join(format!("fxlaunch-deploy-{}.log", Uuid::new_v4()));
        let subscriber = tracing_subscriber::registry().with(crate::logging::file_layer(&path).unwrap());
        // Current-thread runtime, so the forwarding tasks see this subscriber
        let _guard = subscriber.set_default();

        let table = NoTerminate;
        let supervisor = Supervisor::new(
            config("echo signal XAUUSD buy; echo feed lost >&2; exit 1", 0),
            &table,
            None,
        );
        let summary = supervisor.run(std::future::pending::<()>()).await.unwrap();
        assert_eq!(summary.outcome, SupervisorOutcome::GaveUp);

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("BOT: signal XAUUSD buy"));
        assert!(text.contains("BOT ERROR: feed lost"));
        assert!(text.contains("Maximum restart attempts reached"));
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_spawn_failure_counts_as_exit() {
        let table = NoTerminate;
        let config = SupervisorConfig {
            command: CommandSpec::new("fxlaunch-definitely-missing-binary", Vec::new()),
            install_dir: PathBuf::from("."),
            max_restarts: 1,
            restart_delay: Duration::from_millis(0),
            check_interval: Duration::from_millis(10),
            stop_timeout: Duration::from_millis(100),
        };
        let supervisor = Supervisor::new(config, &table, None);

        let summary = supervisor.run(std::future::pending::<()>()).await.unwrap();
        assert_eq!(summary.outcome, SupervisorOutcome::GaveUp);
        assert_eq!(summary.starts, 0);
        assert_eq!(summary.restarts, 1);
    }
}
